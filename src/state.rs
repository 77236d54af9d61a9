//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every call supervisor.
//!
//! ## What lives here (and what does not):
//! - **Here**: configuration, the function dispatch table, the agent settings blob,
//!   the outbound HTTP client and process-wide relay counters
//! - **Not here**: anything belonging to one call. Frame buffers, stream identity and
//!   per-call counters are owned by that call's supervisor and die with it
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets every handler and every session hold the same data
//! - **Cheap clones**: Cloning `AppState` only bumps reference counts
//!
//! ### Atomics instead of locks for counters
//! - **Purpose**: Relay counters are bumped on every audio frame; `AtomicU64` makes
//!   that a single instruction with no lock to contend on
//! - **Ordering::Relaxed**: Counters are independent statistics, so no cross-counter
//!   ordering is needed

use crate::config::AppConfig;
use crate::relay::functions::FunctionRegistry;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across handlers and sessions.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (audio settings can be updated at runtime;
    /// new calls pick up the change, running calls keep their settings)
    pub config: Arc<RwLock<AppConfig>>,

    /// Process-wide relay counters
    pub metrics: Arc<RelayMetrics>,

    /// Function dispatch table, immutable after startup
    pub functions: Arc<FunctionRegistry>,

    /// Agent configuration sent as the first speech-peer message of every call
    pub agent_settings: Arc<Value>,

    /// HTTP client for the telephony provider's REST API
    pub http: reqwest::Client,

    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    /// Create a new AppState.
    pub fn new(config: AppConfig, functions: FunctionRegistry, agent_settings: Value) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RelayMetrics::default()),
            functions: Arc::new(functions),
            agent_settings: Arc::new(agent_settings),
            http: reqwest::Client::new(),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately. A poisoned lock still holds a valid
    /// config (writers only ever swap in a validated value), so it is recovered.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
        Ok(())
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Counters describing relay activity across all calls.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    active_sessions: AtomicU64,
    total_sessions: AtomicU64,
    frames_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
    frames_silent: AtomicU64,
    fragments_rejected: AtomicU64,
    audio_chunks_relayed: AtomicU64,
    audio_chunks_dropped: AtomicU64,
    clear_messages: AtomicU64,
    function_calls: AtomicU64,
    function_errors: AtomicU64,
    malformed_messages: AtomicU64,
}

impl RelayMetrics {
    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Underflow-safe: a stray extra close leaves the gauge at zero.
    pub fn session_closed(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn frame_forwarded(&self) {
        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_silent(&self) {
        self.frames_silent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragment_rejected(&self) {
        self.fragments_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audio_chunk_relayed(&self) {
        self.audio_chunks_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audio_chunk_dropped(&self) {
        self.audio_chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear_sent(&self) {
        self.clear_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn function_called(&self, failed: bool) {
        self.function_calls.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.function_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter (for the metrics endpoint).
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            active_sessions: load(&self.active_sessions),
            total_sessions: load(&self.total_sessions),
            frames_forwarded: load(&self.frames_forwarded),
            frames_dropped: load(&self.frames_dropped),
            frames_silent: load(&self.frames_silent),
            fragments_rejected: load(&self.fragments_rejected),
            audio_chunks_relayed: load(&self.audio_chunks_relayed),
            audio_chunks_dropped: load(&self.audio_chunks_dropped),
            clear_messages: load(&self.clear_messages),
            function_calls: load(&self.function_calls),
            function_errors: load(&self.function_errors),
            malformed_messages: load(&self.malformed_messages),
        }
    }
}

/// Serializable copy of [`RelayMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub active_sessions: u64,
    pub total_sessions: u64,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub frames_silent: u64,
    pub fragments_rejected: u64,
    pub audio_chunks_relayed: u64,
    pub audio_chunks_dropped: u64,
    pub clear_messages: u64,
    pub function_calls: u64,
    pub function_errors: u64,
    pub malformed_messages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_gauge_never_underflows() {
        let metrics = RelayMetrics::default();
        metrics.session_opened();
        metrics.session_closed();
        metrics.session_closed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_sessions, 0);
        assert_eq!(snapshot.total_sessions, 1);
    }

    #[test]
    fn test_function_error_counter() {
        let metrics = RelayMetrics::default();
        metrics.function_called(false);
        metrics.function_called(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.function_calls, 2);
        assert_eq!(snapshot.function_errors, 1);
    }

    #[test]
    fn test_update_config_rejects_invalid_values() {
        let state = AppState::new(AppConfig::default(), FunctionRegistry::default(), Value::Null);

        let mut bad = state.get_config();
        bad.audio.frame_size = 0;
        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().audio.frame_size, 3200);

        let mut good = state.get_config();
        good.audio.frame_size = 640;
        assert!(state.update_config(good).is_ok());
        assert_eq!(state.get_config().audio.frame_size, 640);
    }
}
