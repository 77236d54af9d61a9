//! # Call Session State
//!
//! Tracks the stream identity and lifecycle phase of one telephony media
//! connection. One `CallSession` is created when the telephony WebSocket is
//! accepted and dropped when it closes; nothing here is shared between calls.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: Socket accepted, no event seen yet
//! 2. **Connected**: Provider reported the transport as connected
//! 3. **Streaming**: Stream started, `stream_sid` is known
//! 4. **Stopped**: Stream stopped, `stream_sid` cleared
//!
//! A stopped stream may start again on the same socket.

use chrono::{DateTime, Utc};

/// Lifecycle phase of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// No event received yet
    Idle,
    /// Transport connected, stream not started
    Connected,
    /// Stream started, audio flows
    Streaming,
    /// Stream stopped
    Stopped,
}

impl CallPhase {
    /// Convert phase to string for logs and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::Connected => "connected",
            CallPhase::Streaming => "streaming",
            CallPhase::Stopped => "stopped",
        }
    }
}

/// State of one telephony media stream.
#[derive(Debug)]
pub struct CallSession {
    /// Identifier of the accepted telephony connection (for logs)
    pub connection_id: String,

    /// When the telephony connection was accepted
    pub created_at: DateTime<Utc>,

    phase: CallPhase,

    /// Provider stream identifier, only set while streaming
    stream_sid: Option<String>,

    /// Recognized control and media events since the socket opened
    message_count: u64,

    /// Media events accepted for the current stream
    media_count: u64,
}

impl CallSession {
    /// Create a new session in the `Idle` phase.
    pub fn new(connection_id: String) -> Self {
        Self {
            connection_id,
            created_at: Utc::now(),
            phase: CallPhase::Idle,
            stream_sid: None,
            message_count: 0,
            media_count: 0,
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    pub fn media_count(&self) -> u64 {
        self.media_count
    }

    /// Whether inbound media should currently be processed.
    pub fn is_streaming(&self) -> bool {
        self.phase == CallPhase::Streaming
    }

    /// Handle a `connected` event.
    ///
    /// ## State Transition:
    /// any → Connected
    pub fn on_connected(&mut self) {
        self.message_count += 1;
        self.phase = CallPhase::Connected;
        tracing::debug!(connection_id = %self.connection_id, "Telephony transport connected");
    }

    /// Handle a `start` event.
    ///
    /// ## State Transition:
    /// any → Streaming, only when a stream identifier is present. Without one the
    /// session stays in its prior phase.
    ///
    /// ## Returns:
    /// `true` if the session is now streaming.
    pub fn on_start(&mut self, stream_sid: Option<String>) -> bool {
        self.message_count += 1;

        match stream_sid.filter(|sid| !sid.is_empty()) {
            Some(sid) => {
                tracing::info!(
                    connection_id = %self.connection_id,
                    stream_sid = %sid,
                    "Media stream started"
                );
                self.stream_sid = Some(sid);
                self.media_count = 0;
                self.phase = CallPhase::Streaming;
                true
            }
            None => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    phase = self.phase.as_str(),
                    "Start event without a stream identifier, ignoring"
                );
                false
            }
        }
    }

    /// Handle a `media` event.
    ///
    /// ## Returns:
    /// `true` if the media should be processed (session is streaming).
    pub fn on_media(&mut self) -> bool {
        self.message_count += 1;

        if self.is_streaming() {
            self.media_count += 1;
            true
        } else {
            tracing::debug!(
                connection_id = %self.connection_id,
                phase = self.phase.as_str(),
                "Media outside of a stream, ignoring"
            );
            false
        }
    }

    /// Handle a `stop` event.
    ///
    /// ## State Transition:
    /// any → Stopped, stream identifier and per-stream counters cleared.
    pub fn on_stop(&mut self) {
        self.message_count += 1;

        tracing::info!(
            connection_id = %self.connection_id,
            stream_sid = self.stream_sid.as_deref().unwrap_or("-"),
            media_events = self.media_count,
            "Media stream stopped"
        );

        self.stream_sid = None;
        self.media_count = 0;
        self.phase = CallPhase::Stopped;
    }
}
