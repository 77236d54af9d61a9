//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT, DEEPGRAM_API_KEY, TWILIO_ACCOUNT_SID, TWILIO_AUTH_TOKEN)
//! 2. Environment variables (APP_SERVER__PORT, APP_AUDIO__FRAME_SIZE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Why a double underscore:
//! Nested keys are separated by `__` so that snake_case field names survive:
//! `APP_SPEECH__CONNECT_TIMEOUT_SECS` becomes `speech.connect_timeout_secs`.

use crate::audio::processor::{FragmentFilterConfig, NoiseGateConfig};
use crate::relay::functions::FunctionRegistry;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub speech: SpeechConfig,
    pub audio: AudioConfig,
    pub telephony: TelephonyConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address to bind to (`0.0.0.0` in production)
/// - `port`: TCP port to listen on
/// - `public_host`: Host name the telephony provider uses to reach this server
///   (goes into the TwiML stream URL). Empty means "use the request's Host header".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_host: String,
}

/// Speech agent connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// WebSocket endpoint of the speech-to-speech agent
    pub url: String,

    /// API key sent as `Authorization: Token <key>`
    pub api_key: String,

    /// Optional path to a JSON file holding the agent settings message
    pub settings_file: Option<String>,

    /// How long the speech peer has to open before the call is dropped
    pub connect_timeout_secs: u64,

    /// Interval for keep-alive messages to the agent (0 disables them)
    pub keepalive_interval_secs: u64,
}

/// Audio framing and noise gate settings.
///
/// ## Reference values:
/// - 3200-byte frames (20 × 160 bytes of 16-bit PCM)
/// - Gate ratio 0.005 with an absolute floor of 100
/// - Fragments under 20 bytes, or whose first 100 bytes are zero, are discarded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub frame_size: usize,
    pub noise_gate_enabled: bool,
    pub noise_threshold_ratio: f64,
    pub minimum_floor: f64,
    pub min_fragment_bytes: usize,
    pub silence_window_bytes: usize,
}

/// Telephony provider REST credentials (used only to place outbound calls).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub api_base: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                public_host: String::new(),
            },
            speech: SpeechConfig {
                url: "wss://agent.deepgram.com/v1/agent/converse".to_string(),
                api_key: String::new(),
                settings_file: None,
                connect_timeout_secs: 30,
                keepalive_interval_secs: 8,
            },
            audio: AudioConfig {
                frame_size: 3200,
                noise_gate_enabled: true,
                noise_threshold_ratio: 0.005,
                minimum_floor: 100.0,
                min_fragment_bytes: 20,
                silence_window_bytes: 100,
            },
            telephony: TelephonyConfig {
                account_sid: String::new(),
                auth_token: String::new(),
                api_base: "https://api.twilio.com".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle platform variables that don't follow the APP_ convention
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let platform_overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("PUBLIC_HOST", "server.public_host"),
            ("DEEPGRAM_API_KEY", "speech.api_key"),
            ("TWILIO_ACCOUNT_SID", "telephony.account_sid"),
            ("TWILIO_AUTH_TOKEN", "telephony.auth_token"),
        ];
        for (var, key) in platform_overrides {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Frame size is a positive whole number of 16-bit samples
    /// - Gate ratio is within [0, 1] and the floor is not negative
    /// - The speech peer gets a non-zero connection timeout
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.frame_size == 0 || self.audio.frame_size % 2 != 0 {
            return Err(anyhow::anyhow!(
                "Frame size must be a positive, even number of bytes (got {})",
                self.audio.frame_size
            ));
        }

        if !(0.0..=1.0).contains(&self.audio.noise_threshold_ratio) {
            return Err(anyhow::anyhow!("Noise threshold ratio must be between 0 and 1"));
        }

        if self.audio.minimum_floor < 0.0 {
            return Err(anyhow::anyhow!("Noise gate floor cannot be negative"));
        }

        if self.speech.connect_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Speech connect timeout must be greater than 0"));
        }

        if self.speech.url.is_empty() {
            return Err(anyhow::anyhow!("Speech agent URL must be set"));
        }

        Ok(())
    }

    /// Load the agent settings message sent to the speech peer on connect.
    ///
    /// A settings file is used verbatim. Without one, the built-in settings are used
    /// and every registered function is advertised to the agent.
    pub fn load_agent_settings(&self, functions: &FunctionRegistry) -> Result<Value> {
        match &self.speech.settings_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read agent settings file {}", path))?;
                let settings: Value = serde_json::from_str(&raw)
                    .with_context(|| format!("Agent settings file {} is not valid JSON", path))?;
                Ok(settings)
            }
            None => {
                let mut settings = default_agent_settings();
                if !functions.is_empty() {
                    settings["agent"]["think"]["functions"] = Value::Array(functions.definitions());
                }
                Ok(settings)
            }
        }
    }

    /// Update audio and speech timing settings from a partial JSON document.
    ///
    /// ## Partial updates:
    /// Only the provided fields change, e.g. `{"audio": {"noise_gate_enabled": false}}`.
    /// Calls already in progress keep the settings they started with.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: Value = serde_json::from_str(json_str)?;

        if let Some(audio) = partial.get("audio") {
            if let Some(v) = audio.get("frame_size").and_then(Value::as_u64) {
                self.audio.frame_size = v as usize;
            }
            if let Some(v) = audio.get("noise_gate_enabled").and_then(Value::as_bool) {
                self.audio.noise_gate_enabled = v;
            }
            if let Some(v) = audio.get("noise_threshold_ratio").and_then(Value::as_f64) {
                self.audio.noise_threshold_ratio = v;
            }
            if let Some(v) = audio.get("minimum_floor").and_then(Value::as_f64) {
                self.audio.minimum_floor = v;
            }
            if let Some(v) = audio.get("min_fragment_bytes").and_then(Value::as_u64) {
                self.audio.min_fragment_bytes = v as usize;
            }
            if let Some(v) = audio.get("silence_window_bytes").and_then(Value::as_u64) {
                self.audio.silence_window_bytes = v as usize;
            }
        }

        if let Some(speech) = partial.get("speech") {
            if let Some(v) = speech.get("connect_timeout_secs").and_then(Value::as_u64) {
                self.speech.connect_timeout_secs = v;
            }
            if let Some(v) = speech.get("keepalive_interval_secs").and_then(Value::as_u64) {
                self.speech.keepalive_interval_secs = v;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Configuration as JSON with credentials masked (for the config endpoint).
    pub fn redacted(&self) -> Value {
        json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port,
                "public_host": self.server.public_host,
            },
            "speech": {
                "url": self.speech.url,
                "api_key": mask(&self.speech.api_key),
                "settings_file": self.speech.settings_file,
                "connect_timeout_secs": self.speech.connect_timeout_secs,
                "keepalive_interval_secs": self.speech.keepalive_interval_secs,
            },
            "audio": self.audio,
            "telephony": {
                "account_sid": self.telephony.account_sid,
                "auth_token": mask(&self.telephony.auth_token),
                "api_base": self.telephony.api_base,
            },
        })
    }
}

impl SpeechConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0)
            .then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}

impl AudioConfig {
    pub fn to_gate_config(&self) -> NoiseGateConfig {
        NoiseGateConfig {
            threshold_ratio: self.noise_threshold_ratio,
            minimum_floor: self.minimum_floor,
        }
    }

    pub fn to_filter_config(&self) -> FragmentFilterConfig {
        FragmentFilterConfig {
            min_fragment_bytes: self.min_fragment_bytes,
            silence_window_bytes: self.silence_window_bytes,
        }
    }
}

fn mask(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "********"
    }
}

/// Built-in agent settings: 16-bit linear PCM at 8 kHz in both directions.
fn default_agent_settings() -> Value {
    json!({
        "type": "Settings",
        "audio": {
            "input": {"encoding": "linear16", "sample_rate": 8000},
            "output": {"encoding": "linear16", "sample_rate": 8000, "container": "none"}
        },
        "agent": {
            "language": "en",
            "listen": {"provider": {"type": "deepgram", "model": "nova-3"}},
            "think": {
                "provider": {"type": "open_ai", "model": "gpt-4o-mini"},
                "prompt": "You are a friendly phone assistant. Keep answers short and conversational."
            },
            "speak": {"provider": {"type": "deepgram", "model": "aura-2-thalia-en"}},
            "greeting": "Hello! How can I help you today?"
        }
    })
}
