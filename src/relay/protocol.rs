//! # Wire Protocol Types
//!
//! Message shapes exchanged with both WebSocket peers.
//!
//! ## Telephony Peer (JSON text frames):
//! - **Inbound**: `connected`, `start`, `media`, `stop`
//! - **Outbound**: `media` (agent audio), `clear` (drop queued playback)
//!
//! ## Speech Peer:
//! - **Inbound**: JSON control objects with a `type` discriminator, or raw PCM audio
//! - **Outbound**: raw PCM frames, the agent settings blob, `FunctionCallResponse`

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw shape of any telephony message, before it is classified.
#[derive(Debug, Deserialize)]
struct RawTelephonyMessage {
    #[serde(default)]
    event: Option<String>,
    #[serde(default, rename = "streamSid")]
    stream_sid: Option<String>,
    #[serde(default)]
    start: Option<StartPayload>,
    #[serde(default)]
    media: Option<MediaPayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartPayload {
    #[serde(default, rename = "streamSid")]
    pub stream_sid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded audio
    pub payload: String,
    /// `inbound` (caller) or `outbound` (echo of what we played)
    #[serde(default)]
    pub track: Option<String>,
}

impl MediaPayload {
    /// Caller audio is on the inbound track; a missing track is treated as inbound.
    pub fn is_inbound(&self) -> bool {
        match self.track.as_deref() {
            None | Some("inbound") => true,
            Some(_) => false,
        }
    }
}

/// Classified telephony event.
#[derive(Debug, Clone)]
pub enum TelephonyEvent {
    Connected,
    Start { stream_sid: Option<String> },
    Media(MediaPayload),
    Stop,
    /// Event types this bridge does not handle (e.g. `mark`, `dtmf`)
    Unknown(String),
}

impl TelephonyEvent {
    /// Parse one telephony text frame.
    ///
    /// ## Errors:
    /// Returns the JSON error for frames that are not valid JSON objects. A `media`
    /// event without a media payload is also reported as an error.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawTelephonyMessage = serde_json::from_str(text)?;

        let event = match raw.event.as_deref() {
            Some("connected") => TelephonyEvent::Connected,
            Some("start") => TelephonyEvent::Start {
                // The stream identifier lives in the start block; fall back to the top level
                stream_sid: raw
                    .start
                    .and_then(|start| start.stream_sid)
                    .or(raw.stream_sid),
            },
            Some("media") => match raw.media {
                Some(media) => TelephonyEvent::Media(media),
                None => {
                    return Err(serde::de::Error::missing_field("media"));
                }
            },
            Some("stop") => TelephonyEvent::Stop,
            Some(other) => TelephonyEvent::Unknown(other.to_string()),
            None => TelephonyEvent::Unknown(String::new()),
        };

        Ok(event)
    }

    pub fn kind(&self) -> &str {
        match self {
            TelephonyEvent::Connected => "connected",
            TelephonyEvent::Start { .. } => "start",
            TelephonyEvent::Media(_) => "media",
            TelephonyEvent::Stop => "stop",
            TelephonyEvent::Unknown(kind) => kind,
        }
    }
}

/// Messages this bridge sends to the telephony peer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyCommand {
    /// Agent audio for playback
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMedia,
    },
    /// Discard any audio queued for playback (barge-in)
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl TelephonyCommand {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// One function the agent wants called.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCallEntry {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments; some agents send an object instead of a string
    #[serde(default)]
    pub arguments: Value,
}

impl FunctionCallEntry {
    /// Decode the arguments into a JSON value.
    ///
    /// An empty or missing argument string decodes to an empty object.
    pub fn decoded_arguments(&self) -> Result<Value, String> {
        match &self.arguments {
            Value::String(encoded) if encoded.trim().is_empty() => {
                Ok(Value::Object(Default::default()))
            }
            Value::String(encoded) => serde_json::from_str(encoded)
                .map_err(|e| format!("Invalid function arguments: {}", e)),
            Value::Null => Ok(Value::Object(Default::default())),
            other => Ok(other.clone()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCallRequest {
    pub functions: Vec<FunctionCallEntry>,
}

/// Answer to one function call, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub name: String,
    /// JSON-encoded result or `{"error": ...}` object
    pub content: String,
}

impl FunctionCallResponse {
    pub const TYPE: &'static str = "FunctionCallResponse";

    pub fn new(id: impl Into<String>, name: impl Into<String>, content: &Value) -> Self {
        Self {
            kind: Self::TYPE.to_string(),
            id: id.into(),
            name: name.into(),
            content: content.to_string(),
        }
    }
}

/// Structured control events from the speech peer.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Caller started talking over the agent (barge-in)
    UserStartedSpeaking,
    FunctionCallRequest(FunctionCallRequest),
    /// `FunctionCallRequest` whose body could not be decoded
    MalformedFunctionCallRequest(String),
    Welcome,
    SettingsApplied,
    ConversationText { role: String, content: String },
    AgentStartedSpeaking,
    AgentAudioDone,
    Error(String),
    Warning(String),
    /// Any other `type`; ignored for forward compatibility
    Other(String),
}

impl AgentEvent {
    fn from_object(value: Value) -> Self {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let text_field = |field: &str| {
            value
                .get(field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        match kind.as_str() {
            "UserStartedSpeaking" => AgentEvent::UserStartedSpeaking,
            "Welcome" => AgentEvent::Welcome,
            "SettingsApplied" => AgentEvent::SettingsApplied,
            "AgentStartedSpeaking" => AgentEvent::AgentStartedSpeaking,
            "AgentAudioDone" => AgentEvent::AgentAudioDone,
            "ConversationText" => AgentEvent::ConversationText {
                role: text_field("role"),
                content: text_field("content"),
            },
            "Error" => AgentEvent::Error(text_field("description")),
            "Warning" => AgentEvent::Warning(text_field("description")),
            "FunctionCallRequest" => match serde_json::from_value(value.clone()) {
                Ok(request) => AgentEvent::FunctionCallRequest(request),
                Err(err) => AgentEvent::MalformedFunctionCallRequest(err.to_string()),
            },
            _ => AgentEvent::Other(kind),
        }
    }
}

/// A message received from the speech peer.
#[derive(Debug, Clone)]
pub enum SpeechMessage {
    Control(AgentEvent),
    /// Raw PCM audio
    Audio(Vec<u8>),
}

impl SpeechMessage {
    /// Decode a speech-peer message.
    ///
    /// Anything that decodes as a JSON object is a control message; everything
    /// else is raw audio.
    pub fn decode(data: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(data) {
            Ok(value @ Value::Object(_)) => SpeechMessage::Control(AgentEvent::from_object(value)),
            _ => SpeechMessage::Audio(data.to_vec()),
        }
    }
}
