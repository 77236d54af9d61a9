//! # Outbound Relay
//!
//! Speech → telephony direction. Every speech-peer message is decoded as either a
//! structured control event or raw agent audio.
//!
//! ## Dispatch:
//! - **Barge-in**: send `clear` to the telephony peer right away
//! - **Function call**: run each requested function, answer every one of them
//! - **Audio**: wrap as a telephony `media` event for the current stream
//! - **Anything else**: logged, otherwise ignored

use crate::audio::session::CallSession;
use crate::relay::functions::{FunctionRegistry, Invocation};
use crate::relay::protocol::{
    AgentEvent, FunctionCallEntry, FunctionCallRequest, FunctionCallResponse, OutboundMedia,
    SpeechMessage, TelephonyCommand,
};
use crate::relay::{SpeechPeer, TelephonyPeer};
use crate::state::RelayMetrics;
use base64::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Identifier used when a function request is too broken to read its own ids.
const PLACEHOLDER_ID: &str = "unknown";

pub struct OutboundRelay {
    functions: Arc<FunctionRegistry>,
    metrics: Arc<RelayMetrics>,
}

impl OutboundRelay {
    pub fn new(functions: Arc<FunctionRegistry>, metrics: Arc<RelayMetrics>) -> Self {
        Self { functions, metrics }
    }

    /// Handle one speech-peer message (text or binary frame payload).
    pub fn handle_message<T, S>(
        &self,
        data: &[u8],
        session: &CallSession,
        telephony: &mut T,
        speech: &mut S,
    ) where
        T: TelephonyPeer,
        S: SpeechPeer,
    {
        match SpeechMessage::decode(data) {
            SpeechMessage::Control(event) => self.handle_event(event, session, telephony, speech),
            SpeechMessage::Audio(audio) => self.relay_audio(&audio, session, telephony),
        }
    }

    fn handle_event<T, S>(
        &self,
        event: AgentEvent,
        session: &CallSession,
        telephony: &mut T,
        speech: &mut S,
    ) where
        T: TelephonyPeer,
        S: SpeechPeer,
    {
        let connection_id = &session.connection_id;
        let stream_sid = session.stream_sid();

        match event {
            AgentEvent::UserStartedSpeaking => self.send_clear(session, telephony),
            AgentEvent::FunctionCallRequest(request) => {
                self.dispatch_functions(&request, session, speech)
            }
            AgentEvent::MalformedFunctionCallRequest(reason) => {
                warn!(
                    %connection_id,
                    ?stream_sid,
                    "Unreadable function call request: {}",
                    reason
                );
                let content =
                    json!({ "error": format!("Invalid function call request: {}", reason) });
                self.metrics.function_called(true);
                self.respond(
                    FunctionCallResponse::new(PLACEHOLDER_ID, PLACEHOLDER_ID, &content),
                    session,
                    speech,
                );
            }
            AgentEvent::ConversationText { role, content } => {
                info!(%connection_id, %role, "Transcript: {}", content);
            }
            AgentEvent::Error(description) => {
                warn!(
                    %connection_id,
                    ?stream_sid,
                    "Speech peer reported an error: {}",
                    description
                );
            }
            AgentEvent::Warning(description) => {
                warn!(%connection_id, ?stream_sid, "Speech peer warning: {}", description);
            }
            AgentEvent::Welcome => debug!(%connection_id, "Speech peer welcome received"),
            AgentEvent::SettingsApplied => info!(%connection_id, "Agent settings applied"),
            AgentEvent::AgentStartedSpeaking => debug!(%connection_id, "Agent started speaking"),
            AgentEvent::AgentAudioDone => debug!(%connection_id, "Agent audio done"),
            AgentEvent::Other(kind) => {
                debug!(%connection_id, %kind, "Ignoring unrecognized speech peer message");
            }
        }
    }

    /// Barge-in: tell the telephony peer to drop queued playback.
    fn send_clear<T: TelephonyPeer>(&self, session: &CallSession, telephony: &mut T) {
        let Some(stream_sid) = session.stream_sid() else {
            warn!(
                connection_id = %session.connection_id,
                "Barge-in with no active stream, nothing to clear"
            );
            return;
        };

        let command = TelephonyCommand::Clear {
            stream_sid: stream_sid.to_string(),
        };
        match command.to_json() {
            Ok(text) => {
                telephony.send_text(text);
                self.metrics.clear_sent();
                debug!(
                    connection_id = %session.connection_id,
                    %stream_sid,
                    "Sent clear for barge-in"
                );
            }
            Err(err) => error!(
                connection_id = %session.connection_id,
                %stream_sid,
                "Failed to encode clear message: {}",
                err
            ),
        }
    }

    fn dispatch_functions<S: SpeechPeer>(
        &self,
        request: &FunctionCallRequest,
        session: &CallSession,
        speech: &mut S,
    ) {
        for entry in &request.functions {
            let response = self.invoke(entry, session);
            self.respond(response, session, speech);
        }
    }

    /// Run one function and build its response. Always produces a response.
    fn invoke(&self, entry: &FunctionCallEntry, session: &CallSession) -> FunctionCallResponse {
        let outcome = match entry.decoded_arguments() {
            Ok(arguments) => self.functions.invoke(&entry.name, arguments),
            Err(err) => Invocation::Failed(err),
        };

        let (content, failed) = match outcome {
            Invocation::Completed(result) => (result, false),
            Invocation::Failed(message) => (json!({ "error": message }), true),
            Invocation::UnknownFunction => (
                json!({ "error": format!("Unknown function: {}", entry.name) }),
                true,
            ),
        };

        self.metrics.function_called(failed);
        info!(
            connection_id = %session.connection_id,
            function = %entry.name,
            call_id = %entry.id,
            failed,
            "Function call handled"
        );

        FunctionCallResponse::new(entry.id.clone(), entry.name.clone(), &content)
    }

    fn respond<S: SpeechPeer>(
        &self,
        response: FunctionCallResponse,
        session: &CallSession,
        speech: &mut S,
    ) {
        let payload = match serde_json::to_string(&response) {
            Ok(payload) => payload,
            Err(err) => {
                error!(
                    connection_id = %session.connection_id,
                    stream_sid = ?session.stream_sid(),
                    call_id = %response.id,
                    "Failed to encode function call response: {}",
                    err
                );
                return;
            }
        };

        if let Err(err) = speech.send_json(payload) {
            error!(
                connection_id = %session.connection_id,
                stream_sid = ?session.stream_sid(),
                call_id = %response.id,
                "Failed to send function call response: {}",
                err
            );
        }
    }

    /// Wrap agent audio as a telephony media event for the active stream.
    fn relay_audio<T: TelephonyPeer>(
        &self,
        audio: &[u8],
        session: &CallSession,
        telephony: &mut T,
    ) {
        let Some(stream_sid) = session.stream_sid() else {
            self.metrics.audio_chunk_dropped();
            warn!(
                connection_id = %session.connection_id,
                bytes = audio.len(),
                "Agent audio with no active stream, dropping"
            );
            return;
        };

        let command = TelephonyCommand::Media {
            stream_sid: stream_sid.to_string(),
            media: OutboundMedia {
                payload: BASE64_STANDARD.encode(audio),
            },
        };

        match command.to_json() {
            Ok(text) => {
                telephony.send_text(text);
                self.metrics.audio_chunk_relayed();
            }
            Err(err) => {
                self.metrics.audio_chunk_dropped();
                error!(
                    connection_id = %session.connection_id,
                    %stream_sid,
                    "Failed to encode media message: {}",
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::{RecordingSpeech, RecordingTelephony};
    use serde_json::Value;

    fn response_content(response: &FunctionCallResponse) -> Option<Value> {
        serde_json::from_str(&response.content).ok()
    }

    fn relay() -> (OutboundRelay, Arc<RelayMetrics>) {
        let functions = FunctionRegistry::builder()
            .register(
                "lookup_order",
                "Find an order",
                json!({"type": "object"}),
                |args| Ok(json!({"order": args["order_id"], "status": "shipped"})),
            )
            .register("broken", "Always fails", json!({"type": "object"}), |_| {
                Err("database unavailable".to_string())
            })
            .build();
        let metrics = Arc::new(RelayMetrics::default());
        (OutboundRelay::new(Arc::new(functions), metrics.clone()), metrics)
    }

    fn session_with_stream(sid: &str) -> CallSession {
        let mut session = CallSession::new("test".to_string());
        session.on_start(Some(sid.to_string()));
        session
    }

    fn responses(speech: &RecordingSpeech) -> Vec<FunctionCallResponse> {
        speech
            .json
            .iter()
            .map(|text| serde_json::from_str(text).unwrap())
            .collect()
    }

    #[test]
    fn test_barge_in_sends_exactly_one_clear() {
        let (relay, metrics) = relay();
        let session = session_with_stream("abc");
        let mut telephony = RecordingTelephony::default();
        let mut speech = RecordingSpeech::ready();

        let barge_in = br#"{"type":"UserStartedSpeaking"}"#;
        relay.handle_message(barge_in, &session, &mut telephony, &mut speech);
        relay.handle_message(&[1, 2, 3, 4], &session, &mut telephony, &mut speech);

        assert_eq!(telephony.sent.len(), 2);
        let first: Value = serde_json::from_str(&telephony.sent[0]).unwrap();
        assert_eq!(first, json!({"event": "clear", "streamSid": "abc"}));
        let second: Value = serde_json::from_str(&telephony.sent[1]).unwrap();
        assert_eq!(second["event"], "media");
        assert_eq!(metrics.snapshot().clear_messages, 1);
    }

    #[test]
    fn test_barge_in_without_stream_sends_nothing() {
        let (relay, _) = relay();
        let session = CallSession::new("test".to_string());
        let mut telephony = RecordingTelephony::default();
        let mut speech = RecordingSpeech::ready();

        let barge_in = br#"{"type":"UserStartedSpeaking"}"#;
        relay.handle_message(barge_in, &session, &mut telephony, &mut speech);
        assert!(telephony.sent.is_empty());
    }

    #[test]
    fn test_audio_is_wrapped_for_the_current_stream() {
        let (relay, metrics) = relay();
        let session = session_with_stream("MZ9");
        let mut telephony = RecordingTelephony::default();
        let mut speech = RecordingSpeech::ready();

        let audio = vec![0x10u8, 0x00, 0xf0, 0xff];
        relay.handle_message(&audio, &session, &mut telephony, &mut speech);

        let sent: Value = serde_json::from_str(&telephony.sent[0]).unwrap();
        assert_eq!(sent["streamSid"], "MZ9");
        assert_eq!(
            BASE64_STANDARD
                .decode(sent["media"]["payload"].as_str().unwrap())
                .unwrap(),
            audio
        );
        assert_eq!(metrics.snapshot().audio_chunks_relayed, 1);
    }

    #[test]
    fn test_audio_without_stream_is_dropped() {
        let (relay, metrics) = relay();
        let mut session = session_with_stream("MZ9");
        session.on_stop();
        let mut telephony = RecordingTelephony::default();
        let mut speech = RecordingSpeech::ready();

        relay.handle_message(&[9u8; 64], &session, &mut telephony, &mut speech);

        assert!(telephony.sent.is_empty());
        assert_eq!(metrics.snapshot().audio_chunks_dropped, 1);
    }

    #[test]
    fn test_unknown_function_gets_error_response() {
        let (relay, _) = relay();
        let session = session_with_stream("abc");
        let mut telephony = RecordingTelephony::default();
        let mut speech = RecordingSpeech::ready();

        let request = json!({
            "type": "FunctionCallRequest",
            "functions": [{"id": "call-7", "name": "transfer_call", "arguments": "{}"}]
        });
        relay.handle_message(request.to_string().as_bytes(), &session, &mut telephony, &mut speech);

        let responses = responses(&speech);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].kind, "FunctionCallResponse");
        assert_eq!(responses[0].id, "call-7");
        assert_eq!(responses[0].name, "transfer_call");
        let content = response_content(&responses[0]).unwrap();
        assert_eq!(content["error"], "Unknown function: transfer_call");
        assert!(telephony.sent.is_empty());
    }

    #[test]
    fn test_every_function_in_a_batch_is_answered() {
        let (relay, metrics) = relay();
        let session = session_with_stream("abc");
        let mut telephony = RecordingTelephony::default();
        let mut speech = RecordingSpeech::ready();

        let request = json!({
            "type": "FunctionCallRequest",
            "functions": [
                {"id": "a", "name": "lookup_order", "arguments": "{\"order_id\": 42}"},
                {"id": "b", "name": "broken", "arguments": "{}"},
                {"id": "c", "name": "lookup_order", "arguments": "{not json"}
            ]
        });
        relay.handle_message(request.to_string().as_bytes(), &session, &mut telephony, &mut speech);

        let responses = responses(&speech);
        let ids: Vec<&str> = responses.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        assert_eq!(
            response_content(&responses[0]).unwrap(),
            json!({"order": 42, "status": "shipped"})
        );
        assert_eq!(response_content(&responses[1]).unwrap()["error"], "database unavailable");
        assert!(response_content(&responses[2]).unwrap()["error"].is_string());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.function_calls, 3);
        assert_eq!(snapshot.function_errors, 2);
    }

    #[test]
    fn test_malformed_request_gets_placeholder_response() {
        let (relay, _) = relay();
        let session = session_with_stream("abc");
        let mut telephony = RecordingTelephony::default();
        let mut speech = RecordingSpeech::ready();

        relay.handle_message(
            br#"{"type":"FunctionCallRequest","functions":[{"name":"x"}]}"#,
            &session,
            &mut telephony,
            &mut speech,
        );

        let responses = responses(&speech);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, PLACEHOLDER_ID);
        assert!(response_content(&responses[0]).unwrap()["error"].is_string());
    }

    #[test]
    fn test_unrecognized_control_messages_are_ignored() {
        let (relay, _) = relay();
        let session = session_with_stream("abc");
        let mut telephony = RecordingTelephony::default();
        let mut speech = RecordingSpeech::ready();

        for message in [
            r#"{"type":"Welcome","request_id":"r1"}"#,
            r#"{"type":"ConversationText","role":"user","content":"hi"}"#,
            r#"{"type":"SomethingNew"}"#,
        ] {
            relay.handle_message(message.as_bytes(), &session, &mut telephony, &mut speech);
        }

        assert!(telephony.sent.is_empty());
        assert!(speech.json.is_empty());
    }
}
