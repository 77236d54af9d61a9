//! # Inbound Relay
//!
//! Telephony → speech direction. Consumes telephony text frames in arrival
//! order, keeps the call session in step with control events, and turns caller
//! audio into gated fixed-size frames for the speech peer.
//!
//! ## Media Pipeline:
//! 1. **Track check**: only the inbound (caller) track is used
//! 2. **Decode**: base64 payload → raw PCM bytes
//! 3. **Pre-filter**: drop tiny or leading-silence fragments
//! 4. **Frame**: append to the frame buffer, extract every complete frame
//! 5. **Gate**: run each frame through the noise gate
//! 6. **Forward**: send non-empty frames if the speech peer is ready, drop otherwise

use crate::audio::buffer::FrameBuffer;
use crate::audio::processor::{FragmentFilter, NoiseGate};
use crate::audio::session::CallSession;
use crate::relay::protocol::{MediaPayload, TelephonyEvent};
use crate::relay::SpeechPeer;
use crate::state::RelayMetrics;
use base64::prelude::*;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Per-session inbound relay. Owns the session's frame buffer exclusively.
pub struct InboundRelay {
    buffer: FrameBuffer,
    filter: FragmentFilter,
    /// `None` when noise gating is disabled; frames are forwarded as framed
    gate: Option<NoiseGate>,
    frame_size: usize,
    /// Set while a media event is being processed
    in_flight: bool,
    metrics: Arc<RelayMetrics>,
}

impl InboundRelay {
    pub fn new(
        frame_size: usize,
        filter: FragmentFilter,
        gate: Option<NoiseGate>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            buffer: FrameBuffer::new(),
            filter,
            gate,
            frame_size,
            in_flight: false,
            metrics,
        }
    }

    /// Bytes waiting in the frame buffer.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.pending_len()
    }

    /// Handle one telephony text frame.
    ///
    /// Malformed frames are logged and ignored; the connection stays open.
    pub fn handle_text<S: SpeechPeer>(
        &mut self,
        text: &str,
        session: &mut CallSession,
        speech: &mut S,
    ) {
        let event = match TelephonyEvent::parse(text) {
            Ok(event) => event,
            Err(err) => {
                self.metrics.malformed_message();
                warn!(
                    connection_id = %session.connection_id,
                    stream_sid = ?session.stream_sid(),
                    "Ignoring malformed telephony message: {}",
                    err
                );
                return;
            }
        };

        trace!(
            connection_id = %session.connection_id,
            event = event.kind(),
            "Telephony event received"
        );

        self.handle_event(event, session, speech);
    }

    /// Apply one parsed telephony event.
    pub fn handle_event<S: SpeechPeer>(
        &mut self,
        event: TelephonyEvent,
        session: &mut CallSession,
        speech: &mut S,
    ) {
        match event {
            TelephonyEvent::Connected => session.on_connected(),
            TelephonyEvent::Start { stream_sid } => {
                session.on_start(stream_sid);
            }
            TelephonyEvent::Media(media) => {
                if session.on_media() {
                    self.handle_media(&media, session, speech);
                }
            }
            TelephonyEvent::Stop => {
                session.on_stop();
                self.buffer.reset();
            }
            TelephonyEvent::Unknown(kind) => {
                debug!(
                    connection_id = %session.connection_id,
                    event = %kind,
                    "Ignoring unhandled telephony event"
                );
            }
        }
    }

    fn handle_media<S: SpeechPeer>(
        &mut self,
        media: &MediaPayload,
        session: &CallSession,
        speech: &mut S,
    ) {
        if !media.is_inbound() {
            // Echo of our own playback
            return;
        }

        // Processing is synchronous, so a second entry means a caller bug
        if self.in_flight {
            error!(
                connection_id = %session.connection_id,
                stream_sid = ?session.stream_sid(),
                "Media event re-entered while another is in flight, skipping"
            );
            return;
        }

        self.in_flight = true;
        self.process_media(media, session, speech);
        self.in_flight = false;
    }

    fn process_media<S: SpeechPeer>(
        &mut self,
        media: &MediaPayload,
        session: &CallSession,
        speech: &mut S,
    ) {
        let fragment = match BASE64_STANDARD.decode(media.payload.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.metrics.malformed_message();
                warn!(
                    connection_id = %session.connection_id,
                    stream_sid = ?session.stream_sid(),
                    "Failed to decode media payload: {}",
                    err
                );
                return;
            }
        };

        if let Err(reason) = self.filter.check(&fragment) {
            self.metrics.fragment_rejected();
            debug!(
                connection_id = %session.connection_id,
                bytes = fragment.len(),
                ?reason,
                "Discarding fragment before framing"
            );
            return;
        }

        self.buffer.append(fragment);

        while let Some(frame) = self.buffer.extract_frame(self.frame_size) {
            let outgoing = match &self.gate {
                Some(gate) => gate.process(&frame),
                None => frame,
            };

            if outgoing.is_empty() {
                self.metrics.frame_silent();
                continue;
            }

            self.forward(outgoing, session, speech);
        }
    }

    fn forward<S: SpeechPeer>(&self, frame: Vec<u8>, session: &CallSession, speech: &mut S) {
        if !speech.is_ready() {
            self.metrics.frame_dropped();
            debug!(
                connection_id = %session.connection_id,
                "Speech peer not ready, dropping frame"
            );
            return;
        }

        match speech.send_audio(frame) {
            Ok(()) => self.metrics.frame_forwarded(),
            Err(err) => {
                self.metrics.frame_dropped();
                warn!(
                    connection_id = %session.connection_id,
                    stream_sid = ?session.stream_sid(),
                    "Failed to forward frame to speech peer: {}",
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::{FragmentFilterConfig, NoiseGateConfig};
    use crate::audio::session::CallPhase;
    use crate::relay::testing::RecordingSpeech;
    use serde_json::json;

    const FRAME_SIZE: usize = 3200;

    fn relay_with(gate: Option<NoiseGate>) -> (InboundRelay, Arc<RelayMetrics>) {
        let metrics = Arc::new(RelayMetrics::default());
        let relay = InboundRelay::new(
            FRAME_SIZE,
            FragmentFilter::new(FragmentFilterConfig::default()),
            gate,
            metrics.clone(),
        );
        (relay, metrics)
    }

    fn gated_relay() -> (InboundRelay, Arc<RelayMetrics>) {
        relay_with(Some(NoiseGate::new(NoiseGateConfig::default())))
    }

    /// Loud 16-bit samples so the gate keeps everything.
    fn loud_audio(len: usize) -> Vec<u8> {
        (0..len / 2)
            .flat_map(|i| (if i % 2 == 0 { 8000i16 } else { -8000i16 }).to_le_bytes())
            .collect()
    }

    fn media(bytes: &[u8], track: &str) -> String {
        json!({
            "event": "media",
            "media": {"track": track, "payload": BASE64_STANDARD.encode(bytes)}
        })
        .to_string()
    }

    fn start(sid: &str) -> String {
        json!({"event": "start", "start": {"streamSid": sid}}).to_string()
    }

    fn streaming_session() -> CallSession {
        let mut session = CallSession::new("test".to_string());
        session.on_connected();
        session.on_start(Some("MZ1".to_string()));
        session
    }

    #[test]
    fn test_fragments_are_framed_and_forwarded() {
        let (mut relay, metrics) = gated_relay();
        let mut session = streaming_session();
        let mut speech = RecordingSpeech::ready();

        let audio = loud_audio(3200);
        relay.handle_text(&media(&audio[..500], "inbound"), &mut session, &mut speech);
        relay.handle_text(&media(&audio[500..1000], "inbound"), &mut session, &mut speech);
        assert!(speech.audio.is_empty());

        relay.handle_text(&media(&audio[1000..], "inbound"), &mut session, &mut speech);
        assert_eq!(speech.audio.len(), 1);
        assert_eq!(speech.audio[0], audio);
        assert_eq!(relay.pending_bytes(), 0);
        assert_eq!(metrics.snapshot().frames_forwarded, 1);
    }

    #[test]
    fn test_outbound_track_is_never_buffered() {
        let (mut relay, _) = gated_relay();
        let mut session = streaming_session();
        let mut speech = RecordingSpeech::ready();

        relay.handle_text(&media(&loud_audio(4000), "outbound"), &mut session, &mut speech);

        assert_eq!(relay.pending_bytes(), 0);
        assert!(speech.audio.is_empty());
    }

    #[test]
    fn test_media_before_start_is_ignored() {
        let (mut relay, _) = gated_relay();
        let mut session = CallSession::new("test".to_string());
        let mut speech = RecordingSpeech::ready();

        relay.handle_text(&media(&loud_audio(4000), "inbound"), &mut session, &mut speech);

        assert_eq!(relay.pending_bytes(), 0);
        assert_eq!(session.message_count(), 1);
    }

    #[test]
    fn test_frames_dropped_when_speech_not_ready() {
        let (mut relay, metrics) = gated_relay();
        let mut session = streaming_session();
        let mut speech = RecordingSpeech::default();

        relay.handle_text(&media(&loud_audio(6400), "inbound"), &mut session, &mut speech);

        assert!(speech.audio.is_empty());
        // Dropped, not queued
        assert_eq!(relay.pending_bytes(), 0);
        assert_eq!(metrics.snapshot().frames_dropped, 2);
    }

    #[test]
    fn test_silent_frames_are_skipped() {
        let (mut relay, metrics) = gated_relay();
        let mut session = streaming_session();
        let mut speech = RecordingSpeech::ready();

        // Non-zero prefix passes the pre-filter, but every sample is under the floor
        let quiet: Vec<u8> = (0..1600).flat_map(|_| 50i16.to_le_bytes()).collect();
        relay.handle_text(&media(&quiet, "inbound"), &mut session, &mut speech);

        assert!(speech.audio.is_empty());
        assert_eq!(metrics.snapshot().frames_silent, 1);
    }

    #[test]
    fn test_gate_disabled_forwards_raw_frames() {
        let (mut relay, _) = relay_with(None);
        let mut session = streaming_session();
        let mut speech = RecordingSpeech::ready();

        let quiet: Vec<u8> = (0..1600).flat_map(|_| 50i16.to_le_bytes()).collect();
        relay.handle_text(&media(&quiet, "inbound"), &mut session, &mut speech);

        assert_eq!(speech.audio, vec![quiet]);
    }

    #[test]
    fn test_prefilter_rejects_fragments() {
        let (mut relay, metrics) = gated_relay();
        let mut session = streaming_session();
        let mut speech = RecordingSpeech::ready();

        relay.handle_text(&media(&[5u8; 10], "inbound"), &mut session, &mut speech);
        relay.handle_text(&media(&[0u8; 400], "inbound"), &mut session, &mut speech);

        assert_eq!(relay.pending_bytes(), 0);
        assert_eq!(metrics.snapshot().fragments_rejected, 2);
    }

    #[test]
    fn test_stop_resets_stream_and_buffer() {
        let (mut relay, _) = gated_relay();
        let mut session = streaming_session();
        let mut speech = RecordingSpeech::ready();

        relay.handle_text(&media(&loud_audio(1000), "inbound"), &mut session, &mut speech);
        assert_eq!(relay.pending_bytes(), 1000);

        relay.handle_text(r#"{"event":"stop"}"#, &mut session, &mut speech);
        assert_eq!(relay.pending_bytes(), 0);
        assert!(session.stream_sid().is_none());
        assert_eq!(session.phase(), CallPhase::Stopped);

        // Nothing more is buffered until a new start
        relay.handle_text(&media(&loud_audio(1000), "inbound"), &mut session, &mut speech);
        assert_eq!(relay.pending_bytes(), 0);

        relay.handle_text(&start("MZ2"), &mut session, &mut speech);
        relay.handle_text(&media(&loud_audio(1000), "inbound"), &mut session, &mut speech);
        assert_eq!(relay.pending_bytes(), 1000);
        assert_eq!(session.stream_sid(), Some("MZ2"));
    }

    #[test]
    fn test_media_skipped_while_previous_event_in_flight() {
        let (mut relay, metrics) = gated_relay();
        let mut session = streaming_session();
        let mut speech = RecordingSpeech::ready();

        relay.in_flight = true;
        relay.handle_text(&media(&loud_audio(3200), "inbound"), &mut session, &mut speech);

        assert_eq!(relay.pending_bytes(), 0);
        assert!(speech.audio.is_empty());
        assert_eq!(metrics.snapshot().frames_forwarded, 0);
        // Still counted as a received message
        assert_eq!(session.message_count(), 3);

        relay.in_flight = false;
        relay.handle_text(&media(&loud_audio(3200), "inbound"), &mut session, &mut speech);

        assert_eq!(speech.audio.len(), 1);
        assert_eq!(metrics.snapshot().frames_forwarded, 1);
        assert!(!relay.in_flight);
    }

    #[test]
    fn test_malformed_messages_are_ignored() {
        let (mut relay, metrics) = gated_relay();
        let mut session = streaming_session();
        let mut speech = RecordingSpeech::ready();

        relay.handle_text("{not json", &mut session, &mut speech);
        relay.handle_text(
            r#"{"event":"media","media":{"track":"inbound","payload":"***"}}"#,
            &mut session,
            &mut speech,
        );

        assert_eq!(metrics.snapshot().malformed_messages, 2);
        assert_eq!(session.phase(), CallPhase::Streaming);
    }
}
