//! # Audio Relay Module
//!
//! Moves audio and control messages between the telephony peer and the speech
//! peer for one call.
//!
//! ## Key Components:
//! - **Protocol**: Wire message types for both peers
//! - **Inbound Relay**: telephony → frame buffer → noise gate → speech peer
//! - **Outbound Relay**: speech peer → telephony peer, or → function dispatch → speech peer
//! - **Functions**: Name → handler dispatch table supplied at startup
//!
//! The relays never touch a socket directly. They talk to the two peers through
//! the [`SpeechPeer`] and [`TelephonyPeer`] traits, which the connection
//! supervisor implements on top of the real connections.

pub mod functions;  // Function dispatch table
pub mod inbound;    // Telephony → speech direction
pub mod outbound;   // Speech → telephony direction
pub mod protocol;   // Wire message types

/// Sending side of the speech-peer connection.
pub trait SpeechPeer {
    /// Whether the connection is open and the agent settings have been sent.
    fn is_ready(&self) -> bool;

    /// Send one binary PCM frame.
    fn send_audio(&mut self, frame: Vec<u8>) -> Result<(), String>;

    /// Send one JSON text message.
    fn send_json(&mut self, payload: String) -> Result<(), String>;
}

/// Sending side of the telephony-peer connection.
pub trait TelephonyPeer {
    fn send_text(&mut self, text: String);
}

/// In-memory peers used by relay tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::{SpeechPeer, TelephonyPeer};

    #[derive(Debug, Default)]
    pub struct RecordingSpeech {
        pub ready: bool,
        pub audio: Vec<Vec<u8>>,
        pub json: Vec<String>,
    }

    impl RecordingSpeech {
        pub fn ready() -> Self {
            Self {
                ready: true,
                ..Default::default()
            }
        }
    }

    impl SpeechPeer for RecordingSpeech {
        fn is_ready(&self) -> bool {
            self.ready
        }

        fn send_audio(&mut self, frame: Vec<u8>) -> Result<(), String> {
            if !self.ready {
                return Err("speech peer not ready".to_string());
            }
            self.audio.push(frame);
            Ok(())
        }

        fn send_json(&mut self, payload: String) -> Result<(), String> {
            if !self.ready {
                return Err("speech peer not ready".to_string());
            }
            self.json.push(payload);
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    pub struct RecordingTelephony {
        pub sent: Vec<String>,
    }

    impl TelephonyPeer for RecordingTelephony {
        fn send_text(&mut self, text: String) {
            self.sent.push(text);
        }
    }
}
