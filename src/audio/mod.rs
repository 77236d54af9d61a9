//! # Audio Module
//!
//! Per-call audio state: framing, noise gating and the telephony stream lifecycle.
//!
//! ## Key Components:
//! - **Frame Buffer**: Accumulates decoded caller audio and cuts fixed-size frames
//! - **Processor**: Fragment pre-filter and adaptive noise gate over 16-bit PCM
//! - **Session**: Stream identity and phase for one telephony connection
//!
//! ## Audio Format:
//! - **Encoding**: 16-bit signed little-endian linear PCM
//! - **Sample Rate**: 8kHz (telephony)
//! - **Channels**: Mono

// The call supervisor lives in src/websocket.rs
pub mod buffer;       // Fragment queue and frame extraction
pub mod processor;    // Noise gate and fragment filter
pub mod session;      // Call session state machine
