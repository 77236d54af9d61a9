//! # Noise Gate and Fragment Pre-filter
//!
//! Cleans up caller audio before it reaches the speech service.
//!
//! ## Key Functions:
//! - **Fragment pre-filter**: Drops fragments that are certainly silence or garbage
//!   before they ever enter the frame buffer
//! - **Noise gate**: Zeroes low-amplitude samples inside one fixed-size frame,
//!   relative to that frame's own peak
//!
//! ## Audio Format:
//! - **Bit Depth**: 16-bit PCM
//! - **Encoding**: Little-endian signed integers

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Settings for the per-frame noise gate.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseGateConfig {
    /// Fraction of the frame peak below which samples are zeroed (reference 0.005)
    pub threshold_ratio: f64,

    /// Absolute floor for the gate threshold (reference 100)
    pub minimum_floor: f64,
}

impl Default for NoiseGateConfig {
    fn default() -> Self {
        Self {
            threshold_ratio: 0.005,
            minimum_floor: 100.0,
        }
    }
}

/// Result of running one frame through the gate.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// At least one sample survived; carries the full-length gated frame
    Voiced(Vec<u8>),
    /// No sample exceeded the threshold, nothing should be forwarded
    Silent,
    /// The frame could not be read as PCM; carries the original bytes unmodified
    Passthrough(Vec<u8>),
}

impl GateOutcome {
    /// Collapse the outcome to the bytes to forward (empty means skip).
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            GateOutcome::Voiced(bytes) | GateOutcome::Passthrough(bytes) => bytes,
            GateOutcome::Silent => Vec::new(),
        }
    }
}

/// Per-frame dynamic noise gate.
///
/// ## Algorithm:
/// 1. Find the maximum absolute sample value in the frame
/// 2. `threshold = max(peak * threshold_ratio, minimum_floor)`
/// 3. Keep samples whose absolute value is strictly above the threshold, zero the rest
/// 4. If nothing survived, report the frame as silent
///
/// Every frame is judged only against its own peak. There is no state carried
/// from one frame to the next.
#[derive(Debug, Clone)]
pub struct NoiseGate {
    config: NoiseGateConfig,
}

impl NoiseGate {
    /// Create a new noise gate with the given configuration.
    pub fn new(config: NoiseGateConfig) -> Self {
        Self { config }
    }

    /// Gate a frame and return the bytes to forward.
    ///
    /// ## Returns:
    /// - **empty**: The frame is pure noise and should be skipped
    /// - **same length as `frame`**: The gated frame, or the untouched frame if it
    ///   could not be processed
    pub fn process(&self, frame: &[u8]) -> Vec<u8> {
        self.gate(frame).into_bytes()
    }

    /// Gate a frame and report what happened.
    pub fn gate(&self, frame: &[u8]) -> GateOutcome {
        match self.try_gate(frame) {
            Ok(Some(gated)) => GateOutcome::Voiced(gated),
            Ok(None) => GateOutcome::Silent,
            Err(err) => {
                tracing::warn!("Noise gate failed, passing frame through: {}", err);
                GateOutcome::Passthrough(frame.to_vec())
            }
        }
    }

    fn try_gate(&self, frame: &[u8]) -> Result<Option<Vec<u8>>, String> {
        if frame.len() % 2 != 0 {
            return Err(format!(
                "Frame length {} is not a whole number of 16-bit samples",
                frame.len()
            ));
        }

        let samples = decode_samples(frame)?;

        // i32 so that abs(i16::MIN) does not overflow
        let max_amplitude = samples
            .iter()
            .map(|&s| (s as i32).abs())
            .max()
            .unwrap_or(0);

        let threshold = (max_amplitude as f64 * self.config.threshold_ratio)
            .max(self.config.minimum_floor);

        let mut any_voiced = false;
        let mut gated = Vec::with_capacity(frame.len());
        for sample in samples {
            let kept = if (sample as i32).abs() as f64 > threshold {
                any_voiced = true;
                sample
            } else {
                0
            };
            gated
                .write_i16::<LittleEndian>(kept)
                .map_err(|e| format!("Failed to encode sample: {}", e))?;
        }

        if any_voiced {
            Ok(Some(gated))
        } else {
            Ok(None)
        }
    }
}

/// Settings for the cheap pre-filter applied to raw fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentFilterConfig {
    /// Fragments shorter than this many bytes are discarded (reference 20)
    pub min_fragment_bytes: usize,

    /// How many leading bytes are checked for all-zero silence (reference 100)
    pub silence_window_bytes: usize,
}

impl Default for FragmentFilterConfig {
    fn default() -> Self {
        Self {
            min_fragment_bytes: 20,
            silence_window_bytes: 100,
        }
    }
}

/// Why a fragment was rejected by the pre-filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentRejection {
    TooShort,
    LeadingSilence,
}

/// Pre-filter that keeps obvious silence out of the frame buffer.
#[derive(Debug, Clone)]
pub struct FragmentFilter {
    config: FragmentFilterConfig,
}

impl FragmentFilter {
    pub fn new(config: FragmentFilterConfig) -> Self {
        Self { config }
    }

    /// Check a fragment, returning the reason if it must be discarded.
    ///
    /// ## Rejection Rules:
    /// - Length below `min_fragment_bytes`
    /// - The first `silence_window_bytes` bytes (or all of them, if the fragment is
    ///   shorter) are zero
    pub fn check(&self, fragment: &[u8]) -> Result<(), FragmentRejection> {
        if fragment.len() < self.config.min_fragment_bytes {
            return Err(FragmentRejection::TooShort);
        }

        let window_len = self.config.silence_window_bytes.min(fragment.len());
        if window_len > 0 && fragment[..window_len].iter().all(|&b| b == 0) {
            return Err(FragmentRejection::LeadingSilence);
        }

        Ok(())
    }
}

/// Read 16-bit little-endian samples from raw bytes.
fn decode_samples(data: &[u8]) -> Result<Vec<i16>, String> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);

    for _ in 0..data.len() / 2 {
        let sample = cursor
            .read_i16::<LittleEndian>()
            .map_err(|e| format!("Failed to read sample: {}", e))?;
        samples.push(sample);
    }

    Ok(samples)
}
