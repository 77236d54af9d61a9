//! # Frame Buffer
//!
//! Accumulates variable-sized audio fragments from the telephony peer and hands
//! them back as fixed-size frames for the speech peer.
//!
//! ## Key Features:
//! - **Arrival order**: Fragments are kept exactly in the order they were appended
//! - **Exact frames**: Every extracted frame is exactly `size` bytes long
//! - **Remainder push-back**: Bytes past the frame boundary go back to the front,
//!   untouched, so the next frame continues where the last one stopped
//! - **Single owner**: Only the inbound relay of one session mutates the buffer, so
//!   there is no lock around it

use std::collections::VecDeque;

/// Ordered pending audio fragments plus their cumulative byte length.
///
/// ## Usage:
/// ```ignore
/// let mut buffer = FrameBuffer::new();
/// buffer.append(vec![0u8; 4000]);
/// while let Some(frame) = buffer.extract_frame(3200) {
///     // one append may complete several frames
/// }
/// ```
#[derive(Debug, Default)]
pub struct FrameBuffer {
    /// Fragments waiting to be framed, oldest first
    fragments: VecDeque<Vec<u8>>,

    /// Sum of the lengths of every fragment in `fragments`
    pending_len: usize,
}

impl FrameBuffer {
    /// Create an empty frame buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment to the end of the pending audio.
    ///
    /// Empty fragments are ignored since they can never contribute to a frame.
    pub fn append(&mut self, fragment: Vec<u8>) {
        if fragment.is_empty() {
            return;
        }

        self.pending_len += fragment.len();
        self.fragments.push_back(fragment);
    }

    /// Extract a frame of exactly `size` bytes.
    ///
    /// ## Extraction Process:
    /// 1. Return `None` (no side effects) if fewer than `size` bytes are pending
    /// 2. Concatenate fragments in order until the total first reaches `size`
    /// 3. Split the concatenation at `size` bytes
    /// 4. Push the remainder back to the front as a single fragment
    ///
    /// ## Parameters:
    /// - **size**: Frame size in bytes (must be greater than 0)
    pub fn extract_frame(&mut self, size: usize) -> Option<Vec<u8>> {
        if size == 0 || self.pending_len < size {
            return None;
        }

        let mut frame = Vec::with_capacity(size);
        while frame.len() < size {
            // pending_len >= size guarantees a fragment is available here
            let fragment = self.fragments.pop_front()?;
            frame.extend_from_slice(&fragment);
        }

        if frame.len() > size {
            let remainder = frame.split_off(size);
            self.fragments.push_front(remainder);
        }

        self.pending_len -= size;
        Some(frame)
    }

    /// Drop every pending fragment (called on stream stop).
    pub fn reset(&mut self) {
        self.fragments.clear();
        self.pending_len = 0;
    }

    /// Number of bytes currently waiting to be framed.
    pub fn pending_len(&self) -> usize {
        self.pending_len
    }

}

#[cfg(test)]
impl FrameBuffer {
    fn fragment_count(&self) -> usize {
        self.fragments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize, offset: usize) -> Vec<u8> {
        (0..len).map(|i| ((i + offset) % 251) as u8).collect()
    }

    #[test]
    fn test_extract_returns_none_until_frame_is_complete() {
        let mut buffer = FrameBuffer::new();
        buffer.append(vec![1u8; 100]);

        assert!(buffer.extract_frame(160).is_none());
        // No side effects on a failed extraction
        assert_eq!(buffer.pending_len(), 100);
        assert_eq!(buffer.fragment_count(), 1);
    }

    #[test]
    fn test_three_fragments_make_one_frame() {
        let mut buffer = FrameBuffer::new();
        buffer.append(vec![1u8; 500]);
        buffer.append(vec![2u8; 500]);
        buffer.append(vec![3u8; 2200]);

        let frame = buffer.extract_frame(3200).unwrap();
        assert_eq!(frame.len(), 3200);
        assert_eq!(buffer.pending_len(), 0);
        assert!(buffer.extract_frame(3200).is_none());
    }

    #[test]
    fn test_remainder_is_pushed_back_in_order() {
        let mut buffer = FrameBuffer::new();
        let data = pattern(250, 0);
        buffer.append(data.clone());

        let frame = buffer.extract_frame(100).unwrap();
        assert_eq!(frame, data[..100]);
        assert_eq!(buffer.pending_len(), 150);
        assert_eq!(buffer.fragment_count(), 1);

        let frame = buffer.extract_frame(100).unwrap();
        assert_eq!(frame, data[100..200]);
        assert_eq!(buffer.pending_len(), 50);
    }

    #[test]
    fn test_single_append_can_yield_several_frames() {
        let mut buffer = FrameBuffer::new();
        buffer.append(vec![7u8; 1000]);

        let mut frames = Vec::new();
        while let Some(frame) = buffer.extract_frame(320) {
            frames.push(frame);
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(buffer.pending_len(), 40);
    }

    #[test]
    fn test_frames_concatenate_back_to_the_input() {
        let sizes = [33usize, 1, 400, 159, 160, 161, 999, 7, 3200, 12];
        let mut buffer = FrameBuffer::new();
        let mut appended = Vec::new();
        let mut extracted = Vec::new();

        let mut offset = 0;
        for size in sizes {
            let fragment = pattern(size, offset);
            offset += size;
            appended.extend_from_slice(&fragment);
            buffer.append(fragment);

            while let Some(frame) = buffer.extract_frame(160) {
                assert_eq!(frame.len(), 160);
                extracted.extend_from_slice(&frame);
            }
        }

        let remainder = appended.len() % 160;
        assert_eq!(buffer.pending_len(), remainder);
        assert_eq!(extracted, appended[..appended.len() - remainder]);
    }

    #[test]
    fn test_reset_clears_pending_audio() {
        let mut buffer = FrameBuffer::new();
        buffer.append(vec![1u8; 10]);
        buffer.append(vec![2u8; 20]);

        buffer.reset();
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.fragment_count(), 0);
        assert!(buffer.extract_frame(1).is_none());
    }

    #[test]
    fn test_zero_size_and_empty_fragments() {
        let mut buffer = FrameBuffer::new();
        buffer.append(Vec::new());
        assert_eq!(buffer.fragment_count(), 0);

        buffer.append(vec![1u8; 4]);
        assert!(buffer.extract_frame(0).is_none());
        assert_eq!(buffer.pending_len(), 4);
    }
}
