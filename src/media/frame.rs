//! Raw capture frames
//!
//! The wearable pushes planar YUV 4:2:0 video frames and PCM16 mono audio
//! blocks. Payloads are `Bytes` so a frame can be handed between tasks
//! without copying.

use bytes::Bytes;
use std::time::Instant;

/// A raw planar YUV 4:2:0 video frame as pushed by the capture adapter
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    /// Planar YUV420 payload: Y plane, then U, then V, no padding
    pub data: Bytes,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Capture timestamp on the monotonic clock
    pub timestamp: Instant,
}

impl RawVideoFrame {
    pub fn new(data: Bytes, width: u32, height: u32, timestamp: Instant) -> Self {
        Self {
            data,
            width,
            height,
            timestamp,
        }
    }

    /// Expected payload length for the frame's dimensions
    pub fn expected_len(&self) -> usize {
        let luma = self.width as usize * self.height as usize;
        luma + luma / 2
    }

    /// Whether the payload holds a complete YUV420 frame
    pub fn is_complete(&self) -> bool {
        self.data.len() >= self.expected_len()
    }
}

/// A block of raw PCM16 little-endian mono audio
#[derive(Debug, Clone)]
pub struct PcmBlock {
    /// S16LE payload
    pub data: Bytes,
    /// Capture timestamp on the monotonic clock
    pub timestamp: Instant,
}

impl PcmBlock {
    pub fn new(data: Bytes, timestamp: Instant) -> Self {
        Self { data, timestamp }
    }

    /// Number of 16-bit samples in the block
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }

    /// Decode the payload into i16 samples.
    ///
    /// `Bytes` carries no alignment guarantee, so fall back to a copying
    /// conversion when the zero-copy cast is rejected.
    pub fn samples(&self) -> Vec<i16> {
        match bytemuck::try_cast_slice::<u8, i16>(&self.data) {
            Ok(slice) => slice.to_vec(),
            Err(_) => self
                .data
                .chunks_exact(2)
                .map(|c| i16::from_le_bytes([c[0], c[1]]))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_len() {
        let frame = RawVideoFrame::new(Bytes::new(), 1280, 720, Instant::now());
        assert_eq!(frame.expected_len(), 1280 * 720 * 3 / 2);
        assert!(!frame.is_complete());
    }

    #[test]
    fn test_pcm_samples_little_endian() {
        let block = PcmBlock::new(Bytes::from(vec![0x01, 0x00, 0xff, 0x7f]), Instant::now());
        assert_eq!(block.sample_count(), 2);
        assert_eq!(block.samples(), vec![1, i16::MAX]);
    }
}
