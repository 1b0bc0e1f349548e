//! Encoded access units and codec parameters

use bytes::Bytes;
use serde::Serialize;

/// One independent timed stream within the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// Flags carried by an encoded sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    /// Sample starts an independently decodable unit
    pub key_frame: bool,
    /// Sample carries in-band codec configuration rather than media data
    pub codec_config: bool,
    /// Last sample of the stream
    pub end_of_stream: bool,
}

/// One encoded access unit
///
/// Presentation timestamps are microseconds on the producing encoder's
/// clock and non-decreasing per track. The payload is `Bytes`: sinks keep
/// their own cheap handle and never hold on to encoder-owned buffers.
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub data: Bytes,
    pub pts_us: i64,
    pub duration_us: i64,
    pub flags: SampleFlags,
}

impl EncodedSample {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Out-of-band codec configuration for one track
///
/// Produced exactly once per encoder configuration epoch; both sinks
/// require a track's `CodecParams` before they may accept samples for it.
/// `extradata` carries the parameter sets (SPS/PPS for H.264, the
/// AudioSpecificConfig for AAC) in the encoder's global-header form.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecParams {
    pub kind: TrackKind,
    /// MIME-style codec name ("video/avc", "audio/aac")
    pub mime: String,
    /// Video width in pixels (zero for audio)
    pub width: u32,
    /// Video height in pixels (zero for audio)
    pub height: u32,
    /// Audio sample rate in Hz (zero for video)
    pub sample_rate: u32,
    /// Audio channel count (zero for video)
    pub channels: u32,
    /// Target bitrate in kbps
    pub bitrate_kbps: u32,
    /// Out-of-band parameter sets
    pub extradata: Bytes,
}

impl CodecParams {
    pub fn video(width: u32, height: u32, bitrate_kbps: u32, extradata: Bytes) -> Self {
        Self {
            kind: TrackKind::Video,
            mime: "video/avc".to_string(),
            width,
            height,
            sample_rate: 0,
            channels: 0,
            bitrate_kbps,
            extradata,
        }
    }

    pub fn audio(sample_rate: u32, channels: u32, bitrate_kbps: u32, extradata: Bytes) -> Self {
        Self {
            kind: TrackKind::Audio,
            mime: "audio/aac".to_string(),
            width: 0,
            height: 0,
            sample_rate,
            channels,
            bitrate_kbps,
            extradata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_params_constructors() {
        let v = CodecParams::video(1280, 720, 2500, Bytes::new());
        assert_eq!(v.kind, TrackKind::Video);
        assert_eq!((v.width, v.height), (1280, 720));
        assert_eq!(v.sample_rate, 0);

        let a = CodecParams::audio(48000, 1, 96, Bytes::new());
        assert_eq!(a.kind, TrackKind::Audio);
        assert_eq!(a.sample_rate, 48000);
        assert_eq!(a.width, 0);
    }
}
