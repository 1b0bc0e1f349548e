//! Encoding pipeline
//!
//! Codec backends are trait objects behind [`VideoCodec`]/[`AudioCodec`]
//! so the drain-loop machinery is independent of the FFmpeg production
//! backends; [`VideoEncoder`]/[`AudioEncoder`] own a backend plus the
//! submit queue and bounded-wait drain task.

pub mod audio;
pub mod backend;
pub mod ffmpeg;
pub mod video;

pub use audio::AudioEncoder;
pub use backend::{AudioCodec, AudioCodecFactory, EncoderEvent, VideoCodec, VideoCodecFactory};
pub use ffmpeg::{FfmpegAudioFactory, FfmpegVideoFactory};
pub use video::VideoEncoder;
