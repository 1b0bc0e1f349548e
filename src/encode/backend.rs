//! Codec backend traits and the encoder output event type

use crate::config::{AudioSettings, VideoSettings};
use crate::error::Result;
use crate::media::{CodecParams, EncodedSample, RawVideoFrame};

/// Output of an encoder drain loop
///
/// Exactly one `Config` is emitted per configuration epoch, always before
/// the epoch's first `Sample`.
#[derive(Debug, Clone)]
pub enum EncoderEvent {
    Config(CodecParams),
    Sample(EncodedSample),
}

/// A configured video codec instance
///
/// Not `Sync`: a codec is owned by exactly one drain loop.
pub trait VideoCodec: Send {
    /// Out-of-band parameters for this configuration epoch
    fn params(&self) -> &CodecParams;

    /// Encode one raw frame; may yield zero or more access units
    fn encode(&mut self, frame: &RawVideoFrame, pts_us: i64) -> Result<Vec<EncodedSample>>;

    /// Ask for an IDR on the next encoded frame (used after reconnects)
    fn request_key_frame(&mut self) {}
}

/// Opens video codec instances for given settings and dimensions
pub trait VideoCodecFactory: Send + Sync {
    fn open(
        &self,
        settings: &VideoSettings,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoCodec>>;
}

/// A configured audio codec instance
pub trait AudioCodec: Send {
    /// Out-of-band parameters for this configuration epoch
    fn params(&self) -> &CodecParams;

    /// Encode a block of mono PCM samples; the backend buffers internally
    /// until it can emit full access units
    fn encode(&mut self, pcm: &[i16], pts_us: i64) -> Result<Vec<EncodedSample>>;
}

/// Opens audio codec instances for given settings
pub trait AudioCodecFactory: Send + Sync {
    fn open(&self, settings: &AudioSettings) -> Result<Box<dyn AudioCodec>>;
}
