//! Media data model
//!
//! Raw input frames pushed by the capture adapter, encoded access units
//! produced by the codec backends, and the per-track out-of-band codec
//! parameters both sinks require before accepting samples.

pub mod clock;
pub mod frame;
pub mod sample;

pub use clock::MediaClock;
pub use frame::{PcmBlock, RawVideoFrame};
pub use sample::{CodecParams, EncodedSample, SampleFlags, TrackKind};
