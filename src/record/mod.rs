//! Local recording
//!
//! [`ContainerWriter`] abstracts the container library (production MP4
//! writer over FFmpeg, test double); [`Recorder`] enforces the multi-track
//! start synchronization: the container only starts once every expected
//! track has registered its codec parameters, and everything earlier is a
//! silent drop.

pub mod container;
pub mod recorder;
pub mod sidecar;

pub use container::{ContainerFactory, ContainerWriter, Mp4ContainerFactory, TrackId};
pub use recorder::Recorder;
