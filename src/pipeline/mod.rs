//! Pipeline orchestration
//!
//! The [`Coordinator`] owns the encoders and both sinks, decides the
//! operating mode, and routes every encoded sample to the sinks that
//! should receive it.

pub mod coordinator;

pub use coordinator::{Coordinator, CoordinatorParts, OperatingMode, PipelineStatus};
