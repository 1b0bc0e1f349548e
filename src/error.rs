use thiserror::Error;

/// Pipeline-wide error type
///
/// Variants follow the failure classes of the pipeline: codec setup,
/// transport sessions, container muxing, and illegal mode changes.
/// Per-sample drop conditions are never surfaced through this type; they
/// are logged and swallowed at the point of the drop.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Muxer error: {0}")]
    Muxer(String),

    #[error("Invalid mode transition: {0}")]
    InvalidMode(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ffmpeg_next::Error> for PipelineError {
    fn from(e: ffmpeg_next::Error) -> Self {
        PipelineError::Media(e.to_string())
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, PipelineError>;
