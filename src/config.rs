//! Pipeline configuration
//!
//! All settings are plain values handed to the [`Coordinator`] at
//! construction and updated through explicit setters; there is no ambient
//! global store. Every section derives serde so a caller can load the
//! whole config from a file or build it in code.
//!
//! [`Coordinator`]: crate::pipeline::Coordinator

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Video encoder settings
    pub video: VideoSettings,
    /// Audio encoder settings
    pub audio: AudioSettings,
    /// Network streaming settings
    pub stream: StreamSettings,
    /// Local recording settings
    pub record: RecordSettings,
    /// Capture device attributes (recorded into sidecar metadata)
    pub device: DeviceInfo,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video: VideoSettings::default(),
            audio: AudioSettings::default(),
            stream: StreamSettings::default(),
            record: RecordSettings::default(),
            device: DeviceInfo::default(),
        }
    }
}

/// Video encoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoSettings {
    /// Encoder name passed to FFmpeg (e.g. "libx264", "h264_vaapi")
    pub codec: String,
    /// Capture width in pixels; incoming frames with other dimensions
    /// trigger encoder reconfiguration
    pub width: u32,
    /// Capture height in pixels
    pub height: u32,
    /// Target frame rate
    pub fps: u32,
    /// Target bitrate in kbps
    pub bitrate_kbps: u32,
    /// Keyframe interval in frames
    pub gop: u32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            codec: "libx264".to_string(),
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_kbps: 2500,
            gop: 60,
        }
    }
}

/// Audio encoder settings
///
/// The wearable delivers PCM16 mono; sample rate and channel count here
/// describe that input and the encoded track alike.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioSettings {
    /// Whether audio capture/encoding is enabled
    pub enabled: bool,
    /// Encoder name passed to FFmpeg
    pub codec: String,
    /// Input/output sample rate in Hz
    pub sample_rate: u32,
    /// Channel count (the wearable microphone is mono)
    pub channels: u32,
    /// Target bitrate in kbps
    pub bitrate_kbps: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            codec: "aac".to_string(),
            sample_rate: 48000,
            channels: 1,
            bitrate_kbps: 96,
        }
    }
}

/// Network streaming settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamSettings {
    /// Endpoint URL (e.g. "rtmp://host/live/key"); None means streaming
    /// cannot be started until a URL is set
    pub url: Option<String>,
    /// Maximum reconnect attempts per connectivity-loss episode
    pub reconnect_attempts: u32,
    /// Base backoff delay before the first reconnect attempt, in
    /// milliseconds; doubles for each subsequent attempt
    pub reconnect_backoff_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            url: None,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 1000,
        }
    }
}

/// Local recording settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecordSettings {
    /// Directory recordings are written into (created on demand)
    pub output_dir: PathBuf,
    /// File name prefix for recordings and their sidecars
    pub file_prefix: String,
}

impl Default for RecordSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            file_prefix: "REC".to_string(),
        }
    }
}

/// Capture device attributes, persisted into each recording's sidecar
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceInfo {
    /// Human-readable device name
    pub name: String,
    /// Hardware model identifier
    pub model: String,
    /// Firmware revision reported by the device
    pub firmware: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: "wearable-camera".to_string(),
            model: String::new(),
            firmware: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.video.width, 1280);
        assert_eq!(config.video.height, 720);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.stream.reconnect_attempts, 3);
        assert_eq!(config.stream.reconnect_backoff_ms, 1000);
        assert!(config.stream.url.is_none());
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"video": {"width": 1920, "height": 1080}}"#).unwrap();
        assert_eq!(config.video.width, 1920);
        // untouched sections keep their defaults
        assert_eq!(config.video.fps, 30);
        assert_eq!(config.audio.codec, "aac");
    }
}
