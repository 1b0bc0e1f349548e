//! Sidecar metadata and the recordings library index
//!
//! Every finalized recording gets a `.json` sidecar next to the container
//! with the capture-device attributes and creation time, and an entry in
//! the output directory's `recordings.json` index. Both are best-effort:
//! the container file is the durable artifact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DeviceInfo;
use crate::error::Result;

/// Sidecar contents for one recording
#[derive(Debug, Clone, Serialize)]
pub struct SidecarMeta {
    /// Creation timestamp (UTC, RFC 3339)
    pub created_utc: DateTime<Utc>,
    /// Capture device attributes
    pub device: DeviceInfo,
    /// Video track dimensions, if a video track was registered
    pub video: Option<VideoTrackMeta>,
    /// Whether the session recorded audio
    pub audio_enabled: bool,
    /// Samples written per track
    pub video_samples: u64,
    pub audio_samples: u64,
    /// Wall-clock duration from container open to finalize
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoTrackMeta {
    pub width: u32,
    pub height: u32,
}

/// One row of the recordings library index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub file: String,
    pub created_utc: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Sidecar path for a container file: same base name, `.json` extension
pub fn sidecar_path(container: &Path) -> PathBuf {
    container.with_extension("json")
}

/// Write the sidecar next to the container
pub fn write_sidecar(container: &Path, meta: &SidecarMeta) -> Result<()> {
    let data = serde_json::to_vec_pretty(meta)?;
    std::fs::write(sidecar_path(container), data)?;
    Ok(())
}

/// Append an entry to the directory's `recordings.json` index, creating
/// the index if absent. Stands in for an OS media-index registration.
pub fn append_index(dir: &Path, entry: IndexEntry) -> Result<()> {
    let index_path = dir.join("recordings.json");
    let mut entries: Vec<IndexEntry> = match std::fs::read(&index_path) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
        Err(_) => Vec::new(),
    };
    entries.push(entry);
    std::fs::write(&index_path, serde_json::to_vec_pretty(&entries)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_path_swaps_extension() {
        assert_eq!(
            sidecar_path(Path::new("/tmp/REC_20260806_120000.mp4")),
            PathBuf::from("/tmp/REC_20260806_120000.json")
        );
    }

    #[test]
    fn test_write_sidecar_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("REC_test.mp4");

        let meta = SidecarMeta {
            created_utc: Utc::now(),
            device: DeviceInfo::default(),
            video: Some(VideoTrackMeta {
                width: 1280,
                height: 720,
            }),
            audio_enabled: false,
            video_samples: 10,
            audio_samples: 0,
            duration_ms: 420,
        };
        write_sidecar(&container, &meta).unwrap();
        assert!(sidecar_path(&container).exists());

        append_index(
            dir.path(),
            IndexEntry {
                file: "REC_test.mp4".to_string(),
                created_utc: meta.created_utc,
                duration_ms: 420,
            },
        )
        .unwrap();
        append_index(
            dir.path(),
            IndexEntry {
                file: "REC_test2.mp4".to_string(),
                created_utc: meta.created_utc,
                duration_ms: 100,
            },
        )
        .unwrap();

        let data = std::fs::read(dir.path().join("recordings.json")).unwrap();
        let entries: Vec<IndexEntry> = serde_json::from_slice(&data).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].file, "REC_test2.mp4");
    }
}
