//! Recording session muxer
//!
//! Wraps a [`ContainerWriter`] with the multi-track start gate: the
//! container must not start until every expected track has registered its
//! codec parameters, and any sample arriving earlier is silently dropped
//! (no prior frames can be reconstructed after the fact, so there is
//! nothing useful to do with them).
//!
//! Writes arrive concurrently from the video and audio drain loops; every
//! state transition and write goes through one mutex.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{DeviceInfo, RecordSettings};
use crate::drop_logged;
use crate::error::{PipelineError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::media::{CodecParams, EncodedSample, TrackKind};
use crate::utils::DropLog;

use super::container::{ContainerFactory, ContainerWriter, TrackId};
use super::sidecar::{self, IndexEntry, SidecarMeta, VideoTrackMeta};

struct RecorderInner {
    writer: Option<Box<dyn ContainerWriter>>,
    expect_audio: bool,
    video_track: Option<TrackId>,
    audio_track: Option<TrackId>,
    video_params: Option<CodecParams>,
    started: bool,
    finalized: bool,
    video_samples: u64,
    audio_samples: u64,
}

/// One recording session; created per start-recording request, finalized
/// exactly once, never reused
pub struct Recorder {
    inner: Mutex<RecorderInner>,
    path: PathBuf,
    output_dir: PathBuf,
    created_at: DateTime<Utc>,
    opened_at: Instant,
    device: DeviceInfo,
    events: Arc<EventBus>,
    throttle: DropLog,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("path", &self.path)
            .field("output_dir", &self.output_dir)
            .field("created_at", &self.created_at)
            .field("device", &self.device)
            .finish()
    }
}

impl Recorder {
    /// Open a new container in the configured output directory.
    ///
    /// `expect_audio` fixes the track set for the session's lifetime: an
    /// audio-less session starts as soon as the video track registers.
    pub fn create(
        settings: &RecordSettings,
        device: DeviceInfo,
        expect_audio: bool,
        factory: &dyn ContainerFactory,
        events: Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&settings.output_dir)?;
        let created_at = Utc::now();
        let file_name = format!(
            "{}_{}.mp4",
            settings.file_prefix,
            created_at.format("%Y%m%d_%H%M%S")
        );
        let path = settings.output_dir.join(file_name);
        let writer = factory.open(&path)?;
        info!(
            "recording container opened: {} (audio: {})",
            path.display(),
            expect_audio
        );

        Ok(Arc::new(Self {
            inner: Mutex::new(RecorderInner {
                writer: Some(writer),
                expect_audio,
                video_track: None,
                audio_track: None,
                video_params: None,
                started: false,
                finalized: false,
                video_samples: 0,
                audio_samples: 0,
            }),
            path,
            output_dir: settings.output_dir.clone(),
            created_at,
            opened_at: Instant::now(),
            device,
            events,
            throttle: DropLog::with_defaults(),
        }))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    /// Register a track's codec parameters.
    ///
    /// The container starts automatically the moment every expected track
    /// is registered. Registration after start, duplicate registration,
    /// and audio registration on an audio-less session are usage errors.
    pub fn register_track(&self, params: &CodecParams) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.finalized {
            return Err(PipelineError::Muxer(
                "recording already finalized".to_string(),
            ));
        }
        if inner.started {
            return Err(PipelineError::Muxer(format!(
                "{} track registration after container start",
                params.kind
            )));
        }

        let RecorderInner {
            writer,
            expect_audio,
            video_track,
            audio_track,
            video_params,
            started,
            ..
        } = &mut *inner;
        let writer = writer
            .as_mut()
            .ok_or_else(|| PipelineError::Muxer("container writer released".to_string()))?;

        match params.kind {
            TrackKind::Video => {
                if video_track.is_some() {
                    return Err(PipelineError::Muxer(
                        "video track already registered".to_string(),
                    ));
                }
                let id = writer.add_track(params)?;
                *video_track = Some(id);
                *video_params = Some(params.clone());
            }
            TrackKind::Audio => {
                if !*expect_audio {
                    return Err(PipelineError::Muxer(
                        "audio track on an audio-less recording".to_string(),
                    ));
                }
                if audio_track.is_some() {
                    return Err(PipelineError::Muxer(
                        "audio track already registered".to_string(),
                    ));
                }
                let id = writer.add_track(params)?;
                *audio_track = Some(id);
            }
        }

        // hard invariant: started implies every required track registered
        let all_registered = video_track.is_some() && (!*expect_audio || audio_track.is_some());
        if all_registered && !*started {
            writer.start()?;
            *started = true;
            info!("recording started: {}", self.path.display());
            self.events.publish(PipelineEvent::RecordingStarted {
                path: self.path.display().to_string(),
            });
        }
        Ok(())
    }

    /// Write one sample. Samples arriving before the container has started
    /// (or for an unregistered track) are dropped with a throttled log;
    /// actual container I/O failures propagate.
    pub fn write_sample(&self, kind: TrackKind, sample: &EncodedSample) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.finalized {
            drop_logged!(self.throttle, "record_finalized", "{} sample dropped: recording finalized", kind);
            return Ok(());
        }
        if !inner.started {
            drop_logged!(self.throttle, "record_not_started", "{} sample dropped: container not started", kind);
            return Ok(());
        }
        let track = match kind {
            TrackKind::Video => inner.video_track,
            TrackKind::Audio => inner.audio_track,
        };
        let Some(track) = track else {
            drop_logged!(self.throttle, "record_no_track", "{} sample dropped: no such track", kind);
            return Ok(());
        };

        inner
            .writer
            .as_mut()
            .expect("writer present until finalize")
            .write_sample(track, sample)?;
        match kind {
            TrackKind::Video => inner.video_samples += 1,
            TrackKind::Audio => inner.audio_samples += 1,
        }
        Ok(())
    }

    /// Stop the writer (if it ever started), release it, then best-effort
    /// write the sidecar and index entry. Idempotent; safe when no track
    /// ever registered.
    pub fn finalize(&self) -> Result<()> {
        let meta = {
            let mut inner = self.inner.lock();
            if inner.finalized {
                return Ok(());
            }
            inner.finalized = true;

            if let Some(mut writer) = inner.writer.take() {
                if inner.started {
                    writer.finish()?;
                }
            }

            SidecarMeta {
                created_utc: self.created_at,
                device: self.device.clone(),
                video: inner.video_params.as_ref().map(|p| VideoTrackMeta {
                    width: p.width,
                    height: p.height,
                }),
                audio_enabled: inner.expect_audio,
                video_samples: inner.video_samples,
                audio_samples: inner.audio_samples,
                duration_ms: self.opened_at.elapsed().as_millis() as u64,
            }
        };

        if let Err(e) = sidecar::write_sidecar(&self.path, &meta) {
            warn!("sidecar write failed for {}: {}", self.path.display(), e);
        }
        let entry = IndexEntry {
            file: self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            created_utc: self.created_at,
            duration_ms: meta.duration_ms,
        };
        if let Err(e) = sidecar::append_index(&self.output_dir, entry) {
            warn!("recordings index update failed: {}", e);
        }

        info!("recording finalized: {}", self.path.display());
        self.events.publish(PipelineEvent::RecordingFinished {
            path: self.path.display().to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryContainerFactory, WriterCall};
    use bytes::Bytes;

    fn sample() -> EncodedSample {
        EncodedSample {
            data: Bytes::from_static(b"frame"),
            pts_us: 0,
            duration_us: 33_333,
            flags: Default::default(),
        }
    }

    fn recorder(expect_audio: bool) -> (Arc<Recorder>, MemoryContainerFactory, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = RecordSettings {
            output_dir: dir.path().to_path_buf(),
            file_prefix: "REC".to_string(),
        };
        let factory = MemoryContainerFactory::new();
        let rec = Recorder::create(
            &settings,
            DeviceInfo::default(),
            expect_audio,
            &factory,
            Arc::new(EventBus::new()),
        )
        .unwrap();
        (rec, factory, dir)
    }

    #[test]
    fn test_writes_before_registration_are_noops() {
        let (rec, factory, _dir) = recorder(true);
        for _ in 0..5 {
            rec.write_sample(TrackKind::Video, &sample()).unwrap();
        }
        assert!(!rec.is_started());
        // nothing reached the container
        assert!(factory.calls().is_empty());
        rec.finalize().unwrap();
    }

    #[test]
    fn test_start_waits_for_all_required_tracks() {
        let (rec, factory, _dir) = recorder(true);
        rec.register_track(&CodecParams::video(1280, 720, 2500, Bytes::new()))
            .unwrap();
        assert!(!rec.is_started());
        // video samples before the audio track registers are dropped
        rec.write_sample(TrackKind::Video, &sample()).unwrap();
        assert!(!factory.calls().iter().any(|c| matches!(c, WriterCall::Write(..))));

        rec.register_track(&CodecParams::audio(48000, 1, 96, Bytes::new()))
            .unwrap();
        assert!(rec.is_started());

        // exactly one start, after both registrations
        let calls = factory.calls();
        let starts = calls.iter().filter(|c| matches!(c, WriterCall::Start)).count();
        assert_eq!(starts, 1);
        assert!(matches!(calls[..], [WriterCall::AddTrack(TrackKind::Video), WriterCall::AddTrack(TrackKind::Audio), WriterCall::Start]));
    }

    #[test]
    fn test_audio_less_recording_starts_on_video_alone() {
        let (rec, factory, _dir) = recorder(false);
        rec.register_track(&CodecParams::video(1280, 720, 2500, Bytes::new()))
            .unwrap();
        assert!(rec.is_started());

        rec.write_sample(TrackKind::Video, &sample()).unwrap();
        // audio samples have no track and are dropped, not errors
        rec.write_sample(TrackKind::Audio, &sample()).unwrap();
        rec.finalize().unwrap();

        let calls = factory.calls();
        let writes = calls
            .iter()
            .filter(|c| matches!(c, WriterCall::Write(TrackKind::Audio, _)))
            .count();
        assert_eq!(writes, 0);
    }

    #[test]
    fn test_audio_registration_rejected_on_audio_less_session() {
        let (rec, _factory, _dir) = recorder(false);
        let err = rec
            .register_track(&CodecParams::audio(48000, 1, 96, Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Muxer(_)));
    }

    #[test]
    fn test_registration_after_start_rejected() {
        let (rec, _factory, _dir) = recorder(false);
        rec.register_track(&CodecParams::video(1280, 720, 2500, Bytes::new()))
            .unwrap();
        let err = rec
            .register_track(&CodecParams::video(640, 480, 2500, Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Muxer(_)));
    }

    #[test]
    fn test_finalize_idempotent_and_safe_without_start() {
        let (rec, factory, _dir) = recorder(true);
        rec.finalize().unwrap();
        rec.finalize().unwrap();
        // never started: the container was never told to start or finish
        assert!(factory.calls().iter().all(|c| !matches!(c, WriterCall::Start | WriterCall::Finish)));
    }

    #[test]
    fn test_sidecar_and_index_written_on_finalize() {
        let (rec, _factory, dir) = recorder(false);
        rec.register_track(&CodecParams::video(1280, 720, 2500, Bytes::new()))
            .unwrap();
        rec.write_sample(TrackKind::Video, &sample()).unwrap();
        rec.finalize().unwrap();

        let sidecar = rec.path().with_extension("json");
        assert!(sidecar.exists());
        let data = std::fs::read_to_string(&sidecar).unwrap();
        assert!(data.contains("\"video_samples\": 1"));
        assert!(dir.path().join("recordings.json").exists());
    }

    #[test]
    fn test_container_open_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RecordSettings {
            output_dir: dir.path().to_path_buf(),
            file_prefix: "REC".to_string(),
        };
        let factory = MemoryContainerFactory::new();
        factory.fail_open(true);
        let err = Recorder::create(
            &settings,
            DeviceInfo::default(),
            false,
            &factory,
            Arc::new(EventBus::new()),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Muxer(_)));
    }

    #[test]
    fn test_container_write_failure_propagates() {
        let (rec, factory, _dir) = recorder(false);
        rec.register_track(&CodecParams::video(1280, 720, 2500, Bytes::new()))
            .unwrap();
        factory.fail_writes(true);
        let err = rec.write_sample(TrackKind::Video, &sample()).unwrap_err();
        assert!(matches!(err, PipelineError::Muxer(_)));
    }

    #[test]
    fn test_writes_after_finalize_are_noops() {
        let (rec, factory, _dir) = recorder(false);
        rec.register_track(&CodecParams::video(1280, 720, 2500, Bytes::new()))
            .unwrap();
        rec.finalize().unwrap();
        rec.write_sample(TrackKind::Video, &sample()).unwrap();
        let writes = factory
            .calls()
            .iter()
            .filter(|c| matches!(c, WriterCall::Write(..)))
            .count();
        assert_eq!(writes, 0);
    }
}
