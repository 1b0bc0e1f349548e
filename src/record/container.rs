//! Container writer abstraction and the MP4 implementation

use std::path::Path;

use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::media::{CodecParams, EncodedSample, TrackKind};
use crate::utils::ffmpeg::{apply_codec_params, ensure_init, micros_time_base, packet_from_sample};

/// Opaque per-track handle assigned by the container writer
pub type TrackId = usize;

/// Seam between the recorder and the container library.
///
/// Usage contract enforced by the [`Recorder`](super::Recorder): every
/// track is added before `start`, samples are written only between `start`
/// and `finish`. A writer treats violations as hard errors rather than
/// papering over them.
pub trait ContainerWriter: Send {
    /// Register a track and return its handle
    fn add_track(&mut self, params: &CodecParams) -> Result<TrackId>;

    /// Begin emitting sample data; valid once, after all tracks are added
    fn start(&mut self) -> Result<()>;

    /// Append one encoded sample to a track
    fn write_sample(&mut self, track: TrackId, sample: &EncodedSample) -> Result<()>;

    /// Stop and release the writer; idempotent
    fn finish(&mut self) -> Result<()>;
}

/// Opens container writers for recording paths
pub trait ContainerFactory: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn ContainerWriter>>;
}

/// MP4 writer over FFmpeg's muxer
pub struct Mp4Writer {
    octx: ffmpeg_next::format::context::Output,
    started: bool,
    finished: bool,
}

impl Mp4Writer {
    pub fn create(path: &Path) -> Result<Self> {
        ensure_init();
        let octx = ffmpeg_next::format::output(&path)
            .map_err(|e| PipelineError::Muxer(format!("open {}: {}", path.display(), e)))?;
        Ok(Self {
            octx,
            started: false,
            finished: false,
        })
    }
}

impl ContainerWriter for Mp4Writer {
    fn add_track(&mut self, params: &CodecParams) -> Result<TrackId> {
        if self.started {
            return Err(PipelineError::Muxer(
                "cannot add a track after the container has started".to_string(),
            ));
        }
        let codec_id = match params.kind {
            TrackKind::Video => ffmpeg_next::codec::Id::H264,
            TrackKind::Audio => ffmpeg_next::codec::Id::AAC,
        };
        let mut stream = self
            .octx
            .add_stream(ffmpeg_next::encoder::find(codec_id))
            .map_err(|e| PipelineError::Muxer(format!("add {} track: {}", params.kind, e)))?;
        apply_codec_params(&mut stream, params)?;
        let index = stream.index();
        debug!("mp4 {} track added (stream {})", params.kind, index);
        Ok(index)
    }

    fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(PipelineError::Muxer("container already started".to_string()));
        }
        self.octx
            .write_header()
            .map_err(|e| PipelineError::Muxer(format!("container header: {}", e)))?;
        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track: TrackId, sample: &EncodedSample) -> Result<()> {
        if !self.started {
            return Err(PipelineError::Muxer(
                "write before container start".to_string(),
            ));
        }
        let time_base = self
            .octx
            .stream(track)
            .map(|s| s.time_base())
            .unwrap_or_else(micros_time_base);
        let mut packet = packet_from_sample(sample, track, time_base);
        packet
            .write_interleaved(&mut self.octx)
            .map_err(|e| PipelineError::Muxer(format!("container write: {}", e)))
    }

    fn finish(&mut self) -> Result<()> {
        if self.started && !self.finished {
            self.finished = true;
            self.octx
                .write_trailer()
                .map_err(|e| PipelineError::Muxer(format!("container trailer: {}", e)))?;
            info!("mp4 container finalized");
        }
        Ok(())
    }
}

/// Production container factory
pub struct Mp4ContainerFactory;

impl ContainerFactory for Mp4ContainerFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn ContainerWriter>> {
        Ok(Box::new(Mp4Writer::create(path)?))
    }
}
