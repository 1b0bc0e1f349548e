//! Test doubles for the pipeline's collaborator seams
//!
//! One double per production implementation: stub codecs for the FFmpeg
//! backends, a scripted transport for the RTMP session, and an in-memory
//! container writer that records its call sequence for invariant checks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::config::{AudioSettings, VideoSettings};
use crate::encode::{AudioCodec, AudioCodecFactory, VideoCodec, VideoCodecFactory};
use crate::error::{PipelineError, Result};
use crate::media::{CodecParams, EncodedSample, RawVideoFrame, SampleFlags, TrackKind};
use crate::net::Transport;
use crate::record::{ContainerFactory, ContainerWriter, TrackId};

pub const FAIL_OPEN: bool = true;

// ============================================================================
// Codec stubs
// ============================================================================

pub struct StubVideoCodec {
    params: CodecParams,
    frame_duration_us: i64,
    count: u64,
    last_pts: i64,
    force_key: bool,
}

impl VideoCodec for StubVideoCodec {
    fn params(&self) -> &CodecParams {
        &self.params
    }

    fn encode(&mut self, _frame: &RawVideoFrame, pts_us: i64) -> Result<Vec<EncodedSample>> {
        let pts = pts_us.max(self.last_pts);
        self.last_pts = pts;
        let key_frame = self.count % 30 == 0 || std::mem::take(&mut self.force_key);
        self.count += 1;
        Ok(vec![EncodedSample {
            data: Bytes::from(vec![0u8; 128]),
            pts_us: pts,
            duration_us: self.frame_duration_us,
            flags: SampleFlags {
                key_frame,
                ..Default::default()
            },
        }])
    }

    fn request_key_frame(&mut self) {
        self.force_key = true;
    }
}

#[derive(Default)]
pub struct StubVideoFactory {
    fail_open: bool,
    opened: AtomicUsize,
}

impl StubVideoFactory {
    pub fn new(fail_open: bool) -> Self {
        Self {
            fail_open,
            opened: AtomicUsize::new(0),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

impl VideoCodecFactory for StubVideoFactory {
    fn open(
        &self,
        settings: &VideoSettings,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoCodec>> {
        if self.fail_open {
            return Err(PipelineError::Configuration(
                "stub video codec open failure".to_string(),
            ));
        }
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(StubVideoCodec {
            params: CodecParams::video(
                width,
                height,
                settings.bitrate_kbps,
                Bytes::from_static(b"sps+pps"),
            ),
            frame_duration_us: 1_000_000 / settings.fps.max(1) as i64,
            count: 0,
            last_pts: 0,
            force_key: false,
        }))
    }
}

pub struct StubAudioCodec {
    params: CodecParams,
    last_pts: i64,
}

impl AudioCodec for StubAudioCodec {
    fn params(&self) -> &CodecParams {
        &self.params
    }

    fn encode(&mut self, pcm: &[i16], pts_us: i64) -> Result<Vec<EncodedSample>> {
        let pts = pts_us.max(self.last_pts);
        self.last_pts = pts;
        Ok(vec![EncodedSample {
            data: Bytes::from(vec![0u8; pcm.len().min(64)]),
            pts_us: pts,
            duration_us: 21_333,
            flags: SampleFlags {
                key_frame: true,
                ..Default::default()
            },
        }])
    }
}

#[derive(Default)]
pub struct StubAudioFactory {
    fail_open: bool,
    opened: AtomicUsize,
}

impl StubAudioFactory {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

impl AudioCodecFactory for StubAudioFactory {
    fn open(&self, settings: &AudioSettings) -> Result<Box<dyn AudioCodec>> {
        if self.fail_open {
            return Err(PipelineError::Configuration(
                "stub audio codec open failure".to_string(),
            ));
        }
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(StubAudioCodec {
            params: CodecParams::audio(
                settings.sample_rate,
                settings.channels,
                settings.bitrate_kbps,
                Bytes::from_static(b"asc"),
            ),
            last_pts: 0,
        }))
    }
}

// ============================================================================
// Transport double
// ============================================================================

#[derive(Default)]
pub struct MockTransport {
    scripted: Mutex<VecDeque<std::result::Result<(), String>>>,
    fail_all: AtomicBool,
    fail_send: AtomicBool,
    hold: AtomicBool,
    connects: Mutex<Vec<tokio::time::Instant>>,
    sends: AtomicUsize,
    infos: Mutex<Vec<TrackKind>>,
    disconnects: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue per-call connect outcomes; once drained, `fail_all` applies
    pub fn script_connects(&self, results: Vec<std::result::Result<(), String>>) {
        *self.scripted.lock() = results.into();
    }

    pub fn fail_all_connects(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Park connect calls until released, to observe the Connecting state
    pub fn hold_connects(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn connect_times(&self) -> Vec<tokio::time::Instant> {
        self.connects.lock().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn info_kinds(&self) -> Vec<TrackKind> {
        self.infos.lock().clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub async fn wait_for_connects(&self, n: usize) {
        while self.connect_count() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _url: &str) -> Result<()> {
        self.connects.lock().push(tokio::time::Instant::now());
        while self.hold.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if let Some(result) = self.scripted.lock().pop_front() {
            return result.map_err(PipelineError::Connection);
        }
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(PipelineError::Connection("scripted failure".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn set_video_info(&self, _params: &CodecParams) -> Result<()> {
        self.infos.lock().push(TrackKind::Video);
        Ok(())
    }

    async fn set_audio_info(&self, _params: &CodecParams) -> Result<()> {
        self.infos.lock().push(TrackKind::Audio);
        Ok(())
    }

    async fn send_video(&self, _sample: &EncodedSample) -> Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(PipelineError::Connection("scripted send failure".to_string()));
        }
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_audio(&self, _sample: &EncodedSample) -> Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(PipelineError::Connection("scripted send failure".to_string()));
        }
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Container double
// ============================================================================

/// One recorded call against a memory container writer
#[derive(Debug, Clone, PartialEq)]
pub enum WriterCall {
    AddTrack(TrackKind),
    Start,
    /// Track kind and sample pts
    Write(TrackKind, i64),
    Finish,
}

/// Factory sharing one call log across every writer it opens
#[derive(Clone, Default)]
pub struct MemoryContainerFactory {
    log: Arc<Mutex<Vec<WriterCall>>>,
    fail_open: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryContainerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<WriterCall> {
        self.log.lock().clone()
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl ContainerFactory for MemoryContainerFactory {
    fn open(&self, _path: &std::path::Path) -> Result<Box<dyn ContainerWriter>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(PipelineError::Muxer("scripted open failure".to_string()));
        }
        Ok(Box::new(MemoryWriter {
            log: self.log.clone(),
            fail_writes: self.fail_writes.clone(),
            tracks: Vec::new(),
            started: false,
        }))
    }
}

/// In-memory writer enforcing the container usage contract strictly, so a
/// recorder that violates the gating shows up as a test failure
pub struct MemoryWriter {
    log: Arc<Mutex<Vec<WriterCall>>>,
    fail_writes: Arc<AtomicBool>,
    tracks: Vec<TrackKind>,
    started: bool,
}

impl ContainerWriter for MemoryWriter {
    fn add_track(&mut self, params: &CodecParams) -> Result<TrackId> {
        if self.started {
            return Err(PipelineError::Muxer(
                "add_track after container start".to_string(),
            ));
        }
        self.tracks.push(params.kind);
        self.log.lock().push(WriterCall::AddTrack(params.kind));
        Ok(self.tracks.len() - 1)
    }

    fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(PipelineError::Muxer("container started twice".to_string()));
        }
        self.started = true;
        self.log.lock().push(WriterCall::Start);
        Ok(())
    }

    fn write_sample(&mut self, track: TrackId, sample: &EncodedSample) -> Result<()> {
        if !self.started {
            return Err(PipelineError::Muxer(
                "write before container start".to_string(),
            ));
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PipelineError::Muxer("scripted write failure".to_string()));
        }
        let kind = *self
            .tracks
            .get(track)
            .ok_or_else(|| PipelineError::Muxer(format!("unknown track {}", track)))?;
        self.log.lock().push(WriterCall::Write(kind, sample.pts_us));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.log.lock().push(WriterCall::Finish);
        Ok(())
    }
}
