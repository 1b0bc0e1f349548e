//! Fan-out coordinator
//!
//! Owns the encoder instances and both sinks. Raw frames are pushed in
//! from the capture adapter on any thread; encoded output flows through
//! one router task per encoder, which forwards each event to the network
//! session (a no-op unless live) and to the active recorder, if any. The
//! routers are the only consumers of the encoder streams, so per-track
//! ordering is preserved end to end.
//!
//! Control operations (start/stop of either sink, audio toggling, config
//! updates) all serialize on one async lock; two concurrent
//! start-recording calls can never create two muxer sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::drop_logged;
use crate::encode::{
    AudioCodecFactory, AudioEncoder, EncoderEvent, FfmpegAudioFactory, FfmpegVideoFactory,
    VideoCodecFactory, VideoEncoder,
};
use crate::error::{PipelineError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::media::{MediaClock, PcmBlock, RawVideoFrame, TrackKind};
use crate::net::{NetworkSession, RtmpTransport, SessionState, Transport};
use crate::record::{ContainerFactory, Mp4ContainerFactory, Recorder};
use crate::utils::DropLog;

/// Encoder output channel depth
const ENCODER_EVENT_CAP: usize = 64;

/// Operating mode of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Neither sink active
    #[default]
    Idle,
    /// Network sink only
    StreamOnly,
    /// Network sink plus a recording attached to the same encoders
    StreamAndRecord,
    /// Recording with its own encoders, no network session
    RecordOnly,
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatingMode::Idle => write!(f, "idle"),
            OperatingMode::StreamOnly => write!(f, "stream"),
            OperatingMode::StreamAndRecord => write!(f, "stream+record"),
            OperatingMode::RecordOnly => write!(f, "record"),
        }
    }
}

/// Snapshot of the pipeline's observable state
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub mode: OperatingMode,
    pub session: SessionState,
    pub video_configured: bool,
    pub audio_active: bool,
    pub recording: Option<String>,
    pub recording_started: bool,
    pub frames_submitted: u64,
    pub frames_dropped: u64,
    pub samples_sent: u64,
    pub samples_dropped: u64,
    pub connect_attempts: u64,
    pub reconnect_episodes: u64,
}

/// Injection seam for the pipeline's collaborators; production wiring is
/// [`Coordinator::new`], tests substitute doubles
pub struct CoordinatorParts {
    pub transport: Arc<dyn Transport>,
    pub video_factory: Arc<dyn VideoCodecFactory>,
    pub audio_factory: Arc<dyn AudioCodecFactory>,
    pub container_factory: Arc<dyn ContainerFactory>,
}

struct CoordInner {
    mode: OperatingMode,
    routers: Vec<JoinHandle<()>>,
    /// Clock shared by the active encoder set (stream epoch or recording
    /// start, depending on how the mode was entered)
    clock: Option<MediaClock>,
}

/// The orchestration brain of the pipeline
pub struct Coordinator {
    config: ArcSwap<PipelineConfig>,
    events: Arc<EventBus>,
    session: Arc<NetworkSession>,
    video_factory: Arc<dyn VideoCodecFactory>,
    audio_factory: Arc<dyn AudioCodecFactory>,
    container_factory: Arc<dyn ContainerFactory>,
    inner: tokio::sync::Mutex<CoordInner>,
    video_slot: ArcSwapOption<VideoEncoder>,
    audio_slot: ArcSwapOption<AudioEncoder>,
    recorder_slot: Arc<ArcSwapOption<Recorder>>,
    reconfiguring: AtomicBool,
    throttle: DropLog,
}

impl Coordinator {
    /// Production wiring: RTMP transport, FFmpeg codecs, MP4 container
    pub fn new(
        config: PipelineConfig,
        connectivity: watch::Receiver<bool>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let parts = CoordinatorParts {
            transport: Arc::new(RtmpTransport::new(config.audio.enabled)),
            video_factory: Arc::new(FfmpegVideoFactory),
            audio_factory: Arc::new(FfmpegAudioFactory),
            container_factory: Arc::new(Mp4ContainerFactory),
        };
        Self::with_parts(config, connectivity, events, parts)
    }

    /// Construct with explicit collaborators
    pub fn with_parts(
        config: PipelineConfig,
        connectivity: watch::Receiver<bool>,
        events: Arc<EventBus>,
        parts: CoordinatorParts,
    ) -> Arc<Self> {
        let session = Arc::new(NetworkSession::new(
            parts.transport,
            connectivity,
            events.clone(),
            &config.stream,
        ));
        let coordinator = Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            events,
            session,
            video_factory: parts.video_factory,
            audio_factory: parts.audio_factory,
            container_factory: parts.container_factory,
            inner: tokio::sync::Mutex::new(CoordInner {
                mode: OperatingMode::Idle,
                routers: Vec::new(),
                clock: None,
            }),
            video_slot: ArcSwapOption::empty(),
            audio_slot: ArcSwapOption::empty(),
            recorder_slot: Arc::new(ArcSwapOption::empty()),
            reconfiguring: AtomicBool::new(false),
            throttle: DropLog::with_defaults(),
        });
        coordinator.spawn_session_watcher();
        coordinator
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<PipelineConfig> {
        self.config.load_full()
    }

    /// Replace the whole configuration; only legal while idle
    pub async fn update_config(&self, config: PipelineConfig) -> Result<()> {
        let inner = self.inner.lock().await;
        if inner.mode != OperatingMode::Idle {
            return Err(PipelineError::InvalidMode(format!(
                "cannot replace configuration while {}",
                inner.mode
            )));
        }
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Set the streaming endpoint; takes effect on the next start
    pub fn set_stream_url(&self, url: impl Into<String>) {
        let url = url.into();
        self.config.rcu(|config| {
            let mut next = (**config).clone();
            next.stream.url = Some(url.clone());
            next
        });
    }

    /// Network session handle (state watch, stats)
    pub fn session(&self) -> &Arc<NetworkSession> {
        &self.session
    }

    // ========================================================================
    // Frame input (push callbacks from the capture adapter, any thread)
    // ========================================================================

    /// Push one raw video frame into the pipeline
    pub fn on_video_frame(self: &Arc<Self>, frame: RawVideoFrame) {
        let Some(encoder) = self.video_slot.load_full() else {
            drop_logged!(self.throttle, "frame_no_encoder", "video frame dropped: no active encoder");
            return;
        };
        match encoder.dimensions() {
            Some((w, h)) if w == frame.width && h == frame.height => encoder.submit(frame),
            Some(_) => self.handle_dimension_change(frame),
            // configuration in flight; the submit path drops and counts
            None => encoder.submit(frame),
        }
    }

    /// Push one raw PCM block into the pipeline
    pub fn on_audio_block(&self, block: PcmBlock) {
        let Some(encoder) = self.audio_slot.load_full() else {
            drop_logged!(self.throttle, "audio_no_encoder", "audio block dropped: audio not active");
            return;
        };
        encoder.submit(block);
    }

    /// An incoming frame no longer matches the encoder's dimensions.
    ///
    /// The container's tracks are fixed once it has started, so a
    /// resolution change during an active recording is rejected (frames
    /// dropped) rather than silently corrupting the file. Otherwise the
    /// encoder is reconfigured before the frame is forwarded.
    fn handle_dimension_change(self: &Arc<Self>, frame: RawVideoFrame) {
        if let Some(recorder) = self.recorder_slot.load_full() {
            if recorder.is_started() {
                drop_logged!(
                    self.throttle,
                    "frame_dims_recording",
                    "video frame dropped: resolution change during active recording"
                );
                return;
            }
        }
        if self.reconfiguring.swap(true, Ordering::SeqCst) {
            drop_logged!(self.throttle, "frame_reconfiguring", "video frame dropped: reconfiguration in flight");
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.reconfigure_video(frame).await;
            this.reconfiguring.store(false, Ordering::SeqCst);
        });
    }

    async fn reconfigure_video(self: &Arc<Self>, frame: RawVideoFrame) {
        // serialize with control operations
        let _inner = self.inner.lock().await;
        let Some(encoder) = self.video_slot.load_full() else {
            return;
        };
        let (width, height) = (frame.width, frame.height);
        info!("incoming frame dimensions changed, reconfiguring to {}x{}", width, height);
        match encoder.configure(width, height).await {
            Ok(()) => {
                self.events
                    .publish(PipelineEvent::EncoderReconfigured { width, height });
                encoder.submit(frame);
            }
            Err(e) => {
                error!("video reconfiguration failed: {}", e);
                self.events.publish(PipelineEvent::PipelineError {
                    module: "encode".to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    // ========================================================================
    // Control operations (serialized on the inner lock)
    // ========================================================================

    /// Begin streaming to the configured endpoint. Encoder initialization
    /// is deferred until the transport handshake succeeds.
    pub async fn start_streaming(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.mode {
            OperatingMode::Idle => {}
            OperatingMode::RecordOnly => {
                return Err(PipelineError::InvalidMode(
                    "cannot stream while a record-only session is active".to_string(),
                ));
            }
            _ => {
                return Err(PipelineError::InvalidMode(
                    "streaming already active".to_string(),
                ));
            }
        }
        let config = self.config.load_full();
        let url = config.stream.url.clone().ok_or_else(|| {
            PipelineError::Connection("no streaming endpoint configured".to_string())
        })?;

        // a previous terminal failure leaves the session in Failed; reset
        if self.session.state() == SessionState::Failed {
            self.session.stop().await;
        }
        let session = self.session.clone();
        session.start(&url).await?;
        inner.mode = OperatingMode::StreamOnly;
        Ok(())
    }

    /// Stop the network session. An attached recording keeps running on
    /// the same encoders; stopping one sink never stops the other.
    pub async fn stop_streaming(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.mode {
            OperatingMode::StreamOnly => {
                self.session.stop().await;
                self.teardown_encoders(&mut inner).await;
                inner.mode = OperatingMode::Idle;
            }
            OperatingMode::StreamAndRecord => {
                self.session.stop().await;
                inner.mode = OperatingMode::RecordOnly;
                info!("streaming stopped, recording continues");
            }
            _ => {
                // idempotent; also resets a session left in Failed
                if self.session.state() != SessionState::Idle {
                    self.session.stop().await;
                }
                debug!("stop_streaming: streaming not active");
            }
        }
        Ok(())
    }

    /// Start a recording.
    ///
    /// While streaming, the recording attaches to the live encoders
    /// (requires the session to be live). From idle, a record-only
    /// session with its own encoders is created (requires the network
    /// session to be idle). Rejections happen before any state changes.
    pub async fn start_recording(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let config = self.config.load_full();
        match inner.mode {
            OperatingMode::StreamAndRecord | OperatingMode::RecordOnly => {
                Err(PipelineError::InvalidMode(
                    "recording already active".to_string(),
                ))
            }
            OperatingMode::StreamOnly => {
                if self.session.state() != SessionState::Live {
                    return Err(PipelineError::InvalidMode(
                        "cannot attach recording: network session is not live".to_string(),
                    ));
                }
                let expect_audio = self.audio_slot.load().is_some();
                let recorder = Recorder::create(
                    &config.record,
                    config.device.clone(),
                    expect_audio,
                    &*self.container_factory,
                    self.events.clone(),
                )?;

                // both encoders already carry their codec params; register
                // them so the container can start before samples arrive
                let registered = (|| -> Result<()> {
                    if let Some(video) = self.video_slot.load_full() {
                        if let Some(params) = video.current_params() {
                            recorder.register_track(&params)?;
                        }
                    }
                    if let Some(audio) = self.audio_slot.load_full() {
                        if let Some(params) = audio.current_params() {
                            recorder.register_track(&params)?;
                        }
                    }
                    Ok(())
                })();
                if let Err(e) = registered {
                    let _ = recorder.finalize();
                    return Err(e);
                }

                self.recorder_slot.store(Some(recorder));
                inner.mode = OperatingMode::StreamAndRecord;
                info!("recording attached to live stream");
                Ok(())
            }
            OperatingMode::Idle => {
                if self.session.state() != SessionState::Idle {
                    return Err(PipelineError::InvalidMode(
                        "cannot start record-only while the network session is active".to_string(),
                    ));
                }
                let expect_audio = config.audio.enabled;
                let recorder = Recorder::create(
                    &config.record,
                    config.device.clone(),
                    expect_audio,
                    &*self.container_factory,
                    self.events.clone(),
                )?;
                self.recorder_slot.store(Some(recorder));

                // record-only owns its encoders; the file's zero-time is
                // the recording start
                let clock = MediaClock::starting_now();
                if let Err(e) = self.create_encoders(&mut inner, clock).await {
                    if let Some(recorder) = self.recorder_slot.swap(None) {
                        let _ = recorder.finalize();
                    }
                    return Err(e);
                }
                inner.mode = OperatingMode::RecordOnly;
                info!("record-only session started");
                Ok(())
            }
        }
    }

    /// Stop and finalize the active recording; streaming is untouched
    pub async fn stop_recording(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.mode {
            OperatingMode::StreamAndRecord => {
                let recorder = self.recorder_slot.swap(None);
                inner.mode = OperatingMode::StreamOnly;
                if let Some(recorder) = recorder {
                    recorder.finalize()?;
                }
                Ok(())
            }
            OperatingMode::RecordOnly => {
                let recorder = self.recorder_slot.swap(None);
                self.teardown_encoders(&mut inner).await;
                inner.mode = OperatingMode::Idle;
                if let Some(recorder) = recorder {
                    recorder.finalize()?;
                }
                Ok(())
            }
            _ => {
                debug!("stop_recording: no active recording");
                Ok(())
            }
        }
    }

    /// Enable or disable audio, independent of video and of the network
    /// session. Enabling mid-session brings the audio encoder up on the
    /// active clock; disabling releases it without touching anything else.
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.config.rcu(|config| {
            let mut next = (**config).clone();
            next.audio.enabled = enabled;
            next
        });
        self.events
            .publish(PipelineEvent::AudioStateChanged { enabled });

        if enabled {
            if inner.mode != OperatingMode::Idle && self.audio_slot.load().is_none() {
                let clock = inner.clock.unwrap_or_else(MediaClock::starting_now);
                self.create_audio_encoder(&mut inner, clock).await?;
            }
        } else if let Some(audio) = self.audio_slot.swap(None) {
            audio.release().await;
            info!("audio encoder released");
        }
        Ok(())
    }

    /// Pipeline state snapshot
    pub async fn status(&self) -> PipelineStatus {
        let inner = self.inner.lock().await;
        let recorder = self.recorder_slot.load_full();
        let video = self.video_slot.load_full();
        PipelineStatus {
            mode: inner.mode,
            session: self.session.state(),
            video_configured: video.map(|v| v.is_configured()).unwrap_or(false),
            audio_active: self.audio_slot.load().is_some(),
            recording: recorder.as_ref().map(|r| r.path().display().to_string()),
            recording_started: recorder.map(|r| r.is_started()).unwrap_or(false),
            frames_submitted: self.video_stat(|s| &s.frames_submitted),
            frames_dropped: self.video_stat(|s| &s.frames_dropped),
            samples_sent: self.session.stats.samples_sent.load(Ordering::Relaxed),
            samples_dropped: self.session.stats.samples_dropped.load(Ordering::Relaxed),
            connect_attempts: self.session.stats.connect_attempts.load(Ordering::Relaxed),
            reconnect_episodes: self
                .session
                .stats
                .reconnect_episodes
                .load(Ordering::Relaxed),
        }
    }

    /// Stop both sinks and release every encoder
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop_recording().await {
            warn!("shutdown: recording finalize failed: {}", e);
        }
        if let Err(e) = self.stop_streaming().await {
            warn!("shutdown: stream stop failed: {}", e);
        }
        info!("pipeline shut down");
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn video_stat(&self, pick: fn(&crate::encode::video::VideoEncoderStats) -> &std::sync::atomic::AtomicU64) -> u64 {
        self.video_slot
            .load_full()
            .map(|v| pick(&v.stats).load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn spawn_session_watcher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut state_rx = self.session.state_watch();
        tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow();
                let Some(this) = weak.upgrade() else {
                    break;
                };
                match state {
                    SessionState::Live => this.on_session_live().await,
                    SessionState::Failed => this.on_session_failed().await,
                    _ => {}
                }
            }
        });
    }

    /// The transport handshake succeeded. First connect configures the
    /// encoders (deferred until now so a connection that never completes
    /// costs no codec allocation); a reconnect re-announces codec params
    /// and forces an IDR so the remote can resync.
    async fn on_session_live(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if !matches!(
            inner.mode,
            OperatingMode::StreamOnly | OperatingMode::StreamAndRecord
        ) {
            return;
        }

        if self.video_slot.load().is_none() {
            let clock = MediaClock::starting_now();
            if let Err(e) = self.create_encoders(&mut inner, clock).await {
                error!("encoder initialization after connect failed: {}", e);
                self.events.publish(PipelineEvent::PipelineError {
                    module: "encode".to_string(),
                    message: e.to_string(),
                });
                self.session.stop().await;
                self.teardown_encoders(&mut inner).await;
                inner.mode = OperatingMode::Idle;
            }
        } else {
            if let Some(video) = self.video_slot.load_full() {
                if let Some(params) = video.current_params() {
                    self.session.set_info(TrackKind::Video, &params).await;
                }
                video.request_key_frame();
            }
            if let Some(audio) = self.audio_slot.load_full() {
                if let Some(params) = audio.current_params() {
                    self.session.set_info(TrackKind::Audio, &params).await;
                }
            }
        }
    }

    /// The session reached terminal failure. Speculative encoders are
    /// released unless a recording still needs them.
    async fn on_session_failed(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        match inner.mode {
            OperatingMode::StreamOnly => {
                self.teardown_encoders(&mut inner).await;
                inner.mode = OperatingMode::Idle;
            }
            OperatingMode::StreamAndRecord => {
                inner.mode = OperatingMode::RecordOnly;
                warn!("streaming failed, recording continues");
            }
            _ => {}
        }
    }

    async fn create_encoders(&self, inner: &mut CoordInner, clock: MediaClock) -> Result<()> {
        let config = self.config.load_full();

        let (video_tx, video_rx) = mpsc::channel(ENCODER_EVENT_CAP);
        let video = Arc::new(VideoEncoder::new(
            config.video.clone(),
            self.video_factory.clone(),
            video_tx,
            clock,
        ));
        video
            .configure(config.video.width, config.video.height)
            .await?;
        self.video_slot.store(Some(video));
        inner.routers.push(tokio::spawn(run_router(
            video_rx,
            TrackKind::Video,
            self.session.clone(),
            self.recorder_slot.clone(),
            self.events.clone(),
        )));

        if config.audio.enabled {
            self.create_audio_encoder(inner, clock).await?;
        }
        inner.clock = Some(clock);
        Ok(())
    }

    async fn create_audio_encoder(&self, inner: &mut CoordInner, clock: MediaClock) -> Result<()> {
        let config = self.config.load_full();
        let (audio_tx, audio_rx) = mpsc::channel(ENCODER_EVENT_CAP);
        let audio = Arc::new(AudioEncoder::new(
            config.audio.clone(),
            self.audio_factory.clone(),
            audio_tx,
            clock,
        ));
        audio.configure().await?;
        self.audio_slot.store(Some(audio));
        inner.routers.push(tokio::spawn(run_router(
            audio_rx,
            TrackKind::Audio,
            self.session.clone(),
            self.recorder_slot.clone(),
            self.events.clone(),
        )));
        Ok(())
    }

    /// Release every encoder (joining each drain loop first) and wait for
    /// the routers to run dry
    async fn teardown_encoders(&self, inner: &mut CoordInner) {
        if let Some(video) = self.video_slot.swap(None) {
            video.release().await;
        }
        if let Some(audio) = self.audio_slot.swap(None) {
            audio.release().await;
        }
        inner.clock = None;
        for router in inner.routers.drain(..) {
            let _ = router.await;
        }
    }
}

/// Per-encoder router: the single consumer of one encoder's event stream,
/// fanning each event out to the network session and the active recorder
async fn run_router(
    mut rx: mpsc::Receiver<EncoderEvent>,
    kind: TrackKind,
    session: Arc<NetworkSession>,
    recorder_slot: Arc<ArcSwapOption<Recorder>>,
    events: Arc<EventBus>,
) {
    debug!("{} router started", kind);
    while let Some(event) = rx.recv().await {
        match event {
            EncoderEvent::Config(params) => {
                session.set_info(kind, &params).await;
                if let Some(recorder) = recorder_slot.load_full() {
                    if let Err(e) = recorder.register_track(&params) {
                        warn!("{} track registration rejected: {}", kind, e);
                    }
                }
            }
            EncoderEvent::Sample(sample) => {
                session.send_sample(kind, &sample).await;
                if let Some(recorder) = recorder_slot.load_full() {
                    if let Err(e) = recorder.write_sample(kind, &sample) {
                        // container I/O failure: tear the file session down,
                        // the network sink is unaffected
                        error!("recording write failed: {}", e);
                        events.publish(PipelineEvent::PipelineError {
                            module: "record".to_string(),
                            message: e.to_string(),
                        });
                        let _ = recorder.finalize();
                        recorder_slot.store(None);
                    }
                }
            }
        }
    }
    debug!("{} router ended", kind);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::testing::{
        MemoryContainerFactory, MockTransport, StubAudioFactory, StubVideoFactory, WriterCall,
    };
    use bytes::Bytes;
    use std::time::{Duration, Instant};

    struct Fixture {
        coordinator: Arc<Coordinator>,
        transport: Arc<MockTransport>,
        containers: MemoryContainerFactory,
        video_factory: Arc<StubVideoFactory>,
        _conn: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    fn fixture(mut config: PipelineConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        config.record.output_dir = dir.path().to_path_buf();
        config.stream.url = Some("rtmp://example/live".to_string());

        let transport = Arc::new(MockTransport::new());
        let containers = MemoryContainerFactory::new();
        let video_factory = Arc::new(StubVideoFactory::default());
        let (conn_tx, conn_rx) = watch::channel(true);
        let coordinator = Coordinator::with_parts(
            config,
            conn_rx,
            Arc::new(EventBus::new()),
            CoordinatorParts {
                transport: transport.clone(),
                video_factory: video_factory.clone(),
                audio_factory: Arc::new(StubAudioFactory::default()),
                container_factory: Arc::new(containers.clone()),
            },
        );
        Fixture {
            coordinator,
            transport,
            containers,
            video_factory,
            _conn: conn_tx,
            _dir: dir,
        }
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn frame(width: u32, height: u32) -> RawVideoFrame {
        let len = (width * height * 3 / 2) as usize;
        RawVideoFrame::new(Bytes::from(vec![0u8; len]), width, height, Instant::now())
    }

    async fn start_live(fx: &Fixture) {
        fx.coordinator.start_streaming().await.unwrap();
        let coordinator = fx.coordinator.clone();
        wait_until(|| stream_live(&coordinator)).await;
    }

    // polling helper: session live and encoders configured
    fn stream_live(coordinator: &Arc<Coordinator>) -> bool {
        coordinator.session().state() == SessionState::Live
            && coordinator.video_slot.load().is_some()
    }

    #[tokio::test]
    async fn test_streaming_defers_encoders_until_live() {
        let fx = fixture(PipelineConfig::default());
        fx.transport.hold_connects(true);
        fx.coordinator.start_streaming().await.unwrap();
        // connecting, not live: no codec allocated yet
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.video_factory.opened(), 0);

        fx.transport.hold_connects(false);
        wait_until(|| stream_live(&fx.coordinator)).await;
        assert_eq!(fx.video_factory.opened(), 1);
    }

    #[tokio::test]
    async fn test_start_streaming_twice_rejected() {
        let fx = fixture(PipelineConfig::default());
        start_live(&fx).await;
        let err = fx.coordinator.start_streaming().await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidMode(_)));
    }

    #[tokio::test]
    async fn test_attach_recording_requires_live_session() {
        let fx = fixture(PipelineConfig::default());
        fx.transport.hold_connects(true);
        fx.coordinator.start_streaming().await.unwrap();

        // still connecting: attach must be rejected without side effects
        let err = fx.coordinator.start_recording().await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidMode(_)));
        let status = fx.coordinator.status().await;
        assert_eq!(status.mode, OperatingMode::StreamOnly);
        assert!(status.recording.is_none());
        assert!(fx.containers.calls().is_empty());
    }

    #[tokio::test]
    async fn test_record_only_rejected_while_session_not_idle() {
        let fx = fixture(PipelineConfig::default());
        // a failed stream leaves the session in Failed with mode Idle
        fx.transport.script_connects(vec![Err("refused".into())]);
        fx.coordinator.start_streaming().await.unwrap();
        let coordinator = fx.coordinator.clone();
        wait_until(|| coordinator.session().state() == SessionState::Failed).await;
        wait_until(|| {
            // watcher settles mode back to Idle
            coordinator.video_slot.load().is_none()
        })
        .await;

        let err = fx.coordinator.start_recording().await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidMode(_)));
        assert!(fx.containers.calls().is_empty());

        // stop_streaming resets the failed session, then record-only works
        fx.coordinator.stop_streaming().await.unwrap();
        fx.coordinator.start_recording().await.unwrap();
        let status = fx.coordinator.status().await;
        assert_eq!(status.mode, OperatingMode::RecordOnly);
    }

    #[tokio::test]
    async fn test_stream_and_record_shares_encoders() {
        let fx = fixture(PipelineConfig::default());
        start_live(&fx).await;
        let opened_before = fx.video_factory.opened();

        fx.coordinator.start_recording().await.unwrap();
        let status = fx.coordinator.status().await;
        assert_eq!(status.mode, OperatingMode::StreamAndRecord);
        // both tracks were registered from the live encoders' params
        assert!(status.recording_started);
        // no new codec instances for the attached recording
        assert_eq!(fx.video_factory.opened(), opened_before);
    }

    #[tokio::test]
    async fn test_record_only_audio_less_writes_video_only() {
        let mut config = PipelineConfig::default();
        config.audio.enabled = false;
        let fx = fixture(config);

        fx.coordinator.start_recording().await.unwrap();
        let coordinator = fx.coordinator.clone();
        wait_until(|| {
            // starts as soon as the single video track registers
            coordinator.recorder_slot.load_full().map(|r| r.is_started()) == Some(true)
        })
        .await;

        for _ in 0..5 {
            fx.coordinator.on_video_frame(frame(1280, 720));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let containers = fx.containers.clone();
        wait_until(|| {
            containers
                .calls()
                .iter()
                .any(|c| matches!(c, WriterCall::Write(TrackKind::Video, _)))
        })
        .await;
        fx.coordinator.stop_recording().await.unwrap();

        let calls = fx.containers.calls();
        assert!(!calls.iter().any(|c| matches!(c, WriterCall::AddTrack(TrackKind::Audio))));
        assert!(!calls.iter().any(|c| matches!(c, WriterCall::Write(TrackKind::Audio, _))));
        assert!(calls.iter().any(|c| matches!(c, WriterCall::Finish)));
        assert_eq!(fx.coordinator.status().await.mode, OperatingMode::Idle);
    }

    #[tokio::test]
    async fn test_stop_streaming_keeps_recording_running() {
        let fx = fixture(PipelineConfig::default());
        start_live(&fx).await;
        fx.coordinator.start_recording().await.unwrap();

        fx.coordinator.stop_streaming().await.unwrap();
        let status = fx.coordinator.status().await;
        assert_eq!(status.mode, OperatingMode::RecordOnly);
        assert!(status.recording_started);
        assert_eq!(status.session, SessionState::Idle);

        // samples still reach the container after the stream is gone
        let before = fx
            .containers
            .calls()
            .iter()
            .filter(|c| matches!(c, WriterCall::Write(..)))
            .count();
        for _ in 0..5 {
            fx.coordinator.on_video_frame(frame(1280, 720));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let containers = fx.containers.clone();
        wait_until(move || {
            containers
                .calls()
                .iter()
                .filter(|c| matches!(c, WriterCall::Write(..)))
                .count()
                > before
        })
        .await;
        fx.coordinator.stop_recording().await.unwrap();
    }

    #[tokio::test]
    async fn test_audio_toggle_leaves_session_live() {
        let fx = fixture(PipelineConfig::default());
        start_live(&fx).await;
        let coordinator = fx.coordinator.clone();
        wait_until(|| coordinator.audio_slot.load().is_some()).await;

        fx.coordinator.set_audio_enabled(false).await.unwrap();
        assert!(fx.coordinator.audio_slot.load().is_none());
        assert_eq!(fx.coordinator.session().state(), SessionState::Live);

        fx.coordinator.set_audio_enabled(true).await.unwrap();
        assert!(fx.coordinator.audio_slot.load().is_some());
    }

    #[tokio::test]
    async fn test_dimension_change_reconfigures_encoder() {
        let fx = fixture(PipelineConfig::default());
        start_live(&fx).await;
        assert_eq!(fx.video_factory.opened(), 1);

        fx.coordinator.on_video_frame(frame(640, 480));
        let coordinator = fx.coordinator.clone();
        wait_until(|| {
            coordinator
                .video_slot
                .load_full()
                .and_then(|v| v.dimensions())
                == Some((640, 480))
        })
        .await;
        assert_eq!(fx.video_factory.opened(), 2);
    }

    #[tokio::test]
    async fn test_dimension_change_rejected_during_started_recording() {
        let fx = fixture(PipelineConfig::default());
        start_live(&fx).await;
        fx.coordinator.start_recording().await.unwrap();
        assert!(fx.coordinator.status().await.recording_started);

        fx.coordinator.on_video_frame(frame(640, 480));
        tokio::time::sleep(Duration::from_millis(100)).await;
        // no reconfiguration happened; the frame was dropped instead
        assert_eq!(fx.video_factory.opened(), 1);
        assert_eq!(
            fx.coordinator
                .video_slot
                .load_full()
                .and_then(|v| v.dimensions()),
            Some((1280, 720))
        );
    }

    #[tokio::test]
    async fn test_recording_write_failure_tears_down_file_session_only() {
        let fx = fixture(PipelineConfig::default());
        start_live(&fx).await;
        fx.coordinator.start_recording().await.unwrap();

        fx.containers.fail_writes(true);
        let coordinator = fx.coordinator.clone();
        let pusher = coordinator.clone();
        tokio::spawn(async move {
            loop {
                pusher.on_video_frame(frame(1280, 720));
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        wait_until(|| coordinator.recorder_slot.load().is_none()).await;
        // the network sink is unaffected by the muxer failure
        assert_eq!(fx.coordinator.session().state(), SessionState::Live);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let fx = fixture(PipelineConfig::default());
        start_live(&fx).await;
        fx.coordinator.start_recording().await.unwrap();
        fx.coordinator.shutdown().await;
        let status = fx.coordinator.status().await;
        assert_eq!(status.mode, OperatingMode::Idle);
        assert_eq!(status.session, SessionState::Idle);
        // a second shutdown is a no-op
        fx.coordinator.shutdown().await;
        assert_eq!(fx.coordinator.status().await.mode, OperatingMode::Idle);
    }
}
