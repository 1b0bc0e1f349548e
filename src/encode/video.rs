//! Video encoding pipeline
//!
//! Owns one codec backend per configuration epoch plus the drain task that
//! pulls encoded access units out of it. Submission is non-blocking and
//! lossy: a live pipeline has no use for stale frames, so anything that
//! cannot be enqueued immediately is dropped (and counted).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::VideoSettings;
use crate::drop_logged;
use crate::error::Result;
use crate::media::{CodecParams, MediaClock, RawVideoFrame};
use crate::utils::DropLog;

use super::backend::{EncoderEvent, VideoCodec, VideoCodecFactory};

/// Bounded wait for one dequeue attempt; also the cancellation window
const DEQUEUE_WAIT: Duration = Duration::from_millis(30);

/// Submit queue depth; beyond this, frames are dropped rather than queued
const SUBMIT_QUEUE_CAP: usize = 32;

#[derive(Debug, Default)]
pub struct VideoEncoderStats {
    pub frames_submitted: AtomicU64,
    pub frames_dropped: AtomicU64,
}

struct ActiveEncoder {
    width: u32,
    height: u32,
    submit_tx: mpsc::Sender<(RawVideoFrame, i64)>,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Video encoder: submit queue, codec backend, drain loop
pub struct VideoEncoder {
    settings: VideoSettings,
    factory: Arc<dyn VideoCodecFactory>,
    clock: MediaClock,
    out_tx: mpsc::Sender<EncoderEvent>,
    active: tokio::sync::Mutex<Option<ActiveEncoder>>,
    dimensions: RwLock<Option<(u32, u32)>>,
    current_params: RwLock<Option<CodecParams>>,
    key_frame_req: Arc<AtomicBool>,
    throttle: DropLog,
    pub stats: VideoEncoderStats,
}

impl VideoEncoder {
    /// Create an unconfigured encoder.
    ///
    /// `out_tx` receives the encoder's ordered event stream; `clock`
    /// anchors every emitted pts (stream epoch for live, recording start
    /// for record-only).
    pub fn new(
        settings: VideoSettings,
        factory: Arc<dyn VideoCodecFactory>,
        out_tx: mpsc::Sender<EncoderEvent>,
        clock: MediaClock,
    ) -> Self {
        Self {
            settings,
            factory,
            clock,
            out_tx,
            active: tokio::sync::Mutex::new(None),
            dimensions: RwLock::new(None),
            current_params: RwLock::new(None),
            key_frame_req: Arc::new(AtomicBool::new(false)),
            throttle: DropLog::with_defaults(),
            stats: VideoEncoderStats::default(),
        }
    }

    /// Configure (or reconfigure) for the given frame dimensions.
    ///
    /// Idempotent when the dimensions match the current epoch. Differing
    /// dimensions release the previous backend first (its drain loop is
    /// joined before teardown and its in-flight frames are discarded). On
    /// failure the encoder is left unconfigured.
    pub async fn configure(&self, width: u32, height: u32) -> Result<()> {
        let mut active = self.active.lock().await;

        if let Some(current) = active.as_ref() {
            if current.width == width && current.height == height {
                return Ok(());
            }
            info!(
                "video encoder reconfiguring {}x{} -> {}x{}",
                current.width, current.height, width, height
            );
        }

        if let Some(previous) = active.take() {
            *self.dimensions.write() = None;
            *self.current_params.write() = None;
            shutdown_epoch(previous).await;
        }

        let backend = self.factory.open(&self.settings, width, height)?;
        let params = backend.params().clone();

        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_CAP);
        let stop = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(drain_loop(
            backend,
            submit_rx,
            self.out_tx.clone(),
            stop.clone(),
            self.key_frame_req.clone(),
            params.clone(),
        ));

        *active = Some(ActiveEncoder {
            width,
            height,
            submit_tx,
            stop,
            task,
        });
        *self.dimensions.write() = Some((width, height));
        *self.current_params.write() = Some(params);
        Ok(())
    }

    /// Non-blocking frame submission; drops silently when the encoder is
    /// unconfigured, mid-reconfiguration, or the queue is full
    pub fn submit(&self, frame: RawVideoFrame) {
        let Ok(guard) = self.active.try_lock() else {
            self.count_drop("video_submit_busy", "video frame dropped: encoder reconfiguring");
            return;
        };
        let Some(active) = guard.as_ref() else {
            self.count_drop("video_submit_unconfigured", "video frame dropped: not configured");
            return;
        };

        let pts = self.clock.micros_at(frame.timestamp);
        match active.submit_tx.try_send((frame, pts)) {
            Ok(()) => {
                self.stats.frames_submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.count_drop("video_submit_full", "video frame dropped: submit queue full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.count_drop("video_submit_closed", "video frame dropped: drain loop gone");
            }
        }
    }

    /// Ask for an IDR on the next encoded frame
    pub fn request_key_frame(&self) {
        self.key_frame_req.store(true, Ordering::Relaxed);
    }

    /// Dimensions of the current configuration epoch
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        *self.dimensions.read()
    }

    /// Codec parameters of the current configuration epoch
    pub fn current_params(&self) -> Option<CodecParams> {
        self.current_params.read().clone()
    }

    pub fn is_configured(&self) -> bool {
        self.dimensions.read().is_some()
    }

    /// Stop the drain loop (joining it first), release the backend and
    /// clear all configuration state. Safe to call when never configured;
    /// idempotent.
    pub async fn release(&self) {
        let mut active = self.active.lock().await;
        *self.dimensions.write() = None;
        *self.current_params.write() = None;
        if let Some(previous) = active.take() {
            shutdown_epoch(previous).await;
            debug!("video encoder released");
        }
    }

    fn count_drop(&self, key: &'static str, message: &'static str) {
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        drop_logged!(self.throttle, key, "{}", message);
    }
}

/// Stop an epoch's drain loop and join it before the backend (owned by the
/// loop) is dropped; the join must precede resource teardown
async fn shutdown_epoch(entry: ActiveEncoder) {
    let ActiveEncoder {
        submit_tx,
        stop,
        task,
        ..
    } = entry;
    stop.store(true, Ordering::Relaxed);
    drop(submit_tx);
    let _ = task.await;
}

/// Drain loop: emits the epoch's `Config` first, then pulls frames with a
/// bounded wait so stop requests are observed within [`DEQUEUE_WAIT`]
async fn drain_loop(
    mut backend: Box<dyn VideoCodec>,
    mut submit_rx: mpsc::Receiver<(RawVideoFrame, i64)>,
    out_tx: mpsc::Sender<EncoderEvent>,
    stop: Arc<AtomicBool>,
    key_frame_req: Arc<AtomicBool>,
    params: CodecParams,
) {
    if out_tx.send(EncoderEvent::Config(params)).await.is_err() {
        return;
    }
    debug!("video drain loop started");

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match tokio::time::timeout(DEQUEUE_WAIT, submit_rx.recv()).await {
            Ok(Some((frame, pts))) => {
                if key_frame_req.swap(false, Ordering::Relaxed) {
                    backend.request_key_frame();
                }
                match backend.encode(&frame, pts) {
                    Ok(samples) => {
                        for sample in samples {
                            if out_tx.send(EncoderEvent::Sample(sample)).await.is_err() {
                                debug!("video drain loop: consumer gone");
                                return;
                            }
                        }
                    }
                    Err(e) => error!("video encode error: {}", e),
                }
            }
            // submit side closed: epoch released
            Ok(None) => break,
            // bounded wait elapsed; loop to observe a pending stop
            Err(_) => continue,
        }
    }
    debug!("video drain loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubVideoFactory, FAIL_OPEN};
    use std::time::Instant;

    fn encoder_with(
        factory: Arc<dyn VideoCodecFactory>,
    ) -> (VideoEncoder, mpsc::Receiver<EncoderEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let enc = VideoEncoder::new(
            VideoSettings::default(),
            factory,
            tx,
            MediaClock::starting_now(),
        );
        (enc, rx)
    }

    fn frame(width: u32, height: u32, at: Instant) -> RawVideoFrame {
        let len = (width * height * 3 / 2) as usize;
        RawVideoFrame::new(bytes::Bytes::from(vec![0u8; len]), width, height, at)
    }

    #[tokio::test]
    async fn test_configure_idempotent() {
        let factory = Arc::new(StubVideoFactory::default());
        let (enc, _rx) = encoder_with(factory.clone());
        enc.configure(1280, 720).await.unwrap();
        enc.configure(1280, 720).await.unwrap();
        assert_eq!(factory.opened(), 1);
        enc.release().await;
    }

    #[tokio::test]
    async fn test_configure_failure_leaves_unconfigured() {
        let factory = Arc::new(StubVideoFactory::new(FAIL_OPEN));
        let (enc, _rx) = encoder_with(factory);
        assert!(enc.configure(1280, 720).await.is_err());
        assert!(!enc.is_configured());
        assert!(enc.current_params().is_none());
    }

    #[tokio::test]
    async fn test_submit_unconfigured_drops_silently() {
        let factory = Arc::new(StubVideoFactory::default());
        let (enc, _rx) = encoder_with(factory);
        enc.submit(frame(1280, 720, Instant::now()));
        assert_eq!(enc.stats.frames_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(enc.stats.frames_submitted.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_release_idempotent() {
        let factory = Arc::new(StubVideoFactory::default());
        let (enc, _rx) = encoder_with(factory);
        enc.configure(640, 480).await.unwrap();
        enc.release().await;
        enc.release().await;
        assert!(!enc.is_configured());
        // releasing a never-configured encoder is also fine
        let (enc2, _rx2) = encoder_with(Arc::new(StubVideoFactory::default()));
        enc2.release().await;
    }

    #[tokio::test]
    async fn test_reconfigure_opens_new_epoch() {
        let factory = Arc::new(StubVideoFactory::default());
        let (enc, mut rx) = encoder_with(factory.clone());
        enc.configure(1280, 720).await.unwrap();
        enc.configure(640, 480).await.unwrap();
        assert_eq!(factory.opened(), 2);
        assert_eq!(enc.dimensions(), Some((640, 480)));

        // both epochs announce their config before any data
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, EncoderEvent::Config(ref p) if p.width == 1280));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, EncoderEvent::Config(ref p) if p.width == 640));
        enc.release().await;
    }

    /// 48 frames at 24fps spacing: one config event first, then at least
    /// 47 data samples with monotonically non-decreasing timestamps
    #[tokio::test]
    async fn test_config_precedes_samples_and_pts_monotonic() {
        let factory = Arc::new(StubVideoFactory::default());
        let (tx, mut rx) = mpsc::channel(256);
        let base = Instant::now();
        let enc = VideoEncoder::new(
            VideoSettings::default(),
            factory,
            tx,
            MediaClock::with_epoch(base),
        );
        enc.configure(1280, 720).await.unwrap();

        for i in 0..48u32 {
            enc.submit(frame(1280, 720, base + Duration::from_micros(i as u64 * 41_667)));
            // keep the submit queue from outpacing the drain loop
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        enc.release().await;
        // the encoder holds the event channel open; drop it so recv drains
        drop(enc);

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }

        assert!(matches!(events[0], EncoderEvent::Config(_)));
        let samples: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EncoderEvent::Sample(s) => Some(s),
                _ => None,
            })
            .collect();
        assert!(samples.len() >= 47, "got {} samples", samples.len());
        let mut last = -1i64;
        for sample in &samples {
            assert!(sample.pts_us >= last);
            last = sample.pts_us;
        }
        // no stray config events after the first
        let configs = events
            .iter()
            .filter(|e| matches!(e, EncoderEvent::Config(_)))
            .count();
        assert_eq!(configs, 1);
    }
}
