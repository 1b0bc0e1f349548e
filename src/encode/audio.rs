//! Audio encoding pipeline
//!
//! Same shape as the video pipeline: one backend per configuration epoch,
//! non-blocking submission, a bounded-wait drain loop that is joined
//! before the backend is released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::AudioSettings;
use crate::drop_logged;
use crate::error::Result;
use crate::media::{CodecParams, MediaClock, PcmBlock};
use crate::utils::DropLog;

use super::backend::{AudioCodec, AudioCodecFactory, EncoderEvent};

const DEQUEUE_WAIT: Duration = Duration::from_millis(30);
const SUBMIT_QUEUE_CAP: usize = 64;

#[derive(Debug, Default)]
pub struct AudioEncoderStats {
    pub blocks_submitted: AtomicU64,
    pub blocks_dropped: AtomicU64,
}

struct ActiveEncoder {
    submit_tx: mpsc::Sender<(PcmBlock, i64)>,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Audio encoder: submit queue, codec backend, drain loop
pub struct AudioEncoder {
    settings: AudioSettings,
    factory: Arc<dyn AudioCodecFactory>,
    clock: MediaClock,
    out_tx: mpsc::Sender<EncoderEvent>,
    active: tokio::sync::Mutex<Option<ActiveEncoder>>,
    current_params: RwLock<Option<CodecParams>>,
    throttle: DropLog,
    pub stats: AudioEncoderStats,
}

impl AudioEncoder {
    pub fn new(
        settings: AudioSettings,
        factory: Arc<dyn AudioCodecFactory>,
        out_tx: mpsc::Sender<EncoderEvent>,
        clock: MediaClock,
    ) -> Self {
        Self {
            settings,
            factory,
            clock,
            out_tx,
            active: tokio::sync::Mutex::new(None),
            current_params: RwLock::new(None),
            throttle: DropLog::with_defaults(),
            stats: AudioEncoderStats::default(),
        }
    }

    /// Configure the encoder. Idempotent while configured; on failure the
    /// encoder stays unconfigured.
    pub async fn configure(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Ok(());
        }

        let backend = self.factory.open(&self.settings)?;
        let params = backend.params().clone();

        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_CAP);
        let stop = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(drain_loop(
            backend,
            submit_rx,
            self.out_tx.clone(),
            stop.clone(),
            params.clone(),
        ));

        *active = Some(ActiveEncoder {
            submit_tx,
            stop,
            task,
        });
        *self.current_params.write() = Some(params);
        Ok(())
    }

    /// Non-blocking PCM submission; drops silently when unconfigured or
    /// the queue is full
    pub fn submit(&self, block: PcmBlock) {
        let Ok(guard) = self.active.try_lock() else {
            self.count_drop("audio_submit_busy", "audio block dropped: encoder busy");
            return;
        };
        let Some(active) = guard.as_ref() else {
            self.count_drop("audio_submit_unconfigured", "audio block dropped: not configured");
            return;
        };

        let pts = self.clock.micros_at(block.timestamp);
        match active.submit_tx.try_send((block, pts)) {
            Ok(()) => {
                self.stats.blocks_submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.count_drop("audio_submit_full", "audio block dropped: submit queue full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.count_drop("audio_submit_closed", "audio block dropped: drain loop gone");
            }
        }
    }

    /// Codec parameters of the current configuration epoch
    pub fn current_params(&self) -> Option<CodecParams> {
        self.current_params.read().clone()
    }

    pub fn is_configured(&self) -> bool {
        self.current_params.read().is_some()
    }

    /// Stop and join the drain loop, then release the backend. Idempotent.
    pub async fn release(&self) {
        let mut active = self.active.lock().await;
        *self.current_params.write() = None;
        if let Some(previous) = active.take() {
            let ActiveEncoder {
                submit_tx,
                stop,
                task,
            } = previous;
            stop.store(true, Ordering::Relaxed);
            drop(submit_tx);
            let _ = task.await;
            debug!("audio encoder released");
        }
    }

    fn count_drop(&self, key: &'static str, message: &'static str) {
        self.stats.blocks_dropped.fetch_add(1, Ordering::Relaxed);
        drop_logged!(self.throttle, key, "{}", message);
    }
}

async fn drain_loop(
    mut backend: Box<dyn AudioCodec>,
    mut submit_rx: mpsc::Receiver<(PcmBlock, i64)>,
    out_tx: mpsc::Sender<EncoderEvent>,
    stop: Arc<AtomicBool>,
    params: CodecParams,
) {
    if out_tx.send(EncoderEvent::Config(params)).await.is_err() {
        return;
    }
    debug!("audio drain loop started");

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match tokio::time::timeout(DEQUEUE_WAIT, submit_rx.recv()).await {
            Ok(Some((block, pts))) => {
                let pcm = block.samples();
                match backend.encode(&pcm, pts) {
                    Ok(samples) => {
                        for sample in samples {
                            if out_tx.send(EncoderEvent::Sample(sample)).await.is_err() {
                                debug!("audio drain loop: consumer gone");
                                return;
                            }
                        }
                    }
                    Err(e) => error!("audio encode error: {}", e),
                }
            }
            Ok(None) => break,
            Err(_) => continue,
        }
    }
    debug!("audio drain loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubAudioFactory;
    use std::time::Instant;

    fn encoder_with(
        factory: Arc<dyn AudioCodecFactory>,
    ) -> (AudioEncoder, mpsc::Receiver<EncoderEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let enc = AudioEncoder::new(
            AudioSettings::default(),
            factory,
            tx,
            MediaClock::starting_now(),
        );
        (enc, rx)
    }

    fn block(samples: usize, at: Instant) -> PcmBlock {
        PcmBlock::new(bytes::Bytes::from(vec![0u8; samples * 2]), at)
    }

    #[tokio::test]
    async fn test_configure_idempotent() {
        let factory = Arc::new(StubAudioFactory::default());
        let (enc, _rx) = encoder_with(factory.clone());
        enc.configure().await.unwrap();
        enc.configure().await.unwrap();
        assert_eq!(factory.opened(), 1);
        enc.release().await;
    }

    #[tokio::test]
    async fn test_config_emitted_before_samples() {
        let factory = Arc::new(StubAudioFactory::default());
        let (enc, mut rx) = encoder_with(factory);
        enc.configure().await.unwrap();
        enc.submit(block(1024, Instant::now()));
        enc.release().await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, EncoderEvent::Config(_)));
    }

    #[tokio::test]
    async fn test_submit_unconfigured_drops() {
        let factory = Arc::new(StubAudioFactory::default());
        let (enc, _rx) = encoder_with(factory);
        enc.submit(block(1024, Instant::now()));
        assert_eq!(enc.stats.blocks_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_release_idempotent() {
        let factory = Arc::new(StubAudioFactory::default());
        let (enc, _rx) = encoder_with(factory);
        enc.configure().await.unwrap();
        enc.release().await;
        enc.release().await;
        assert!(!enc.is_configured());
    }
}
