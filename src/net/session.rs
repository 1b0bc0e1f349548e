//! Network session state machine
//!
//! One session per instance, driving a [`Transport`] through
//! `Idle -> Connecting -> Live -> {Reconnecting -> Connecting | Failed} -> Idle`.
//!
//! Reconnection is deliberately narrow: it runs only when a live session
//! observed connectivity loss and the link later came back, it is bounded
//! to a fixed number of attempts with doubling backoff, and every backoff
//! delay aborts the moment the link drops again. Transport errors while
//! the link is up are terminal; a healthy network that rejects us is not
//! worth hammering.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamSettings;
use crate::drop_logged;
use crate::error::{PipelineError, Result};
use crate::events::EventBus;
use crate::media::{CodecParams, EncodedSample, TrackKind};
use crate::utils::DropLog;

use super::transport::Transport;

/// Network session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Live,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Live => write!(f, "live"),
            SessionState::Reconnecting => write!(f, "reconnecting"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionStats {
    pub connect_attempts: AtomicU64,
    pub reconnect_episodes: AtomicU64,
    pub samples_sent: AtomicU64,
    pub samples_dropped: AtomicU64,
}

struct SessionRun {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the transport session lifecycle and gates sample delivery
pub struct NetworkSession {
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    connectivity: watch::Receiver<bool>,
    state_tx: watch::Sender<SessionState>,
    max_attempts: u32,
    backoff_base: Duration,
    video_ready: AtomicBool,
    audio_ready: AtomicBool,
    run: tokio::sync::Mutex<Option<SessionRun>>,
    throttle: DropLog,
    pub stats: SessionStats,
}

impl NetworkSession {
    /// `connectivity` is the externally observed link signal; the session
    /// never probes the network itself
    pub fn new(
        transport: Arc<dyn Transport>,
        connectivity: watch::Receiver<bool>,
        events: Arc<EventBus>,
        settings: &StreamSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            transport,
            events,
            connectivity,
            state_tx,
            max_attempts: settings.reconnect_attempts,
            backoff_base: Duration::from_millis(settings.reconnect_backoff_ms),
            video_ready: AtomicBool::new(false),
            audio_ready: AtomicBool::new(false),
            run: tokio::sync::Mutex::new(None),
            throttle: DropLog::with_defaults(),
            stats: SessionStats::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Begin a session. Valid only from `Idle`; the outcome is observed
    /// through the state watch and event bus, never returned here.
    pub async fn start(self: &Arc<Self>, url: &str) -> Result<()> {
        let mut run = self.run.lock().await;
        if self.state() != SessionState::Idle {
            return Err(PipelineError::Connection(format!(
                "cannot start session while {}",
                self.state()
            )));
        }
        // reap a finished previous run, if any
        if let Some(previous) = run.take() {
            previous.cancel.cancel();
            let _ = previous.task.await;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            self.clone()
                .run_session(url.to_string(), cancel.clone()),
        );
        *run = Some(SessionRun { cancel, task });
        Ok(())
    }

    /// Stop the session from any state and return to `Idle`. Idempotent.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        let previous_state = self.state();
        if let Some(previous) = run.take() {
            previous.cancel.cancel();
            let _ = previous.task.await;
        }
        self.clear_ready();
        self.transport.disconnect().await;
        if previous_state != SessionState::Idle {
            self.set_state(SessionState::Idle);
            self.events.session_status("stopped");
            info!("network session stopped");
        }
    }

    /// Announce codec parameters for a track; a no-op unless live
    pub async fn set_info(&self, kind: TrackKind, params: &CodecParams) {
        if self.state() != SessionState::Live {
            debug!("{} codec info skipped: session not live", kind);
            return;
        }
        let result = match kind {
            TrackKind::Video => self.transport.set_video_info(params).await,
            TrackKind::Audio => self.transport.set_audio_info(params).await,
        };
        match result {
            Ok(()) => {
                self.ready_flag(kind).store(true, Ordering::Relaxed);
            }
            Err(e) => self.on_transport_error(format!("codec info rejected: {}", e)).await,
        }
    }

    /// Send one sample; silently dropped unless the session is live and
    /// the track's codec info has been announced
    pub async fn send_sample(&self, kind: TrackKind, sample: &EncodedSample) {
        if self.state() != SessionState::Live {
            self.stats.samples_dropped.fetch_add(1, Ordering::Relaxed);
            drop_logged!(self.throttle, "send_not_live", "{} sample dropped: session not live", kind);
            return;
        }
        if !self.ready_flag(kind).load(Ordering::Relaxed) {
            self.stats.samples_dropped.fetch_add(1, Ordering::Relaxed);
            drop_logged!(self.throttle, "send_no_info", "{} sample dropped: codec info not sent", kind);
            return;
        }
        let result = match kind {
            TrackKind::Video => self.transport.send_video(sample).await,
            TrackKind::Audio => self.transport.send_audio(sample).await,
        };
        match result {
            Ok(()) => {
                self.stats.samples_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.on_transport_error(e.to_string()).await,
        }
    }

    fn ready_flag(&self, kind: TrackKind) -> &AtomicBool {
        match kind {
            TrackKind::Video => &self.video_ready,
            TrackKind::Audio => &self.audio_ready,
        }
    }

    fn clear_ready(&self) {
        self.video_ready.store(false, Ordering::Relaxed);
        self.audio_ready.store(false, Ordering::Relaxed);
    }

    fn set_state(&self, state: SessionState) {
        let _ = self.state_tx.send(state);
    }

    fn enter_live(&self) {
        self.set_state(SessionState::Live);
        self.events.session_status("live");
        info!("network session live");
    }

    fn fail(&self, status: String) {
        self.clear_ready();
        self.set_state(SessionState::Failed);
        self.events.session_status(status);
    }

    /// Transport failure during Live. Connectivity-loss failures are left
    /// to the reconnection path; anything else is terminal.
    async fn on_transport_error(&self, reason: String) {
        if !*self.connectivity.borrow() {
            drop_logged!(
                self.throttle,
                "send_link_down",
                "transport send failed while link down: {}",
                reason
            );
            return;
        }
        warn!("transport error while live: {}", reason);
        self.fail(format!("disconnected: {}", reason));
        self.transport.disconnect().await;
    }

    /// Session driver task: initial connect, then the connectivity monitor
    /// and bounded reconnection episodes
    async fn run_session(self: Arc<Self>, url: String, cancel: CancellationToken) {
        self.set_state(SessionState::Connecting);
        self.events.session_status("connecting");
        self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);

        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.transport.connect(&url) => result,
        };
        match connected {
            Ok(()) => self.enter_live(),
            Err(e) => {
                warn!("connect failed: {}", e);
                self.fail(format!("failed: {}", e));
                return;
            }
        }

        let mut conn = self.connectivity.clone();
        loop {
            // wait for a connectivity drop while live
            loop {
                match self.state() {
                    SessionState::Live if !*conn.borrow() => break,
                    SessionState::Failed | SessionState::Idle => return,
                    _ => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = conn.changed() => {
                        if changed.is_err() {
                            debug!("connectivity signal source gone");
                            return;
                        }
                    }
                }
            }

            info!("connectivity lost while live");
            self.clear_ready();
            self.set_state(SessionState::Reconnecting);
            self.events.session_status("reconnecting");
            self.transport.disconnect().await;

            'episodes: loop {
                // wait for the link to come back before attempting anything
                while !*conn.borrow() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        changed = conn.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
                self.stats.reconnect_episodes.fetch_add(1, Ordering::Relaxed);
                debug!("connectivity restored, starting reconnect episode");

                for attempt in 0..self.max_attempts {
                    let delay = self.backoff_base * 2u32.saturating_pow(attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                        _ = wait_link_down(&mut conn) => {
                            debug!("connectivity lost during backoff, aborting episode");
                            continue 'episodes;
                        }
                    }

                    self.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
                    info!("reconnect attempt {}/{}", attempt + 1, self.max_attempts);
                    let result = tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = self.transport.connect(&url) => result,
                    };
                    match result {
                        Ok(()) => {
                            self.enter_live();
                            break 'episodes;
                        }
                        Err(e) => {
                            warn!("reconnect attempt {} failed: {}", attempt + 1, e);
                            self.transport.disconnect().await;
                        }
                    }
                }

                self.fail("failed: reconnect attempts exhausted".to_string());
                warn!("reconnect attempts exhausted");
                return;
            }
        }
    }
}

/// Resolves when the connectivity signal reads false; never resolves if
/// the signal source disappears
async fn wait_link_down(conn: &mut watch::Receiver<bool>) {
    loop {
        if !*conn.borrow() {
            return;
        }
        if conn.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;

    fn session_parts(
        transport: Arc<MockTransport>,
    ) -> (Arc<NetworkSession>, watch::Sender<bool>) {
        let (conn_tx, conn_rx) = watch::channel(true);
        let session = Arc::new(NetworkSession::new(
            transport,
            conn_rx,
            Arc::new(EventBus::new()),
            &StreamSettings::default(),
        ));
        (session, conn_tx)
    }

    async fn wait_for_state(session: &NetworkSession, target: SessionState) {
        let mut watch = session.state_watch();
        loop {
            if *watch.borrow() == target {
                return;
            }
            watch.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_connect_success_goes_live() {
        let transport = Arc::new(MockTransport::new());
        let (session, _conn) = session_parts(transport.clone());
        session.start("rtmp://example/live").await.unwrap();
        wait_for_state(&session, SessionState::Live).await;
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_start_rejected_unless_idle() {
        let transport = Arc::new(MockTransport::new());
        let (session, _conn) = session_parts(transport);
        session.start("rtmp://example/live").await.unwrap();
        wait_for_state(&session, SessionState::Live).await;
        assert!(session.start("rtmp://example/live").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_is_terminal() {
        let transport = Arc::new(MockTransport::new());
        transport.script_connects(vec![Err("refused".into())]);
        let (session, _conn) = session_parts(transport.clone());
        session.start("rtmp://example/live").await.unwrap();
        wait_for_state(&session, SessionState::Failed).await;
        // no automatic retry without a connectivity-loss trigger
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let (session, _conn) = session_parts(transport.clone());
        session.start("rtmp://example/live").await.unwrap();
        wait_for_state(&session, SessionState::Live).await;
        session.stop().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert!(transport.disconnect_count() >= 1);
        session.stop().await;
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_sends_dropped_when_not_live() {
        let transport = Arc::new(MockTransport::new());
        let (session, _conn) = session_parts(transport.clone());
        let sample = EncodedSample {
            data: bytes::Bytes::from_static(b"x"),
            pts_us: 0,
            duration_us: 0,
            flags: Default::default(),
        };
        session.send_sample(TrackKind::Video, &sample).await;
        assert_eq!(transport.send_count(), 0);
        assert_eq!(session.stats.samples_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_sends_dropped_before_codec_info() {
        let transport = Arc::new(MockTransport::new());
        let (session, _conn) = session_parts(transport.clone());
        session.start("rtmp://example/live").await.unwrap();
        wait_for_state(&session, SessionState::Live).await;

        let sample = EncodedSample {
            data: bytes::Bytes::from_static(b"x"),
            pts_us: 0,
            duration_us: 0,
            flags: Default::default(),
        };
        session.send_sample(TrackKind::Video, &sample).await;
        assert_eq!(transport.send_count(), 0);

        session
            .set_info(TrackKind::Video, &CodecParams::video(1280, 720, 2500, bytes::Bytes::new()))
            .await;
        assert_eq!(transport.info_kinds(), vec![TrackKind::Video]);
        session.send_sample(TrackKind::Video, &sample).await;
        assert_eq!(transport.send_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_attempts_bounded_with_doubling_backoff() {
        let transport = Arc::new(MockTransport::new());
        let (session, conn) = session_parts(transport.clone());
        session.start("rtmp://example/live").await.unwrap();
        wait_for_state(&session, SessionState::Live).await;

        // every reconnect attempt will fail
        transport.fail_all_connects(true);

        conn.send(false).unwrap();
        wait_for_state(&session, SessionState::Reconnecting).await;
        let restored_at = tokio::time::Instant::now();
        conn.send(true).unwrap();

        wait_for_state(&session, SessionState::Failed).await;

        // initial connect + exactly 3 reconnect attempts
        assert_eq!(transport.connect_count(), 4);
        assert_eq!(session.stats.reconnect_episodes.load(Ordering::Relaxed), 1);

        // backoff doubles: attempts at >= 1s, 3s, 7s after restoration
        let times = transport.connect_times();
        let offsets: Vec<_> = times[1..]
            .iter()
            .map(|t| t.duration_since(restored_at))
            .collect();
        assert!(offsets[0] >= Duration::from_secs(1));
        assert!(offsets[1] >= offsets[0] + Duration::from_secs(2));
        assert!(offsets[2] >= offsets[1] + Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_aborts_when_link_drops_again() {
        let transport = Arc::new(MockTransport::new());
        let (session, conn) = session_parts(transport.clone());
        session.start("rtmp://example/live").await.unwrap();
        wait_for_state(&session, SessionState::Live).await;

        transport.fail_all_connects(true);

        conn.send(false).unwrap();
        wait_for_state(&session, SessionState::Reconnecting).await;
        conn.send(true).unwrap();

        // let the first attempt fire (after the 1s backoff) and fail
        transport.wait_for_connects(2).await;

        // drop the link during the 2s backoff before attempt two
        conn.send(false).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        // the episode aborted: no second attempt fired, not Failed
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(session.state(), SessionState::Reconnecting);

        // a later restoration starts a fresh episode
        transport.fail_all_connects(false);
        conn.send(true).unwrap();
        wait_for_state(&session, SessionState::Live).await;
        assert_eq!(session.stats.reconnect_episodes.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_transport_error_with_link_up_is_terminal() {
        let transport = Arc::new(MockTransport::new());
        let (session, _conn) = session_parts(transport.clone());
        session.start("rtmp://example/live").await.unwrap();
        wait_for_state(&session, SessionState::Live).await;
        session
            .set_info(TrackKind::Video, &CodecParams::video(1280, 720, 2500, bytes::Bytes::new()))
            .await;

        transport.fail_sends(true);
        let sample = EncodedSample {
            data: bytes::Bytes::from_static(b"x"),
            pts_us: 0,
            duration_us: 0,
            flags: Default::default(),
        };
        session.send_sample(TrackKind::Video, &sample).await;
        assert_eq!(session.state(), SessionState::Failed);
    }
}
