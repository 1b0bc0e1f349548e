//! Streaming transport abstraction and the RTMP implementation
//!
//! The session state machine talks to the endpoint exclusively through
//! [`Transport`], so tests substitute a scripted double and the wire
//! protocol stays swappable. The production implementation muxes into FLV
//! over RTMP through FFmpeg's output layer.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::media::{CodecParams, EncodedSample, TrackKind};
use crate::utils::ffmpeg::{apply_codec_params, ensure_init, packet_from_sample};

/// Wire-protocol seam between the session state machine and the endpoint
///
/// Connection results are returned from `connect` rather than observed via
/// callbacks; the session maps them onto its state transitions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the protocol handshake with the endpoint
    async fn connect(&self, url: &str) -> Result<()>;

    /// Tear the connection down; must be safe to call in any state
    async fn disconnect(&self);

    /// Announce the video track's codec parameters
    async fn set_video_info(&self, params: &CodecParams) -> Result<()>;

    /// Announce the audio track's codec parameters
    async fn set_audio_info(&self, params: &CodecParams) -> Result<()>;

    /// Send one encoded video access unit
    async fn send_video(&self, sample: &EncodedSample) -> Result<()>;

    /// Send one encoded audio access unit
    async fn send_audio(&self, sample: &EncodedSample) -> Result<()>;
}

struct RtmpOutput {
    octx: ffmpeg_next::format::context::Output,
    video_index: Option<usize>,
    audio_index: Option<usize>,
    header_written: bool,
}

impl RtmpOutput {
    /// Both announced tracks must exist before the FLV header goes out;
    /// FLV cannot add streams afterwards
    fn ready(&self, audio_expected: bool) -> bool {
        self.video_index.is_some() && (!audio_expected || self.audio_index.is_some())
    }
}

/// RTMP transport over FFmpeg's FLV muxer
pub struct RtmpTransport {
    inner: Mutex<Option<RtmpOutput>>,
    audio_expected: bool,
}

impl RtmpTransport {
    /// `audio_expected` declares whether an audio track will be announced;
    /// samples are held back until every expected track is known
    pub fn new(audio_expected: bool) -> Self {
        Self {
            inner: Mutex::new(None),
            audio_expected,
        }
    }

    fn add_track(&self, params: &CodecParams) -> Result<()> {
        let mut guard = self.inner.lock();
        let output = guard
            .as_mut()
            .ok_or_else(|| PipelineError::Connection("not connected".to_string()))?;
        if output.header_written {
            // a reconfigured encoder mid-session; FLV streams are fixed
            debug!("{} codec info ignored: stream header already sent", params.kind);
            return Ok(());
        }

        let index = {
            let mut stream = output
                .octx
                .add_stream(ffmpeg_next::encoder::find(codec_id_for(params.kind)))
                .map_err(|e| PipelineError::Connection(format!("add {} stream: {}", params.kind, e)))?;
            apply_codec_params(&mut stream, params)
                .map_err(|e| PipelineError::Connection(e.to_string()))?;
            stream.index()
        };
        match params.kind {
            TrackKind::Video => output.video_index = Some(index),
            TrackKind::Audio => output.audio_index = Some(index),
        }
        debug!("rtmp {} track announced (stream {})", params.kind, index);
        Ok(())
    }

    fn write_sample(&self, kind: TrackKind, sample: &EncodedSample) -> Result<()> {
        let mut guard = self.inner.lock();
        let output = guard
            .as_mut()
            .ok_or_else(|| PipelineError::Connection("not connected".to_string()))?;

        let index = match kind {
            TrackKind::Video => output.video_index,
            TrackKind::Audio => output.audio_index,
        };
        let Some(index) = index else {
            debug!("{} sample before codec info, dropped", kind);
            return Ok(());
        };

        if !output.header_written {
            if !output.ready(self.audio_expected) {
                debug!("{} sample before all tracks announced, dropped", kind);
                return Ok(());
            }
            output
                .octx
                .write_header()
                .map_err(|e| PipelineError::Connection(format!("stream header: {}", e)))?;
            output.header_written = true;
            info!("rtmp stream header sent");
        }

        let time_base = output
            .octx
            .stream(index)
            .map(|s| s.time_base())
            .unwrap_or_else(crate::utils::ffmpeg::micros_time_base);
        let mut packet = packet_from_sample(sample, index, time_base);
        packet
            .write_interleaved(&mut output.octx)
            .map_err(|e| PipelineError::Connection(format!("send failed: {}", e)))
    }
}

fn codec_id_for(kind: TrackKind) -> ffmpeg_next::codec::Id {
    match kind {
        TrackKind::Video => ffmpeg_next::codec::Id::H264,
        TrackKind::Audio => ffmpeg_next::codec::Id::AAC,
    }
}

#[async_trait]
impl Transport for RtmpTransport {
    async fn connect(&self, url: &str) -> Result<()> {
        ensure_init();
        let url = url.to_string();
        // the RTMP handshake blocks inside avio; keep it off the workers
        let octx = tokio::task::spawn_blocking(move || {
            ffmpeg_next::format::output_as(&url, "flv")
        })
        .await
        .map_err(|e| PipelineError::Connection(format!("connect task failed: {}", e)))?
        .map_err(|e| PipelineError::Connection(format!("handshake failed: {}", e)))?;

        *self.inner.lock() = Some(RtmpOutput {
            octx,
            video_index: None,
            audio_index: None,
            header_written: false,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        let output = self.inner.lock().take();
        if let Some(mut output) = output {
            if output.header_written {
                if let Err(e) = output.octx.write_trailer() {
                    warn!("rtmp trailer write failed: {}", e);
                }
            }
            debug!("rtmp transport disconnected");
        }
    }

    async fn set_video_info(&self, params: &CodecParams) -> Result<()> {
        self.add_track(params)
    }

    async fn set_audio_info(&self, params: &CodecParams) -> Result<()> {
        self.add_track(params)
    }

    async fn send_video(&self, sample: &EncodedSample) -> Result<()> {
        self.write_sample(TrackKind::Video, sample)
    }

    async fn send_audio(&self, sample: &EncodedSample) -> Result<()> {
        self.write_sample(TrackKind::Audio, sample)
    }
}
