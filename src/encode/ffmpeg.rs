//! FFmpeg codec backends
//!
//! Production implementations of the codec traits: H.264 video through
//! libx264 (or a hardware encoder named in the settings) and AAC audio.
//! Both encoders run with `GLOBAL_HEADER` so parameter sets come out as
//! extradata once per configuration epoch instead of inline in the
//! bitstream, which is what both the MP4 muxer and the RTMP endpoint
//! expect.

use bytes::Bytes;
use ffmpeg_next::codec::packet::Packet;
use ffmpeg_next::{codec, picture, Dictionary, Rational};
use tracing::{debug, info};

use crate::config::{AudioSettings, VideoSettings};
use crate::error::{PipelineError, Result};
use crate::media::{CodecParams, EncodedSample, RawVideoFrame, SampleFlags};
use crate::utils::ffmpeg::{ensure_init, micros_time_base};

use super::backend::{AudioCodec, AudioCodecFactory, VideoCodec, VideoCodecFactory};

/// Read a freshly opened encoder's extradata (SPS/PPS or the
/// AudioSpecificConfig, depending on the codec)
fn read_extradata(ctx_ptr: *const ffmpeg_next::ffi::AVCodecContext) -> Bytes {
    unsafe {
        let extradata = (*ctx_ptr).extradata;
        let size = (*ctx_ptr).extradata_size;
        if extradata.is_null() || size <= 0 {
            Bytes::new()
        } else {
            Bytes::copy_from_slice(std::slice::from_raw_parts(extradata, size as usize))
        }
    }
}

/// Drain every pending packet out of an opened encoder.
///
/// EAGAIN means the encoder wants more input; EOF means it is flushed.
fn receive_pending<F>(mut receive: F, out: &mut Vec<Packet>) -> Result<()>
where
    F: FnMut(&mut Packet) -> std::result::Result<(), ffmpeg_next::Error>,
{
    loop {
        let mut packet = Packet::empty();
        match receive(&mut packet) {
            Ok(()) => out.push(packet),
            Err(ffmpeg_next::Error::Other { errno })
                if errno == ffmpeg_next::util::error::EAGAIN =>
            {
                return Ok(());
            }
            Err(ffmpeg_next::Error::Eof) => return Ok(()),
            Err(e) => return Err(PipelineError::Media(format!("encoder drain failed: {}", e))),
        }
    }
}

// ============================================================================
// H.264 video
// ============================================================================

pub struct FfmpegVideoCodec {
    encoder: codec::encoder::Video,
    params: CodecParams,
    frame_duration_us: i64,
    force_key_frame: bool,
    last_pts: i64,
}

impl FfmpegVideoCodec {
    fn open(settings: &VideoSettings, width: u32, height: u32) -> Result<Self> {
        ensure_init();

        let codec = ffmpeg_next::encoder::find_by_name(&settings.codec).ok_or_else(|| {
            PipelineError::Configuration(format!("video encoder not found: {}", settings.codec))
        })?;

        let ctx = codec::Context::new_with_codec(codec);
        let mut encoder = ctx.encoder().video().map_err(|e| {
            PipelineError::Configuration(format!("video encoder context: {}", e))
        })?;

        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(ffmpeg_next::format::Pixel::YUV420P);
        encoder.set_time_base(micros_time_base());
        encoder.set_frame_rate(Some(Rational::new(settings.fps as i32, 1)));
        encoder.set_bit_rate(settings.bitrate_kbps as usize * 1000);
        encoder.set_gop(settings.gop);
        // parameter sets go to extradata, not the bitstream
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let mut opts = Dictionary::new();
        opts.set("preset", "veryfast");
        opts.set("tune", "zerolatency");

        let encoder = encoder.open_with(opts).map_err(|e| {
            PipelineError::Configuration(format!(
                "failed to open {} at {}x{}: {}",
                settings.codec, width, height, e
            ))
        })?;

        let extradata = read_extradata(unsafe { encoder.as_ptr() });
        if extradata.is_empty() {
            debug!("video encoder produced no global header extradata");
        }
        let params = CodecParams::video(width, height, settings.bitrate_kbps, extradata);

        info!(
            "video encoder opened: {} {}x{} @ {}fps, {}kbps",
            settings.codec, width, height, settings.fps, settings.bitrate_kbps
        );

        Ok(Self {
            encoder,
            params,
            frame_duration_us: 1_000_000 / settings.fps.max(1) as i64,
            force_key_frame: false,
            last_pts: 0,
        })
    }
}

impl VideoCodec for FfmpegVideoCodec {
    fn params(&self) -> &CodecParams {
        &self.params
    }

    fn encode(&mut self, frame: &RawVideoFrame, pts_us: i64) -> Result<Vec<EncodedSample>> {
        if !frame.is_complete() {
            return Err(PipelineError::Media(format!(
                "short video frame: {} bytes for {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            )));
        }

        let mut vframe = ffmpeg_next::frame::Video::new(
            ffmpeg_next::format::Pixel::YUV420P,
            frame.width,
            frame.height,
        );
        copy_yuv420_planes(&mut vframe, frame);
        vframe.set_pts(Some(pts_us));
        if self.force_key_frame {
            self.force_key_frame = false;
            vframe.set_kind(picture::Type::I);
        }

        self.encoder
            .send_frame(&vframe)
            .map_err(|e| PipelineError::Media(format!("video encode failed: {}", e)))?;

        let mut packets = Vec::new();
        let encoder = &mut self.encoder;
        receive_pending(|p| encoder.receive_packet(p), &mut packets)?;

        let mut samples = Vec::with_capacity(packets.len());
        for packet in packets {
            let pts = packet.pts().unwrap_or(pts_us).max(self.last_pts);
            self.last_pts = pts;
            samples.push(EncodedSample {
                data: Bytes::copy_from_slice(packet.data().unwrap_or_default()),
                pts_us: pts,
                duration_us: self.frame_duration_us,
                flags: SampleFlags {
                    key_frame: packet.is_key(),
                    ..Default::default()
                },
            });
        }
        Ok(samples)
    }

    fn request_key_frame(&mut self) {
        self.force_key_frame = true;
    }
}

/// Copy a contiguous planar YUV420 payload into an FFmpeg frame,
/// honouring the frame's per-plane strides
fn copy_yuv420_planes(dst: &mut ffmpeg_next::frame::Video, src: &RawVideoFrame) {
    let w = src.width as usize;
    let h = src.height as usize;
    let luma = w * h;
    let chroma = (w / 2) * (h / 2);

    let planes = [
        (0usize, w, h, 0usize),
        (1, w / 2, h / 2, luma),
        (2, w / 2, h / 2, luma + chroma),
    ];
    for (index, plane_w, plane_h, offset) in planes {
        let stride = dst.stride(index);
        let data = dst.data_mut(index);
        for row in 0..plane_h {
            let begin = offset + row * plane_w;
            data[row * stride..row * stride + plane_w]
                .copy_from_slice(&src.data[begin..begin + plane_w]);
        }
    }
}

/// Production video codec factory
pub struct FfmpegVideoFactory;

impl VideoCodecFactory for FfmpegVideoFactory {
    fn open(
        &self,
        settings: &VideoSettings,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoCodec>> {
        Ok(Box::new(FfmpegVideoCodec::open(settings, width, height)?))
    }
}

// ============================================================================
// AAC audio
// ============================================================================

pub struct FfmpegAudioCodec {
    encoder: codec::encoder::Audio,
    params: CodecParams,
    sample_rate: u32,
    frame_size: usize,
    frame_duration_us: i64,
    /// Mono f32 samples awaiting a full encoder frame
    pending: Vec<f32>,
    /// pts of the first buffered sample's epoch
    base_pts: Option<i64>,
    samples_consumed: u64,
    last_pts: i64,
}

impl FfmpegAudioCodec {
    fn open(settings: &AudioSettings) -> Result<Self> {
        ensure_init();

        let codec = ffmpeg_next::encoder::find_by_name(&settings.codec).ok_or_else(|| {
            PipelineError::Configuration(format!("audio encoder not found: {}", settings.codec))
        })?;

        let ctx = codec::Context::new_with_codec(codec);
        let mut encoder = ctx.encoder().audio().map_err(|e| {
            PipelineError::Configuration(format!("audio encoder context: {}", e))
        })?;

        encoder.set_rate(settings.sample_rate as i32);
        encoder.set_channel_layout(ffmpeg_next::ChannelLayout::MONO);
        encoder.set_format(ffmpeg_next::format::Sample::F32(
            ffmpeg_next::format::sample::Type::Planar,
        ));
        encoder.set_bit_rate(settings.bitrate_kbps as usize * 1000);
        encoder.set_time_base(micros_time_base());
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);

        let encoder = encoder.open().map_err(|e| {
            PipelineError::Configuration(format!(
                "failed to open {} at {}Hz: {}",
                settings.codec, settings.sample_rate, e
            ))
        })?;

        let frame_size = encoder.frame_size().max(1) as usize;
        let extradata = read_extradata(unsafe { encoder.as_ptr() });
        let params = CodecParams::audio(
            settings.sample_rate,
            settings.channels,
            settings.bitrate_kbps,
            extradata,
        );

        info!(
            "audio encoder opened: {} {}Hz mono, {}kbps, frame size {}",
            settings.codec, settings.sample_rate, settings.bitrate_kbps, frame_size
        );

        Ok(Self {
            encoder,
            params,
            sample_rate: settings.sample_rate,
            frame_size,
            frame_duration_us: frame_size as i64 * 1_000_000 / settings.sample_rate.max(1) as i64,
            pending: Vec::with_capacity(frame_size * 2),
            base_pts: None,
            samples_consumed: 0,
            last_pts: 0,
        })
    }

    fn next_frame_pts(&self) -> i64 {
        let base = self.base_pts.unwrap_or(0);
        base + self.samples_consumed as i64 * 1_000_000 / self.sample_rate.max(1) as i64
    }
}

impl AudioCodec for FfmpegAudioCodec {
    fn params(&self) -> &CodecParams {
        &self.params
    }

    fn encode(&mut self, pcm: &[i16], pts_us: i64) -> Result<Vec<EncodedSample>> {
        if self.base_pts.is_none() {
            self.base_pts = Some(pts_us);
        }
        self.pending
            .extend(pcm.iter().map(|&s| s as f32 / 32768.0));

        let mut packets = Vec::new();
        while self.pending.len() >= self.frame_size {
            let mut aframe = ffmpeg_next::frame::Audio::new(
                ffmpeg_next::format::Sample::F32(ffmpeg_next::format::sample::Type::Planar),
                self.frame_size,
                ffmpeg_next::ChannelLayout::MONO,
            );
            aframe.set_rate(self.sample_rate);
            aframe
                .plane_mut::<f32>(0)
                .copy_from_slice(&self.pending[..self.frame_size]);
            aframe.set_pts(Some(self.next_frame_pts()));

            self.pending.drain(..self.frame_size);
            self.samples_consumed += self.frame_size as u64;

            self.encoder
                .send_frame(&aframe)
                .map_err(|e| PipelineError::Media(format!("audio encode failed: {}", e)))?;
            let encoder = &mut self.encoder;
            receive_pending(|p| encoder.receive_packet(p), &mut packets)?;
        }

        let mut samples = Vec::with_capacity(packets.len());
        for packet in packets {
            let pts = packet.pts().unwrap_or(self.last_pts).max(self.last_pts);
            self.last_pts = pts;
            samples.push(EncodedSample {
                data: Bytes::copy_from_slice(packet.data().unwrap_or_default()),
                pts_us: pts,
                duration_us: self.frame_duration_us,
                flags: SampleFlags {
                    // every AAC frame is independently decodable
                    key_frame: true,
                    ..Default::default()
                },
            });
        }
        Ok(samples)
    }
}

/// Production audio codec factory
pub struct FfmpegAudioFactory;

impl AudioCodecFactory for FfmpegAudioFactory {
    fn open(&self, settings: &AudioSettings) -> Result<Box<dyn AudioCodec>> {
        Ok(Box::new(FfmpegAudioCodec::open(settings)?))
    }
}
