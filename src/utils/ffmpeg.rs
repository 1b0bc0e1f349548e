//! FFmpeg interop helpers shared by codec backends and container writers
//!
//! Everything in the crate talks to FFmpeg in one time base (microseconds)
//! and rescales at the muxer boundary; the helpers here keep that rule in
//! one place, together with the unsafe codec-parameter plumbing needed to
//! describe tracks from out-of-band [`CodecParams`].

use std::sync::Once;

use ffmpeg_next::codec::packet::flag::Flags as PacketFlags;
use ffmpeg_next::format::stream::StreamMut;
use ffmpeg_next::{Packet, Rational};

use crate::error::{PipelineError, Result};
use crate::media::{CodecParams, EncodedSample, TrackKind};

static FFMPEG_INIT: Once = Once::new();

/// Initialize the FFmpeg library exactly once per process
pub fn ensure_init() {
    FFMPEG_INIT.call_once(|| {
        if let Err(e) = ffmpeg_next::init() {
            tracing::error!("FFmpeg initialization failed: {}", e);
        }
    });
}

/// The single time base used for every pts/dts inside the pipeline
pub fn micros_time_base() -> Rational {
    Rational::new(1, 1_000_000)
}

/// Fill a muxer stream's codec parameters from out-of-band [`CodecParams`].
///
/// The stream was added without an encoder context (samples arrive already
/// encoded), so the AVCodecParameters have to be populated by hand. The
/// extradata buffer must be allocated with FFmpeg's allocator because the
/// stream frees it with `av_free` on close.
pub fn apply_codec_params(stream: &mut StreamMut<'_>, params: &CodecParams) -> Result<()> {
    use ffmpeg_next::ffi;

    unsafe {
        let par = (*stream.as_mut_ptr()).codecpar;
        match params.kind {
            TrackKind::Video => {
                (*par).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
                (*par).codec_id = ffi::AVCodecID::AV_CODEC_ID_H264;
                (*par).width = params.width as i32;
                (*par).height = params.height as i32;
            }
            TrackKind::Audio => {
                (*par).codec_type = ffi::AVMediaType::AVMEDIA_TYPE_AUDIO;
                (*par).codec_id = ffi::AVCodecID::AV_CODEC_ID_AAC;
                (*par).sample_rate = params.sample_rate as i32;
                (*par).format = ffi::AVSampleFormat::AV_SAMPLE_FMT_FLTP as i32;
                ffi::av_channel_layout_default(&mut (*par).ch_layout, params.channels as i32);
            }
        }
        (*par).bit_rate = (params.bitrate_kbps as i64) * 1000;

        if !params.extradata.is_empty() {
            let size = params.extradata.len();
            let buf =
                ffi::av_mallocz(size + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
            if buf.is_null() {
                return Err(PipelineError::Muxer(
                    "failed to allocate codec extradata".to_string(),
                ));
            }
            std::ptr::copy_nonoverlapping(params.extradata.as_ptr(), buf, size);
            (*par).extradata = buf;
            (*par).extradata_size = size as i32;
        }
    }

    Ok(())
}

/// Build a muxable packet from an encoded sample, rescaled from the
/// pipeline's microsecond time base into the destination stream's.
pub fn packet_from_sample(
    sample: &EncodedSample,
    stream_index: usize,
    dst_time_base: Rational,
) -> Packet {
    let mut packet = Packet::copy(&sample.data);
    packet.set_pts(Some(sample.pts_us));
    // no B-frames anywhere in this pipeline, decode order == presentation order
    packet.set_dts(Some(sample.pts_us));
    if sample.duration_us > 0 {
        packet.set_duration(sample.duration_us);
    }
    if sample.flags.key_frame {
        packet.set_flags(PacketFlags::KEY);
    }
    packet.set_stream(stream_index);
    packet.set_position(-1);
    packet.rescale_ts(micros_time_base(), dst_time_base);
    packet
}
