// crates/segcast-engine/src/encode.rs
//
// OutputSession: one muxer plus its encoder lanes for a single output
// rendition. Streams are laid out video-first regardless of input order.
//
// Encoder construction note: the codec context is created independently of
// the output stream and its parameters are copied into the stream's codecpar
// with avcodec_parameters_from_context after open, because the stream does
// not expose a codec accessor in this version of the bindings and the
// encoder only populates extradata (GLOBAL_HEADER) during open.
//
// State machine: Init -> HeaderWritten -> Encoding <-> Flushing -> Closed.
// Failures after the header still drive a best-effort trailer write so the
// container is left structurally parseable.

use std::sync::Arc;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::Sample;
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::{Packet, Rational};
use tracing::{debug, warn};

use segcast_core::error::EngineError;
use segcast_core::options::{Accel, OutputSpec};
use segcast_core::profile::adjusted_resolution;
use segcast_core::stats::MediaInfo;

use crate::decode::{output_stream_index, DecoderSession, StreamKind};
use crate::filter::{AudioAdapter, VideoAdapter, OUTPUT_SAMPLE_RATE};
use crate::gateway::{classify, dict_from, infer_muxer, HwDevice, Stage};

pub const DEFAULT_VIDEO_ENCODER: &str = "libx264";
pub const DEFAULT_HW_VIDEO_ENCODER: &str = "h264_nvenc";
pub const DEFAULT_AUDIO_ENCODER: &str = "aac";

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OutputState {
    Init,
    HeaderWritten,
    Encoding,
    Flushing,
    Closed,
}

/// What happens to encoder contexts when the session closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreePolicy {
    ForceClose,
    /// Keep the hardware video encoder alive inside the owning session so
    /// the next call skips GPU pipeline initialisation.
    PreserveHwEncoder,
}

/// Identity of a preserved hardware encoder. Any mismatch on the next call
/// forces a teardown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncoderKey {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps_num: i32,
    pub fps_den: i32,
    pub bitrate: u32,
}

pub struct PreservedEncoder {
    pub key: EncoderKey,
    pub encoder: ffmpeg::encoder::Video,
}

// Same single-thread-at-a-time contract as DecoderSession.
unsafe impl Send for PreservedEncoder {}

// ── Lanes ─────────────────────────────────────────────────────────────────────

enum LaneMode {
    Encode,
    Copy,
}

struct VideoLane {
    mode: LaneMode,
    ost_index: usize,
    /// Copy: input stream timebase. Encode: 1/fps slot timebase.
    src_tb: Rational,
    ost_tb: Rational,
    encoder: Option<ffmpeg::encoder::Video>,
    adapter: Option<VideoAdapter>,
    out_dims: (u32, u32),
    hardware: bool,
    key: Option<EncoderKey>,
    last_dts: Option<i64>,
    frames: u64,
    packets: u64,
}

struct AudioLane {
    mode: LaneMode,
    ost_index: usize,
    src_tb: Rational,
    ost_tb: Rational,
    encoder: Option<ffmpeg::encoder::Audio>,
    adapter: Option<AudioAdapter>,
    frame_size: usize,
    last_dts: Option<i64>,
    packets: u64,
}

// ── OutputSession ─────────────────────────────────────────────────────────────

pub struct OutputSession {
    path: String,
    octx: ffmpeg::format::context::Output,
    state: OutputState,
    video: Option<VideoLane>,
    audio: Option<AudioLane>,
}

// Same single-thread-at-a-time contract as DecoderSession.
unsafe impl Send for OutputSession {}

impl OutputSession {
    /// Validate the spec, open the muxer, create encoder lanes, and write
    /// the container header. Validation failures surface before any file
    /// is created.
    pub fn open(
        spec: &OutputSpec,
        src: &DecoderSession,
        accel: &Accel,
        hw: Option<&Arc<HwDevice>>,
        preserved: &mut Option<PreservedEncoder>,
    ) -> Result<Self, EngineError> {
        if spec.path.is_empty() {
            return Err(EngineError::InvalidArgument("empty output path".into()));
        }
        if spec.drops_everything() {
            return Err(EngineError::InvalidArgument(
                "every stream dropped, nothing to mux".into(),
            ));
        }

        let want_video = !spec.video.is_drop() && src.has_video();
        let want_audio = !spec.audio.is_drop() && src.has_audio();
        if !want_video && !want_audio {
            return Err(EngineError::InvalidArgument(
                "no source streams match the output selection".into(),
            ));
        }

        // Encode-lane parameters are validated before the muxer opens so a
        // bad profile never leaves a file behind.
        let video_plan = if want_video && !spec.video.is_copy() {
            let (src_w, src_h) = src
                .video_display_dims()
                .ok_or_else(|| EngineError::InvalidArgument("source resolution unknown".into()))?;
            if !spec.profile.has_resolution() {
                return Err(EngineError::InvalidArgument(format!(
                    "output '{}' requests a video encode without a resolution",
                    spec.path
                )));
            }
            let dims = adjusted_resolution(src_w, src_h, spec.profile.width, spec.profile.height)?;
            let fps = if spec.profile.fps_num > 0 {
                Rational::new(spec.profile.fps_num, spec.profile.fps_den.max(1))
            } else {
                // Rate passthrough: follow the source when the profile
                // leaves the rate unset.
                src.video_frame_rate().unwrap_or_else(|| Rational::new(30, 1))
            };
            Some((dims, fps))
        } else {
            None
        };

        let muxer = spec
            .muxer
            .override_name()
            .map(str::to_owned)
            .or_else(|| spec.profile.format.muxer_name().map(str::to_owned))
            .or_else(|| infer_muxer(&spec.path).map(str::to_owned));

        let mut octx = match &muxer {
            Some(name) => ffmpeg::format::output_as(&spec.path, name),
            None => ffmpeg::format::output(&spec.path),
        }
        .map_err(|e| classify(e, Stage::MuxOpen))?;

        let global_header = octx
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        // Video lane first so it muxes at stream index 0.
        let mut video = None;
        if want_video {
            let ost_index = output_stream_index(StreamKind::Video, true);
            if spec.video.is_copy() {
                let params = src
                    .video_parameters()
                    .ok_or_else(|| EngineError::InvalidArgument("video stream vanished".into()))?;
                add_copy_stream(&mut octx, params)?;
                video = Some(VideoLane {
                    mode: LaneMode::Copy,
                    ost_index,
                    src_tb: src.video_time_base(),
                    ost_tb: Rational::new(1, 90_000),
                    encoder: None,
                    adapter: None,
                    out_dims: (0, 0),
                    hardware: false,
                    key: None,
                    last_dts: None,
                    frames: 0,
                    packets: 0,
                });
            } else {
                let ((out_w, out_h), fps) = video_plan.expect("validated above");
                let hardware = accel.is_hardware();
                let codec_name = spec
                    .video
                    .override_name()
                    .or(spec.profile.codec.as_deref())
                    .unwrap_or(if hardware {
                        DEFAULT_HW_VIDEO_ENCODER
                    } else {
                        DEFAULT_VIDEO_ENCODER
                    })
                    .to_string();
                let key = EncoderKey {
                    codec: codec_name.clone(),
                    width: out_w,
                    height: out_h,
                    fps_num: fps.numerator(),
                    fps_den: fps.denominator(),
                    bitrate: spec.profile.bitrate,
                };

                let encoder = match preserved.take() {
                    Some(p) if p.key == key => {
                        debug!(codec = %codec_name, "reusing preserved hardware encoder");
                        add_stream_for_encoder(&mut octx, &p.encoder)?;
                        p.encoder
                    }
                    stale => {
                        if stale.is_some() {
                            debug!("preserved encoder incompatible with new parameters, discarding");
                        }
                        open_video_encoder(
                            &mut octx,
                            spec,
                            &codec_name,
                            out_w,
                            out_h,
                            fps,
                            global_header,
                            hardware,
                            hw,
                        )?
                    }
                };

                let enc_tb = Rational::new(fps.denominator(), fps.numerator());
                video = Some(VideoLane {
                    mode: LaneMode::Encode,
                    ost_index,
                    src_tb: enc_tb,
                    ost_tb: enc_tb,
                    encoder: Some(encoder),
                    adapter: Some(VideoAdapter::new(out_w, out_h, fps, src.video_time_base())),
                    out_dims: (out_w, out_h),
                    hardware,
                    key: Some(key),
                    last_dts: None,
                    frames: 0,
                    packets: 0,
                });
            }
        }

        let mut audio = None;
        if want_audio {
            let ost_index = output_stream_index(StreamKind::Audio, video.is_some());
            if spec.audio.is_copy() {
                let params = src
                    .audio_parameters()
                    .ok_or_else(|| EngineError::InvalidArgument("audio stream vanished".into()))?;
                add_copy_stream(&mut octx, params)?;
                audio = Some(AudioLane {
                    mode: LaneMode::Copy,
                    ost_index,
                    src_tb: src.audio_time_base(),
                    ost_tb: Rational::new(1, 90_000),
                    encoder: None,
                    adapter: None,
                    frame_size: 0,
                    last_dts: None,
                    packets: 0,
                });
            } else {
                let codec_name = spec
                    .audio
                    .override_name()
                    .unwrap_or(DEFAULT_AUDIO_ENCODER)
                    .to_string();
                let encoder =
                    open_audio_encoder(&mut octx, spec, &codec_name, global_header)?;
                let frame_size = {
                    let fs = encoder.frame_size() as usize;
                    if fs == 0 {
                        1024
                    } else {
                        fs
                    }
                };
                audio = Some(AudioLane {
                    mode: LaneMode::Encode,
                    ost_index,
                    src_tb: Rational::new(1, OUTPUT_SAMPLE_RATE),
                    ost_tb: Rational::new(1, OUTPUT_SAMPLE_RATE),
                    encoder: Some(encoder),
                    adapter: Some(AudioAdapter::new(src.audio_time_base())),
                    frame_size,
                    last_dts: None,
                    packets: 0,
                });
            }
        }

        let mut session = Self {
            path: spec.path.clone(),
            octx,
            state: OutputState::Init,
            video,
            audio,
        };

        let muxer_opts = dict_from(&spec.muxer.opts);
        session
            .octx
            .write_header_with(muxer_opts)
            .map_err(|e| classify(e, Stage::MuxOpen))?;
        session.state = OutputState::HeaderWritten;

        // The muxer may normalise stream timebases while writing the
        // header; anything captured earlier would be stale.
        if let Some(lane) = session.video.as_mut() {
            if let Some(stream) = session.octx.stream(lane.ost_index) {
                lane.ost_tb = stream.time_base();
            }
        }
        if let Some(lane) = session.audio.as_mut() {
            if let Some(stream) = session.octx.stream(lane.ost_index) {
                lane.ost_tb = stream.time_base();
            }
        }

        debug!(path = %session.path, muxer = muxer.as_deref().unwrap_or("auto"), "output opened");
        Ok(session)
    }

    pub fn state(&self) -> OutputState {
        self.state
    }

    /// True when no stream of this output needs decoded frames.
    pub fn is_passthrough(&self) -> bool {
        let video_enc = matches!(self.video.as_ref().map(|l| &l.mode), Some(LaneMode::Encode));
        let audio_enc = matches!(self.audio.as_ref().map(|l| &l.mode), Some(LaneMode::Encode));
        !video_enc && !audio_enc
    }

    pub fn adjusted_dims(&self) -> Option<(u32, u32)> {
        self.video
            .as_ref()
            .filter(|l| matches!(l.mode, LaneMode::Encode))
            .map(|l| l.out_dims)
    }

    // ── Steady-state input ────────────────────────────────────────────────────

    /// Forward one coded packet to a copy lane of the matching kind.
    /// Outputs without such a lane ignore the packet.
    pub fn push_packet(&mut self, kind: StreamKind, pkt: &Packet) -> Result<(), EngineError> {
        self.state = self.state.max(OutputState::Encoding);
        let octx = &mut self.octx;
        match kind {
            StreamKind::Video => {
                let Some(lane) = self.video.as_mut() else {
                    return Ok(());
                };
                if !matches!(lane.mode, LaneMode::Copy) {
                    return Ok(());
                }
                let mut p = pkt.clone();
                p.set_stream(lane.ost_index);
                p.rescale_ts(lane.src_tb, lane.ost_tb);
                clamp_monotonic_dts(&mut p, &mut lane.last_dts);
                p.write_interleaved(octx).map_err(|e| classify(e, Stage::Mux))?;
                lane.packets += 1;
                lane.frames += 1;
            }
            StreamKind::Audio => {
                let Some(lane) = self.audio.as_mut() else {
                    return Ok(());
                };
                if !matches!(lane.mode, LaneMode::Copy) {
                    return Ok(());
                }
                let mut p = pkt.clone();
                p.set_stream(lane.ost_index);
                p.rescale_ts(lane.src_tb, lane.ost_tb);
                clamp_monotonic_dts(&mut p, &mut lane.last_dts);
                p.write_interleaved(octx).map_err(|e| classify(e, Stage::Mux))?;
                lane.packets += 1;
            }
        }
        Ok(())
    }

    /// Route one decoded video frame through this output's adapter and
    /// encoder. No-op for copy/drop video.
    pub fn push_video(&mut self, frame: &VideoFrame) -> Result<(), EngineError> {
        self.state = self.state.max(OutputState::Encoding);
        let Some(lane) = self.video.as_mut() else {
            return Ok(());
        };
        if !matches!(lane.mode, LaneMode::Encode) {
            return Ok(());
        }
        let (Some(adapter), Some(encoder)) = (lane.adapter.as_mut(), lane.encoder.as_mut()) else {
            return Ok(());
        };
        let octx = &mut self.octx;
        let (ost_index, src_tb, ost_tb) = (lane.ost_index, lane.src_tb, lane.ost_tb);
        let last_dts = &mut lane.last_dts;
        let frames = &mut lane.frames;
        adapter.push(frame, &mut |scaled| {
            encoder
                .send_frame(scaled)
                .map_err(|e| classify(e, Stage::Encode))?;
            *frames += 1;
            drain_video_encoder(encoder, octx, ost_index, src_tb, ost_tb, last_dts)
        })
    }

    /// Route one decoded audio frame through the resampler, then feed the
    /// encoder exact frame_size chunks as they become available.
    pub fn push_audio(&mut self, frame: &AudioFrame) -> Result<(), EngineError> {
        self.state = self.state.max(OutputState::Encoding);
        let Some(lane) = self.audio.as_mut() else {
            return Ok(());
        };
        if !matches!(lane.mode, LaneMode::Encode) {
            return Ok(());
        }
        let (Some(adapter), Some(encoder)) = (lane.adapter.as_mut(), lane.encoder.as_mut()) else {
            return Ok(());
        };
        adapter.push(frame)?;
        let octx = &mut self.octx;
        let (ost_index, src_tb, ost_tb) = (lane.ost_index, lane.src_tb, lane.ost_tb);
        let last_dts = &mut lane.last_dts;
        while let Some(chunk) = adapter.pop(lane.frame_size, false) {
            encoder
                .send_frame(&chunk)
                .map_err(|e| classify(e, Stage::Encode))?;
            drain_audio_encoder(encoder, octx, ost_index, src_tb, ost_tb, last_dts)?;
        }
        Ok(())
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Flush adapters and encoders, then write the trailer. A trailer
    /// failure after an otherwise clean flush is logged, not returned.
    pub fn finish(&mut self, policy: FreePolicy) -> Result<MediaInfo, EngineError> {
        let had_header = self.state >= OutputState::HeaderWritten;
        self.state = OutputState::Flushing;
        let flushed = self.flush_lanes();

        if had_header {
            if let Err(e) = self.octx.write_trailer() {
                if flushed.is_ok() {
                    warn!(path = %self.path, error = %e, "trailer write failed");
                } else {
                    debug!(path = %self.path, error = %e, "trailer write failed during abort");
                }
            }
        }
        self.state = OutputState::Closed;

        if policy == FreePolicy::ForceClose {
            if let Some(lane) = self.video.as_mut() {
                lane.encoder = None;
            }
        }
        flushed?;
        Ok(self.stats())
    }

    fn flush_lanes(&mut self) -> Result<(), EngineError> {
        if let Some(lane) = self.video.as_mut() {
            if matches!(lane.mode, LaneMode::Encode) {
                if let (Some(adapter), Some(encoder)) =
                    (lane.adapter.as_mut(), lane.encoder.as_mut())
                {
                    let octx = &mut self.octx;
                    let (ost_index, src_tb, ost_tb) = (lane.ost_index, lane.src_tb, lane.ost_tb);
                    let last_dts = &mut lane.last_dts;
                    let frames = &mut lane.frames;
                    adapter.flush(&mut |scaled| {
                        encoder
                            .send_frame(scaled)
                            .map_err(|e| classify(e, Stage::Encode))?;
                        *frames += 1;
                        drain_video_encoder(encoder, octx, ost_index, src_tb, ost_tb, last_dts)
                    })?;
                    encoder.send_eof().map_err(|e| classify(e, Stage::Encode))?;
                    drain_video_encoder(encoder, octx, ost_index, src_tb, ost_tb, last_dts)?;
                }
            }
        }
        if let Some(lane) = self.audio.as_mut() {
            if matches!(lane.mode, LaneMode::Encode) {
                if let (Some(adapter), Some(encoder)) =
                    (lane.adapter.as_mut(), lane.encoder.as_mut())
                {
                    let octx = &mut self.octx;
                    let (ost_index, src_tb, ost_tb) = (lane.ost_index, lane.src_tb, lane.ost_tb);
                    let last_dts = &mut lane.last_dts;
                    // The final partial chunk is zero-padded so the encoder
                    // receives its fixed frame size.
                    while let Some(chunk) = adapter.pop(lane.frame_size, true) {
                        encoder
                            .send_frame(&chunk)
                            .map_err(|e| classify(e, Stage::Encode))?;
                        drain_audio_encoder(encoder, octx, ost_index, src_tb, ost_tb, last_dts)?;
                    }
                    encoder.send_eof().map_err(|e| classify(e, Stage::Encode))?;
                    drain_audio_encoder(encoder, octx, ost_index, src_tb, ost_tb, last_dts)?;
                }
            }
        }
        Ok(())
    }

    /// Extract the hardware encoder for reuse by a later call. Only
    /// meaningful after `finish(PreserveHwEncoder)`.
    pub fn take_preserved(&mut self) -> Option<PreservedEncoder> {
        let lane = self.video.as_mut()?;
        if !lane.hardware {
            return None;
        }
        let key = lane.key.clone()?;
        let mut encoder = lane.encoder.take()?;
        // Reset internal state so the drained encoder accepts frames again
        // on the next call.
        unsafe {
            ffmpeg::ffi::avcodec_flush_buffers(encoder.as_mut_ptr());
        }
        Some(PreservedEncoder { key, encoder })
    }

    pub fn stats(&self) -> MediaInfo {
        let mut info = MediaInfo::default();
        if let Some(lane) = &self.video {
            match lane.mode {
                LaneMode::Encode => {
                    info.frames = lane.frames;
                    info.pixels = lane.frames * lane.out_dims.0 as u64 * lane.out_dims.1 as u64;
                }
                LaneMode::Copy => {
                    info.frames = lane.frames;
                }
            }
            info.video_packets = lane.packets;
        }
        if let Some(lane) = &self.audio {
            info.audio_packets = lane.packets;
        }
        info
    }
}

// ── Construction helpers ──────────────────────────────────────────────────────

/// Add a parameter-copied stream for packet passthrough. The codec tag is
/// cleared: tags are container-specific and a stale one makes the target
/// muxer reject the stream.
pub(crate) fn add_copy_stream(
    octx: &mut ffmpeg::format::context::Output,
    params: ffmpeg::codec::Parameters,
) -> Result<(), EngineError> {
    let mut ost = octx
        .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
        .map_err(|e| classify(e, Stage::MuxOpen))?;
    ost.set_parameters(params);
    unsafe {
        (*ost.parameters().as_mut_ptr()).codec_tag = 0;
    }
    Ok(())
}

/// Add a stream for an already-opened (preserved) encoder and copy its
/// parameters into the stream.
fn add_stream_for_encoder(
    octx: &mut ffmpeg::format::context::Output,
    encoder: &ffmpeg::encoder::Video,
) -> Result<(), EngineError> {
    let index = {
        let ost = octx
            .add_stream(ffmpeg::encoder::find(ffmpeg::codec::Id::None))
            .map_err(|e| classify(e, Stage::MuxOpen))?;
        ost.index()
    };
    copy_encoder_parameters(octx, index, encoder.as_ptr() as *mut ffmpeg::ffi::AVCodecContext)
}

fn copy_encoder_parameters(
    octx: &mut ffmpeg::format::context::Output,
    stream_index: usize,
    enc_ctx: *mut ffmpeg::ffi::AVCodecContext,
) -> Result<(), EngineError> {
    let ret = unsafe {
        ffmpeg::ffi::avcodec_parameters_from_context(
            (**(*octx.as_mut_ptr()).streams.add(stream_index)).codecpar,
            enc_ctx,
        )
    };
    if ret < 0 {
        return Err(EngineError::MuxerFailure(format!(
            "copying encoder parameters failed ({ret})"
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn open_video_encoder(
    octx: &mut ffmpeg::format::context::Output,
    spec: &OutputSpec,
    codec_name: &str,
    out_w: u32,
    out_h: u32,
    fps: Rational,
    global_header: bool,
    hardware: bool,
    hw: Option<&Arc<HwDevice>>,
) -> Result<ffmpeg::encoder::Video, EngineError> {
    let codec = ffmpeg::encoder::find_by_name(codec_name)
        .ok_or_else(|| EngineError::CodecNotFound(codec_name.to_string()))?;

    let index = {
        let mut ost = octx
            .add_stream(codec)
            .map_err(|e| classify(e, Stage::MuxOpen))?;
        ost.set_time_base(Rational::new(fps.denominator(), fps.numerator()));
        ost.index()
    };

    let ctx = ffmpeg::codec::context::Context::new_with_codec(codec);
    let mut enc = ctx
        .encoder()
        .video()
        .map_err(|e| classify(e, Stage::Encode))?;

    enc.set_width(out_w);
    enc.set_height(out_h);
    enc.set_format(Pixel::YUV420P);
    enc.set_time_base(Rational::new(fps.denominator(), fps.numerator()));
    enc.set_frame_rate(Some(fps));
    enc.set_bit_rate(spec.profile.bitrate as usize);
    if let Some(gop_secs) = spec.profile.gop_secs {
        let fps_int = (f64::from(fps)).round().max(1.0) as u32;
        enc.set_gop(gop_secs * fps_int);
    }
    if global_header {
        enc.set_flags(ffmpeg::codec::flag::Flags::GLOBAL_HEADER);
    }
    if hardware {
        let hw = hw.ok_or(EngineError::HwEncoderInitFailure)?;
        unsafe {
            hw.bind_to(enc.as_mut_ptr());
        }
    }

    let opts = dict_from(&spec.video.opts);
    let opened = enc.open_as_with(codec, opts).map_err(|e| {
        if hardware {
            classify(e, Stage::Hw)
        } else {
            classify(e, Stage::Encode)
        }
    })?;

    copy_encoder_parameters(
        octx,
        index,
        opened.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
    )?;
    Ok(opened)
}

fn open_audio_encoder(
    octx: &mut ffmpeg::format::context::Output,
    spec: &OutputSpec,
    codec_name: &str,
    global_header: bool,
) -> Result<ffmpeg::encoder::Audio, EngineError> {
    let codec = ffmpeg::encoder::find_by_name(codec_name)
        .ok_or_else(|| EngineError::CodecNotFound(codec_name.to_string()))?;

    let index = {
        let mut ost = octx
            .add_stream(codec)
            .map_err(|e| classify(e, Stage::MuxOpen))?;
        ost.set_time_base(Rational::new(1, OUTPUT_SAMPLE_RATE));
        ost.index()
    };

    let ctx = ffmpeg::codec::context::Context::new_with_codec(codec);
    let mut enc = ctx
        .encoder()
        .audio()
        .map_err(|e| classify(e, Stage::Encode))?;

    enc.set_rate(OUTPUT_SAMPLE_RATE);
    enc.set_ch_layout(ChannelLayout::STEREO);
    enc.set_format(Sample::F32(SampleType::Planar));
    enc.set_bit_rate(128_000);
    if global_header {
        enc.set_flags(ffmpeg::codec::flag::Flags::GLOBAL_HEADER);
    }

    let opts = dict_from(&spec.audio.opts);
    let opened = enc
        .open_as_with(codec, opts)
        .map_err(|e| classify(e, Stage::Encode))?;

    copy_encoder_parameters(
        octx,
        index,
        opened.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
    )?;
    Ok(opened)
}

// ── Muxing helpers ────────────────────────────────────────────────────────────

/// Containers require strictly monotone DTS per stream; encoder flushes and
/// segment splices can produce equal or backward steps, which are clamped
/// to previous + 1.
fn clamp_monotonic_dts(pkt: &mut Packet, last_dts: &mut Option<i64>) {
    if let Some(dts) = pkt.dts() {
        if let Some(prev) = *last_dts {
            if dts <= prev {
                let clamped = prev + 1;
                pkt.set_dts(Some(clamped));
                if pkt.pts().map_or(false, |pts| pts < clamped) {
                    pkt.set_pts(Some(clamped));
                }
            }
        }
        *last_dts = pkt.dts();
    }
}

fn drain_video_encoder(
    encoder: &mut ffmpeg::encoder::Video,
    octx: &mut ffmpeg::format::context::Output,
    stream_index: usize,
    from_tb: Rational,
    to_tb: Rational,
    last_dts: &mut Option<i64>,
) -> Result<(), EngineError> {
    let mut pkt = Packet::empty();
    while encoder.receive_packet(&mut pkt).is_ok() {
        pkt.set_stream(stream_index);
        pkt.rescale_ts(from_tb, to_tb);
        clamp_monotonic_dts(&mut pkt, last_dts);
        pkt.write_interleaved(octx)
            .map_err(|e| classify(e, Stage::Mux))?;
    }
    Ok(())
}

fn drain_audio_encoder(
    encoder: &mut ffmpeg::encoder::Audio,
    octx: &mut ffmpeg::format::context::Output,
    stream_index: usize,
    from_tb: Rational,
    to_tb: Rational,
    last_dts: &mut Option<i64>,
) -> Result<(), EngineError> {
    let mut pkt = Packet::empty();
    while encoder.receive_packet(&mut pkt).is_ok() {
        pkt.set_stream(stream_index);
        pkt.rescale_ts(from_tb, to_tb);
        clamp_monotonic_dts(&mut pkt, last_dts);
        pkt.write_interleaved(octx)
            .map_err(|e| classify(e, Stage::Mux))?;
    }
    Ok(())
}
