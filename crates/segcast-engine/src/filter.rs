// crates/segcast-engine/src/filter.rs
//
// Per-output format adapters between decoder and encoder.
//
// Video: software scaler to the aspect-adjusted target resolution plus a
// frame-rate mapper that assigns each source frame to an output slot at the
// target rate, duplicating or dropping frames to fill the slot grid. Output
// frame PTS is the slot index in a 1/fps timebase, so source start offsets
// survive the conversion.
//
// Audio: software resampler to the fixed output format (44.1 kHz stereo
// planar float) plus a sample FIFO. Decoded audio arrives in arbitrary
// chunk sizes; the FIFO feeds the encoder exactly frame_size samples at a
// time and zero-pads the final partial frame at flush.
//
// Both adapters rebuild themselves when the source format changes mid-call
// (new segment with different parameters). The encoder side never changes:
// mid-call source changes rescale into the same output grid.

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{Pixel, Sample};
use ffmpeg::software::resampling;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags as SwsFlags};
use ffmpeg::util::channel_layout::{ChannelLayout, ChannelLayoutMask};
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::Rational;
use tracing::debug;

use segcast_core::error::EngineError;

use crate::gateway::{classify, Stage};

/// Output sample rate for every encoded audio stream.
pub const OUTPUT_SAMPLE_RATE: i32 = 44_100;

// ── Frame-rate slot mapping ───────────────────────────────────────────────────

/// Maps source presentation times onto an output slot grid at the target
/// rate. Each arriving frame releases the previous frame for the slots up
/// to its own; the final frame is released at flush using the last observed
/// inter-frame spacing as its duration.
#[derive(Debug)]
pub struct FpsMapper {
    fps: f64,
    next_slot: Option<i64>,
}

impl FpsMapper {
    pub fn new(fps: f64) -> Self {
        Self {
            fps,
            next_slot: None,
        }
    }

    pub fn slot_for(&self, pts_secs: f64) -> i64 {
        (pts_secs * self.fps).round() as i64
    }

    /// A new frame landed on `slot`. Returns the slot range the previous
    /// frame now covers (empty for the first frame, or when the new frame
    /// lands on an already-filled slot and the previous frame is dropped).
    pub fn on_frame(&mut self, slot: i64) -> std::ops::Range<i64> {
        match self.next_slot {
            None => {
                self.next_slot = Some(slot);
                slot..slot
            }
            Some(next) => {
                let end = slot.max(next);
                self.next_slot = Some(end);
                next..end
            }
        }
    }

    /// End of stream at `end_slot` (exclusive). Returns the slots the final
    /// buffered frame covers.
    pub fn on_flush(&mut self, end_slot: i64) -> std::ops::Range<i64> {
        match self.next_slot.take() {
            None => 0..0,
            Some(next) => next..end_slot.max(next),
        }
    }
}

// ── Video adapter ─────────────────────────────────────────────────────────────

pub type VideoSink<'s> = dyn FnMut(&VideoFrame) -> Result<(), EngineError> + 's;

pub struct VideoAdapter {
    out_w: u32,
    out_h: u32,
    in_tb: Rational,
    mapper: FpsMapper,
    /// Scaler plus the source key it was built for; rebuilt when the key
    /// changes (mid-stream resolution or pixel-format switch).
    scaler: Option<(SwsContext, Pixel, u32, u32)>,
    /// Last scaled frame, waiting for the next frame (or flush) to learn
    /// how many output slots it covers.
    pending: Option<VideoFrame>,
    last_secs: Option<f64>,
    prev_secs: Option<f64>,
}

impl VideoAdapter {
    /// `out_w`/`out_h` are the aspect-adjusted output dimensions; `fps` the
    /// target rate; `in_tb` the source stream timebase the frame PTS values
    /// are expressed in.
    pub fn new(out_w: u32, out_h: u32, fps: Rational, in_tb: Rational) -> Self {
        Self {
            out_w,
            out_h,
            in_tb,
            mapper: FpsMapper::new(f64::from(fps)),
            scaler: None,
            pending: None,
            last_secs: None,
            prev_secs: None,
        }
    }

    pub fn output_dims(&self) -> (u32, u32) {
        (self.out_w, self.out_h)
    }

    fn scale(&mut self, src: &VideoFrame) -> Result<VideoFrame, EngineError> {
        let key = (src.format(), src.width(), src.height());
        let rebuild = match &self.scaler {
            Some((_, fmt, w, h)) => (*fmt, *w, *h) != key,
            None => true,
        };
        if rebuild {
            if self.scaler.is_some() {
                debug!(
                    fmt = ?key.0, w = key.1, h = key.2,
                    "source format changed, rebuilding scaler"
                );
            }
            let ctx = SwsContext::get(
                key.0,
                key.1,
                key.2,
                Pixel::YUV420P,
                self.out_w,
                self.out_h,
                SwsFlags::BILINEAR,
            )
            .map_err(|e| classify(e, Stage::Filter))?;
            self.scaler = Some((ctx, key.0, key.1, key.2));
        }

        let mut out = VideoFrame::new(Pixel::YUV420P, self.out_w, self.out_h);
        let (ctx, ..) = self.scaler.as_mut().expect("scaler just built");
        ctx.run(src, &mut out).map_err(|e| classify(e, Stage::Filter))?;

        // The scaler inherits the source sample aspect ratio; the output
        // dimensions already encode the display shape, so force square
        // pixels.
        unsafe {
            (*out.as_mut_ptr()).sample_aspect_ratio = ffmpeg::ffi::AVRational { num: 1, den: 1 };
        }
        Ok(out)
    }

    /// Convert one decoded frame. Emits zero or more output frames (the
    /// previous frame duplicated across its slots) through `sink`, each
    /// with PTS set to its slot index in the 1/fps timebase.
    pub fn push(&mut self, src: &VideoFrame, sink: &mut VideoSink) -> Result<(), EngineError> {
        let Some(pts) = src.pts() else {
            // Frames without timestamps cannot be placed on the slot grid.
            return Ok(());
        };
        let secs = pts as f64 * f64::from(self.in_tb);
        let slot = self.mapper.slot_for(secs);

        let range = self.mapper.on_frame(slot);
        if let Some(pending) = self.pending.as_mut() {
            for s in range {
                pending.set_pts(Some(s));
                sink(pending)?;
            }
        }

        self.pending = Some(self.scale(src)?);
        self.prev_secs = self.last_secs;
        self.last_secs = Some(secs);
        Ok(())
    }

    /// Release the final buffered frame. Its duration is taken from the
    /// last inter-frame spacing, falling back to a single slot.
    pub fn flush(&mut self, sink: &mut VideoSink) -> Result<(), EngineError> {
        let end_slot = match (self.last_secs, self.prev_secs) {
            (Some(last), Some(prev)) if last > prev => self.mapper.slot_for(last + (last - prev)),
            (Some(last), _) => self.mapper.slot_for(last) + 1,
            (None, _) => return Ok(()),
        };
        let range = self.mapper.on_flush(end_slot);
        if let Some(pending) = self.pending.as_mut() {
            for s in range {
                pending.set_pts(Some(s));
                sink(pending)?;
            }
        }
        self.pending = None;
        Ok(())
    }
}

// ── Audio FIFO ────────────────────────────────────────────────────────────────

/// Stereo planar-float sample buffer. Mono input is duplicated onto both
/// channels so the output is always true stereo.
#[derive(Default)]
pub struct AudioFifo {
    left: Vec<f32>,
    right: Vec<f32>,
}

impl AudioFifo {
    /// Samples currently buffered, per channel.
    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    pub fn extend(&mut self, left: &[f32], right: &[f32]) {
        self.left.extend_from_slice(left);
        self.right.extend_from_slice(right);
    }

    /// Pop up to `n` samples per channel, zero-padding the tail when fewer
    /// remain. Only the final flush frame is ever padded.
    pub fn pop_planes(&mut self, n: usize) -> (Vec<f32>, Vec<f32>) {
        let available = self.left.len().min(n);
        let mut l = Vec::with_capacity(n);
        let mut r = Vec::with_capacity(n);
        l.extend_from_slice(&self.left[..available]);
        r.extend_from_slice(&self.right[..available]);
        l.resize(n, 0.0);
        r.resize(n, 0.0);
        self.left.drain(..available);
        self.right.drain(..available);
        (l, r)
    }

    /// Buffer one decoded frame already in planar-float format.
    fn push_frame(&mut self, frame: &AudioFrame) {
        let n = frame.samples();
        if n == 0 {
            return;
        }
        unsafe {
            let l = std::slice::from_raw_parts(frame.data(0).as_ptr() as *const f32, n);
            let r = if frame.ch_layout().channels() >= 2 {
                std::slice::from_raw_parts(frame.data(1).as_ptr() as *const f32, n)
            } else {
                l
            };
            self.left.extend_from_slice(l);
            self.right.extend_from_slice(r);
        }
    }
}

// ── Audio adapter ─────────────────────────────────────────────────────────────

pub struct AudioAdapter {
    in_tb: Rational,
    /// Resampler plus the source key (format, rate, channels) it was built
    /// for; rebuilt on change.
    resampler: Option<(resampling::Context, Sample, u32, u32)>,
    fifo: AudioFifo,
    /// Output PTS base in samples, anchored to the first frame's timestamp
    /// so the stream start offset survives the resample.
    base_sample: Option<i64>,
    popped: i64,
}

impl AudioAdapter {
    pub fn new(in_tb: Rational) -> Self {
        Self {
            in_tb,
            resampler: None,
            fifo: AudioFifo::default(),
            base_sample: None,
            popped: 0,
        }
    }

    pub fn buffered(&self) -> usize {
        self.fifo.len()
    }

    /// Buffer one decoded frame, resampling when the source differs from
    /// the output format in any dimension.
    pub fn push(&mut self, src: &AudioFrame) -> Result<(), EngineError> {
        if self.base_sample.is_none() {
            if let Some(pts) = src.pts() {
                let secs = pts as f64 * f64::from(self.in_tb);
                self.base_sample = Some((secs * OUTPUT_SAMPLE_RATE as f64).round() as i64);
            } else {
                self.base_sample = Some(0);
            }
        }

        let target_fmt = Sample::F32(SampleType::Planar);
        let channels = src.ch_layout().channels() as u32;
        let needs_resample = src.format() != target_fmt
            || src.rate() != OUTPUT_SAMPLE_RATE as u32
            || channels != 2;

        if !needs_resample {
            self.fifo.push_frame(src);
            return Ok(());
        }

        let key = (src.format(), src.rate(), channels);
        let rebuild = match &self.resampler {
            Some((_, fmt, rate, ch)) => (*fmt, *rate, *ch) != key,
            None => true,
        };
        if rebuild {
            if self.resampler.is_some() {
                debug!(fmt = ?key.0, rate = key.1, channels = key.2,
                       "source audio format changed, rebuilding resampler");
            }
            let src_layout = if channels >= 2 {
                src.ch_layout()
            } else {
                ChannelLayout::MONO
            };
            let ctx = resampling::Context::get2(
                src.format(),
                src_layout,
                src.rate(),
                target_fmt,
                ChannelLayout::STEREO,
                OUTPUT_SAMPLE_RATE as u32,
            )
            .map_err(|e| classify(e, Stage::Filter))?;
            self.resampler = Some((ctx, key.0, key.1, key.2));
        }

        let (ctx, ..) = self.resampler.as_mut().expect("resampler just built");
        let mut resampled = AudioFrame::empty();
        ctx.run(src, &mut resampled)
            .map_err(|e| classify(e, Stage::Filter))?;
        if resampled.samples() > 0 {
            self.fifo.push_frame(&resampled);
        }
        Ok(())
    }

    /// Pop one encoder-sized frame when enough samples are buffered (or
    /// unconditionally with `pad` at flush). PTS is the running sample
    /// index in the 1/44100 timebase.
    pub fn pop(&mut self, frame_size: usize, pad: bool) -> Option<AudioFrame> {
        if self.fifo.is_empty() || (!pad && self.fifo.len() < frame_size) {
            return None;
        }
        let (l, r) = self.fifo.pop_planes(frame_size);

        let mut frame = AudioFrame::new(
            Sample::F32(SampleType::Planar),
            frame_size,
            ChannelLayoutMask::STEREO,
        );
        frame.set_rate(OUTPUT_SAMPLE_RATE as u32);
        frame.set_pts(Some(self.base_sample.unwrap_or(0) + self.popped));
        unsafe {
            let dst_l =
                std::slice::from_raw_parts_mut(frame.data_mut(0).as_mut_ptr() as *mut f32, frame_size);
            dst_l.copy_from_slice(&l);
            let dst_r =
                std::slice::from_raw_parts_mut(frame.data_mut(1).as_mut_ptr() as *mut f32, frame_size);
            dst_r.copy_from_slice(&r);
        }
        self.popped += frame_size as i64;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(ranges: &[std::ops::Range<i64>]) -> i64 {
        ranges.iter().map(|r| r.end - r.start).sum()
    }

    #[test]
    fn one_to_one_rate_passes_every_frame() {
        // 30 fps source, 30 fps target, 1 second.
        let mut m = FpsMapper::new(30.0);
        let mut ranges = Vec::new();
        for i in 0..30 {
            ranges.push(m.on_frame(m.slot_for(i as f64 / 30.0)));
        }
        ranges.push(m.on_flush(m.slot_for(1.0)));
        assert_eq!(emitted(&ranges), 30);
    }

    #[test]
    fn halving_the_rate_drops_alternate_frames() {
        // 60 fps source, 30 fps target, 1 second of input.
        let mut m = FpsMapper::new(30.0);
        let mut ranges = Vec::new();
        for i in 0..60 {
            ranges.push(m.on_frame(m.slot_for(i as f64 / 60.0)));
        }
        ranges.push(m.on_flush(m.slot_for(1.0)));
        assert_eq!(emitted(&ranges), 30);
    }

    #[test]
    fn doubling_the_rate_duplicates_frames() {
        // 15 fps source, 30 fps target, 1 second.
        let mut m = FpsMapper::new(30.0);
        let mut ranges = Vec::new();
        for i in 0..15 {
            ranges.push(m.on_frame(m.slot_for(i as f64 / 15.0)));
        }
        ranges.push(m.on_flush(m.slot_for(1.0)));
        assert_eq!(emitted(&ranges), 30);
    }

    #[test]
    fn fractional_upconversion_fills_the_grid() {
        // 60 fps source to 123 fps target over 1 second.
        let mut m = FpsMapper::new(123.0);
        let mut ranges = Vec::new();
        for i in 0..60 {
            ranges.push(m.on_frame(m.slot_for(i as f64 / 60.0)));
        }
        ranges.push(m.on_flush(m.slot_for(1.0)));
        assert_eq!(emitted(&ranges), 123);
    }

    #[test]
    fn slots_anchor_to_absolute_time() {
        // A stream starting at 1.5333 s (138000 at 90 kHz) keeps its start
        // offset: the first output slot is 46 at 30 fps.
        let m = FpsMapper::new(30.0);
        assert_eq!(m.slot_for(138_000.0 / 90_000.0), 46);
    }

    #[test]
    fn fifo_pops_exact_frames_and_pads_the_tail() {
        let mut fifo = AudioFifo::default();
        let ramp: Vec<f32> = (0..1500).map(|i| i as f32).collect();
        fifo.extend(&ramp, &ramp);

        let (l, r) = fifo.pop_planes(1024);
        assert_eq!(l.len(), 1024);
        assert_eq!(l[0], 0.0);
        assert_eq!(l[1023], 1023.0);
        assert_eq!(r[1023], 1023.0);
        assert_eq!(fifo.len(), 1500 - 1024);

        // Final partial frame zero-pads.
        let (l, _r) = fifo.pop_planes(1024);
        assert_eq!(l[475], 1499.0);
        assert_eq!(l[476], 0.0);
        assert_eq!(l[1023], 0.0);
        assert!(fifo.is_empty());
    }
}
