// crates/segcast-engine/src/decode.rs
//
// DecoderSession: a demuxer + decoder pair that survives across successive
// input segments. Codec state, the hardware device context, and the
// per-stream timestamp ledger persist between `reopen` calls so that output
// timestamps stay monotone over a whole segmented stream.
//
// Timestamp handling happens here, at the packet level, before anything is
// decoded: packets leave `read_packet` already carrying spliced timestamps,
// so decoded frames inherit them and every consumer downstream (filters,
// encoders, copy lanes) sees one consistent clock.

use std::sync::Arc;

use ffmpeg_the_third as ffmpeg;
use ffmpeg::media::Type as MediaType;
use ffmpeg::{Packet, Rational};
use tracing::{debug, warn};

use segcast_core::error::EngineError;
use segcast_core::options::InputSpec;

use crate::gateway::{classify, HwDevice, Stage};

// ── Stream identity ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// Output stream layout: video always muxes at index 0 when present, audio
/// follows. Subtitles and data streams never reach an output.
pub fn output_stream_index(kind: StreamKind, has_video: bool) -> usize {
    match kind {
        StreamKind::Video => 0,
        StreamKind::Audio => usize::from(has_video),
    }
}

// ── Timestamp continuity ──────────────────────────────────────────────────────

/// How segment boundaries are spliced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockMode {
    /// Decode path: every new segment is rebased onto the remembered end of
    /// the previous one. A discontinuity mark skips the rebase once, letting
    /// the natural gap through.
    Rebase,
    /// Transmux path: container timestamps are trusted (successive segments
    /// of one stream are already continuous). A discontinuity mark splices
    /// the next segment onto the remembered end instead.
    Passthrough,
}

/// Per-stream timestamp ledger: the offset currently applied to input
/// timestamps, and the remembered end (last emitted timestamp plus one
/// duration) that the next segment splices onto.
#[derive(Debug, Default)]
pub struct StreamClock {
    offset: i64,
    next_ts: Option<i64>,
    last_duration: i64,
}

impl StreamClock {
    /// Anchor a new segment at its first observed timestamp.
    pub fn begin_segment(&mut self, first_ts: i64, mode: ClockMode, discontinuity: bool) {
        let splice = match mode {
            ClockMode::Rebase => !discontinuity,
            ClockMode::Passthrough => discontinuity,
        };
        if splice {
            if let Some(next) = self.next_ts {
                self.offset = next - first_ts;
            }
        }
    }

    pub fn apply(&self, ts: i64) -> i64 {
        ts + self.offset
    }

    /// Record an emitted timestamp. Zero durations reuse the last non-zero
    /// one, mirroring how containers omit the duration on most packets.
    pub fn note(&mut self, out_ts: i64, duration: i64) {
        if duration > 0 {
            self.last_duration = duration;
        }
        let dur = self.last_duration.max(1);
        let next = out_ts + dur;
        if self.next_ts.map_or(true, |n| next > n) {
            self.next_ts = Some(next);
        }
    }
}

// ── Decoded frame handoff ─────────────────────────────────────────────────────

/// Borrowed view of one decoded frame, valid for the duration of the sink
/// call. The backing frame is reused across iterations.
pub enum Decoded<'a> {
    Video(&'a ffmpeg::util::frame::video::Video),
    Audio(&'a ffmpeg::util::frame::audio::Audio),
}

pub type FrameSink<'s> = dyn FnMut(Decoded) -> Result<(), EngineError> + 's;

// ── DecoderSession ────────────────────────────────────────────────────────────

pub struct DecoderSession {
    ictx: ffmpeg::format::context::Input,
    video: Option<ffmpeg::decoder::Video>,
    audio: Option<ffmpeg::decoder::Audio>,
    vi: Option<usize>,
    ai: Option<usize>,
    video_tb: Rational,
    audio_tb: Rational,
    hw: Option<Arc<HwDevice>>,
    clock_mode: ClockMode,
    video_clock: StreamClock,
    audio_clock: StreamClock,
    video_anchored: bool,
    audio_anchored: bool,
    segment_discontinuity: bool,
    /// Raw container DTS of the last accepted video packet, for the
    /// late-packet rejection rule. Resets per input.
    last_video_dts: Option<i64>,
    packets_read: u64,
    packet_limit: Option<u64>,
    /// Estimate of frames still buffered inside the decoders
    /// (packets sent minus frames received); logged at flush.
    pkt_diff: i64,
    /// Bad packets swallowed instead of aborting the call.
    recoverable_errors: u64,
}

// Runtime contexts hold non-atomic reference counts internally, so they are
// not auto-Send. A session is only ever driven by one thread at a time: the
// registry serialises access per key behind a mutex, and a free-standing
// session is owned by its caller.
unsafe impl Send for DecoderSession {}

impl DecoderSession {
    /// Open the demuxer and (outside transmux mode) the decoders. Succeeds
    /// only if at least one audio or video stream is discovered.
    pub fn open(
        spec: &InputSpec,
        hw: Option<Arc<HwDevice>>,
        clock_mode: ClockMode,
    ) -> Result<Self, EngineError> {
        if spec.path.is_empty() {
            return Err(EngineError::EmptyData);
        }

        let mut ictx =
            ffmpeg::format::input(&spec.path).map_err(|e| classify(e, Stage::DemuxOpen))?;

        if let Some(secs) = spec.seek_secs {
            if secs > 0.0 {
                let ts = (secs * f64::from(ffmpeg::ffi::AV_TIME_BASE)) as i64;
                if let Err(e) = ictx.seek(ts, ..=ts) {
                    // The demuxer keeps decoding from its current position;
                    // downstream timestamp filtering absorbs the pre-roll.
                    warn!(secs, error = %e, "seek soft-failed");
                }
            }
        }

        let vi = ictx.streams().best(MediaType::Video).map(|s| s.index());
        let ai = ictx.streams().best(MediaType::Audio).map(|s| s.index());
        if vi.is_none() && ai.is_none() {
            return Err(EngineError::FormatNotFound(format!(
                "no audio or video streams in '{}'",
                spec.path
            )));
        }

        let video_tb = vi
            .and_then(|i| ictx.stream(i))
            .map(|s| s.time_base())
            .unwrap_or_else(|| Rational::new(1, 90_000));
        let audio_tb = ai
            .and_then(|i| ictx.stream(i))
            .map(|s| s.time_base())
            .unwrap_or_else(|| Rational::new(1, 48_000));

        let mut session = Self {
            ictx,
            video: None,
            audio: None,
            vi,
            ai,
            video_tb,
            audio_tb,
            hw,
            clock_mode,
            video_clock: StreamClock::default(),
            audio_clock: StreamClock::default(),
            video_anchored: false,
            audio_anchored: false,
            segment_discontinuity: false,
            last_video_dts: None,
            packets_read: 0,
            packet_limit: spec.packet_limit,
            pkt_diff: 0,
            recoverable_errors: 0,
        };

        if !spec.transmux {
            session.open_decoders()?;
        }

        debug!(
            path = %spec.path,
            video = vi.is_some(),
            audio = ai.is_some(),
            transmux = spec.transmux,
            "input opened"
        );
        Ok(session)
    }

    /// Bind the next input segment, reusing the hardware context and the
    /// timestamp ledger. `discontinuity` is the pending mark from the
    /// session; it applies to this segment only.
    pub fn reopen(&mut self, spec: &InputSpec, discontinuity: bool) -> Result<(), EngineError> {
        let had_video = self.vi.is_some();
        let mut next = Self::open(spec, self.hw.clone(), self.clock_mode)?;
        if !had_video && next.vi.is_some() {
            // A video stream reappearing after audio-only segments has no
            // ledger entry to splice onto; rejecting beats corrupting the
            // output clock.
            return Err(EngineError::InvalidData);
        }
        next.video_clock = std::mem::take(&mut self.video_clock);
        next.audio_clock = std::mem::take(&mut self.audio_clock);
        next.segment_discontinuity = discontinuity;
        *self = next;
        Ok(())
    }

    fn open_decoders(&mut self) -> Result<(), EngineError> {
        if let Some(vi) = self.vi {
            let stream = self
                .ictx
                .stream(vi)
                .ok_or(EngineError::FormatNotFound("video stream vanished".into()))?;
            let mut ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                .map_err(|e| classify(e, Stage::Decode))?;
            if let Some(hw) = &self.hw {
                unsafe {
                    hw.bind_to(ctx.as_mut_ptr());
                }
            }
            self.video = Some(ctx.decoder().video().map_err(|e| classify(e, Stage::Decode))?);
        }
        if let Some(ai) = self.ai {
            let stream = self
                .ictx
                .stream(ai)
                .ok_or(EngineError::FormatNotFound("audio stream vanished".into()))?;
            let ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                .map_err(|e| classify(e, Stage::Decode))?;
            self.audio = Some(ctx.decoder().audio().map_err(|e| classify(e, Stage::Decode))?);
        }
        Ok(())
    }

    // ── Packet pump ───────────────────────────────────────────────────────────

    /// Pull the next audio or video packet, with continuity timestamps
    /// already applied. Subtitle/data packets are skipped; late video
    /// packets are rejected. `None` means end of input (or the packet
    /// limit was reached).
    pub fn read_packet(&mut self) -> Result<Option<(StreamKind, Packet)>, EngineError> {
        loop {
            if let Some(limit) = self.packet_limit {
                if self.packets_read >= limit {
                    return Ok(None);
                }
            }

            let (index, mut pkt) = match self.ictx.packets().next() {
                None => return Ok(None),
                Some(Err(ffmpeg::Error::Eof)) => return Ok(None),
                Some(Err(e)) => return Err(classify(e, Stage::Demux)),
                Some(Ok((stream, pkt))) => (stream.index(), pkt),
            };
            self.packets_read += 1;

            let kind = if Some(index) == self.vi {
                StreamKind::Video
            } else if Some(index) == self.ai {
                StreamKind::Audio
            } else {
                continue;
            };

            // Late-packet rejection: any backward DTS step on the video
            // stream discards the packet before it reaches a decoder or
            // muxer. Audio is exempt.
            if kind == StreamKind::Video {
                if let (Some(dts), Some(prev)) = (pkt.dts(), self.last_video_dts) {
                    if dts < prev {
                        warn!(dts, prev, "dropping late video packet");
                        continue;
                    }
                }
                if let Some(dts) = pkt.dts() {
                    self.last_video_dts = Some(dts);
                }
            }

            let mode = self.clock_mode;
            let disc = self.segment_discontinuity;
            let (clock, anchored) = match kind {
                StreamKind::Video => (&mut self.video_clock, &mut self.video_anchored),
                StreamKind::Audio => (&mut self.audio_clock, &mut self.audio_anchored),
            };

            let pts = pkt.pts();
            let dts = pkt.dts();
            if let Some(first) = pts.or(dts) {
                if !*anchored {
                    clock.begin_segment(first, mode, disc);
                    *anchored = true;
                }
            }
            pkt.set_pts(pts.map(|t| clock.apply(t)));
            pkt.set_dts(dts.map(|t| clock.apply(t)));
            if let Some(out_ts) = pkt.pts().or(pkt.dts()) {
                clock.note(out_ts, pkt.duration());
            }

            return Ok(Some((kind, pkt)));
        }
    }

    /// Decode one packet and hand every produced frame to `sink`. Packets
    /// the decoder refuses are swallowed and counted; the stream continues.
    pub fn decode(
        &mut self,
        kind: StreamKind,
        pkt: &Packet,
        sink: &mut FrameSink,
    ) -> Result<(), EngineError> {
        match kind {
            StreamKind::Video => {
                let Some(dec) = self.video.as_mut() else {
                    return Ok(());
                };
                if dec.send_packet(pkt).is_err() {
                    self.recoverable_errors += 1;
                    return Ok(());
                }
                self.pkt_diff += 1;
                let mut frame = ffmpeg::util::frame::video::Video::empty();
                while dec.receive_frame(&mut frame).is_ok() {
                    self.pkt_diff -= 1;
                    sink(Decoded::Video(&frame))?;
                }
            }
            StreamKind::Audio => {
                let Some(dec) = self.audio.as_mut() else {
                    return Ok(());
                };
                if dec.send_packet(pkt).is_err() {
                    self.recoverable_errors += 1;
                    return Ok(());
                }
                let mut frame = ffmpeg::util::frame::audio::Audio::empty();
                while dec.receive_frame(&mut frame).is_ok() {
                    sink(Decoded::Audio(&frame))?;
                }
            }
        }
        Ok(())
    }

    /// Drain both decoders at end of input. Frames still buffered for
    /// reordering come out here; the `pkt_diff` balance tells us whether
    /// the decoder swallowed frames it never returned.
    pub fn flush(&mut self, sink: &mut FrameSink) -> Result<(), EngineError> {
        if let Some(dec) = self.video.as_mut() {
            let _ = dec.send_eof();
            let mut frame = ffmpeg::util::frame::video::Video::empty();
            while dec.receive_frame(&mut frame).is_ok() {
                self.pkt_diff -= 1;
                sink(Decoded::Video(&frame))?;
            }
        }
        if let Some(dec) = self.audio.as_mut() {
            let _ = dec.send_eof();
            let mut frame = ffmpeg::util::frame::audio::Audio::empty();
            while dec.receive_frame(&mut frame).is_ok() {
                sink(Decoded::Audio(&frame))?;
            }
        }
        if self.pkt_diff > 0 {
            debug!(
                buffered = self.pkt_diff,
                dropped = self.recoverable_errors,
                "decoder flush left unreturned frames"
            );
        }
        Ok(())
    }

    // ── Accessors for downstream stages ──────────────────────────────────────

    pub fn has_video(&self) -> bool {
        self.vi.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.ai.is_some()
    }

    pub fn video_time_base(&self) -> Rational {
        self.video_tb
    }

    pub fn audio_time_base(&self) -> Rational {
        self.audio_tb
    }

    pub fn video_parameters(&self) -> Option<ffmpeg::codec::Parameters> {
        self.vi.and_then(|i| self.ictx.stream(i)).map(|s| s.parameters())
    }

    pub fn audio_parameters(&self) -> Option<ffmpeg::codec::Parameters> {
        self.ai.and_then(|i| self.ictx.stream(i)).map(|s| s.parameters())
    }

    /// Display dimensions from the container, not the decoder's coded
    /// dimensions: codecs pad to macroblock multiples and the padding must
    /// not leak into aspect-ratio arithmetic.
    pub fn video_display_dims(&self) -> Option<(u32, u32)> {
        let stream = self.ictx.stream(self.vi?)?;
        let params = stream.parameters();
        let (w, h) = unsafe {
            let p = params.as_ptr();
            ((*p).width as u32, (*p).height as u32)
        };
        if w > 0 && h > 0 {
            Some((w, h))
        } else {
            self.video
                .as_ref()
                .map(|d| (d.width(), d.height()))
                .filter(|&(w, h)| w > 0 && h > 0)
        }
    }

    /// Effective source frame rate: the container's average rate when it is
    /// usable, the raw rate otherwise.
    pub fn video_frame_rate(&self) -> Option<Rational> {
        let stream = self.ictx.stream(self.vi?)?;
        let avg = stream.avg_frame_rate();
        if avg.numerator() > 0 && avg.denominator() > 0 {
            return Some(avg);
        }
        let raw = stream.rate();
        (raw.numerator() > 0 && raw.denominator() > 0).then_some(raw)
    }

    pub fn recoverable_errors(&self) -> u64 {
        self.recoverable_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_layout_puts_video_first() {
        assert_eq!(output_stream_index(StreamKind::Video, true), 0);
        assert_eq!(output_stream_index(StreamKind::Audio, true), 1);
        assert_eq!(output_stream_index(StreamKind::Audio, false), 0);
    }

    #[test]
    fn rebase_mode_splices_every_segment() {
        let mut clock = StreamClock::default();

        // Segment one: 60 fps at 90 kHz, starting at 138000.
        clock.begin_segment(138_000, ClockMode::Rebase, false);
        for i in 0..120 {
            let ts = clock.apply(138_000 + i * 1_500);
            clock.note(ts, 1_500);
        }
        // First segment maps through unchanged.
        assert_eq!(clock.apply(138_000), 138_000);

        // Segment two starts over at the same container timestamps; the
        // rebase splices it right after segment one.
        clock.begin_segment(138_000, ClockMode::Rebase, false);
        assert_eq!(clock.apply(138_000), 138_000 + 120 * 1_500);
    }

    #[test]
    fn rebase_mode_discontinuity_lets_the_gap_through() {
        let mut clock = StreamClock::default();
        clock.begin_segment(0, ClockMode::Rebase, false);
        for i in 0..10 {
            let ts = clock.apply(i * 1_500);
            clock.note(ts, 1_500);
        }
        // Next segment starts 30 s later in container time; the
        // discontinuity mark keeps the natural jump.
        clock.begin_segment(2_700_000, ClockMode::Rebase, true);
        assert_eq!(clock.apply(2_700_000), 2_700_000);
    }

    #[test]
    fn passthrough_mode_trusts_continuous_inputs() {
        let mut clock = StreamClock::default();
        clock.begin_segment(138_000, ClockMode::Passthrough, false);
        for i in 0..120 {
            let ts = clock.apply(138_000 + i * 1_500);
            clock.note(ts, 1_500);
        }
        // Consecutive HLS segments continue the container clock already.
        clock.begin_segment(318_000, ClockMode::Passthrough, false);
        assert_eq!(clock.apply(318_000), 318_000);
    }

    #[test]
    fn passthrough_discontinuity_splices_onto_remembered_end() {
        let mut clock = StreamClock::default();
        clock.begin_segment(138_000, ClockMode::Passthrough, false);
        let mut last = 0;
        for i in 0..480 {
            last = clock.apply(138_000 + i * 1_500);
            clock.note(last, 1_500);
        }
        // Replaying the same segments from the top: splice instead of
        // jumping backwards.
        clock.begin_segment(138_000, ClockMode::Passthrough, true);
        assert_eq!(clock.apply(138_000), last + 1_500);

        // Monotonicity across the boundary.
        assert!(clock.apply(138_000) > last);
    }

    #[test]
    fn note_reuses_last_nonzero_duration() {
        let mut clock = StreamClock::default();
        clock.begin_segment(0, ClockMode::Rebase, false);
        clock.note(0, 1_500);
        clock.note(1_500, 0);
        clock.begin_segment(0, ClockMode::Rebase, false);
        // 1500 + 1500 even though the second packet had no duration.
        assert_eq!(clock.apply(0), 3_000);
    }
}
