// crates/segcast-engine/src/transcode.rs
//
// Transcoder: the per-session driver. Holds the decoder session (and, in
// hardware mode, a preserved encoder) across calls so successive segments
// of one stream share codec state and timestamp continuity.
//
// One call = one input segment fanned out to N outputs. The loop body
// checks for cancellation before pulling each packet; a cancel flushes
// what was already submitted, writes trailers, and returns as cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, warn};
use uuid::Uuid;

use segcast_core::error::EngineError;
use segcast_core::options::{Accel, InputSpec, OutputSpec};
use segcast_core::stats::TranscodeResults;

use crate::decode::{ClockMode, Decoded, DecoderSession, StreamKind};
use crate::encode::{FreePolicy, OutputSession, PreservedEncoder};
use crate::gateway::{self, HwDevice};
use crate::registry;

/// Emit a progress event every this many decoded video frames.
const PROGRESS_INTERVAL: u64 = 15;

/// Events published on the optional progress channel.
#[derive(Clone, Debug)]
pub enum TranscodeEvent {
    Progress { session: Uuid, frames: u64 },
}

/// One-shot transcode. Routes through the session registry when the input
/// names a session key, otherwise runs in an ephemeral session.
pub fn transcode(
    input: &InputSpec,
    outputs: &[OutputSpec],
) -> Result<TranscodeResults, EngineError> {
    match &input.session_key {
        Some(key) => registry::transcode_keyed(key, input, outputs),
        None => Transcoder::new().transcode(input, outputs),
    }
}

// ── Transcoder session ────────────────────────────────────────────────────────

pub struct Transcoder {
    id: Uuid,
    // Declaration order doubles as teardown order: preserved encoders
    // first, then the decoder, then the hardware device they reference.
    preserved: Option<PreservedEncoder>,
    decoder: Option<DecoderSession>,
    hw: Option<Arc<HwDevice>>,
    /// Keep the hardware encoder alive between calls. Incompatible
    /// parameter changes still force a teardown.
    pub preserve_hw_encoder: bool,
    pending_discontinuity: bool,
    cancel: Arc<AtomicBool>,
    progress: Option<Sender<TranscodeEvent>>,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcoder {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            decoder: None,
            hw: None,
            preserved: None,
            preserve_hw_encoder: true,
            pending_discontinuity: false,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Flag checked between packets; set it from any thread to stop the
    /// in-flight call cooperatively.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn set_progress_channel(&mut self, tx: Sender<TranscodeEvent>) {
        self.progress = Some(tx);
    }

    /// Mark the next input as discontinuous: its timestamps are spliced
    /// (or left alone) according to the session's clock mode instead of
    /// the default segment policy.
    pub fn discontinuity(&mut self) {
        self.pending_discontinuity = true;
    }

    /// Tear the session down: preserved encoders, then the decoder, then
    /// the hardware device context they both reference.
    pub fn stop(&mut self) {
        self.preserved = None;
        self.decoder = None;
        self.hw = None;
        debug!(session = %self.id, "session stopped");
    }

    /// Transcode one input segment into every requested output. An empty
    /// output list runs a decode-only pass (statistics only).
    pub fn transcode(
        &mut self,
        input: &InputSpec,
        outputs: &[OutputSpec],
    ) -> Result<TranscodeResults, EngineError> {
        gateway::init()?;
        self.cancel.store(false, Ordering::Relaxed);

        if input.path.is_empty() {
            return Err(EngineError::EmptyData);
        }
        // Fail contradictory outputs before any demuxer or muxer opens.
        for out in outputs {
            if out.drops_everything() {
                return Err(EngineError::InvalidArgument(format!(
                    "output '{}' drops every stream",
                    out.path
                )));
            }
        }

        if input.accel.is_hardware() && self.hw.is_none() {
            let device = match &input.accel {
                Accel::Cuda { device } => device.as_deref(),
                Accel::Software => None,
            };
            self.hw = Some(Arc::new(HwDevice::cuda(device)?));
        }

        let clock_mode = if input.transmux {
            ClockMode::Passthrough
        } else {
            ClockMode::Rebase
        };
        let discontinuity = std::mem::take(&mut self.pending_discontinuity);
        match self.decoder.as_mut() {
            Some(decoder) => decoder.reopen(input, discontinuity)?,
            None => {
                self.decoder = Some(DecoderSession::open(input, self.hw.clone(), clock_mode)?)
            }
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return Err(EngineError::Runtime("decoder session missing".into()));
        };

        let mut sessions: Vec<OutputSession> = Vec::with_capacity(outputs.len());
        for spec in outputs {
            sessions.push(OutputSession::open(
                spec,
                decoder,
                &input.accel,
                self.hw.as_ref(),
                &mut self.preserved,
            )?);
        }

        // Decoding runs when any output needs frames, or for a decode-only
        // statistics pass. All-passthrough calls count packets instead.
        let decode_active = !input.transmux
            && (sessions.is_empty() || sessions.iter().any(|s| !s.is_passthrough()));

        let mut results = TranscodeResults::default();
        let driven = drive(
            decoder,
            &mut sessions,
            &mut results,
            decode_active,
            &self.cancel,
            self.progress.as_ref(),
            self.id,
        );

        // The finish phase always runs so every opened output gets its
        // flush and trailer, even on error or cancel.
        let policy = if self.preserve_hw_encoder && input.accel.is_hardware() {
            FreePolicy::PreserveHwEncoder
        } else {
            FreePolicy::ForceClose
        };
        let mut first_error: Option<EngineError> = None;
        for session in sessions.iter_mut() {
            match session.finish(policy) {
                Ok(info) => results.encoded.push(info),
                Err(e) => {
                    warn!(error = %e, "output finish failed");
                    results.encoded.push(Default::default());
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if policy == FreePolicy::PreserveHwEncoder && self.preserved.is_none() {
            for session in sessions.iter_mut() {
                if let Some(p) = session.take_preserved() {
                    self.preserved = Some(p);
                    break;
                }
            }
        }

        match driven {
            Err(e) => Err(e),
            Ok(true) => Err(EngineError::Cancelled),
            Ok(false) => match first_error {
                Some(e) => Err(e),
                None => Ok(results),
            },
        }
    }
}

/// Packet pump for one call. Returns whether the loop ended by
/// cancellation.
fn drive(
    decoder: &mut DecoderSession,
    sessions: &mut [OutputSession],
    results: &mut TranscodeResults,
    decode_active: bool,
    cancel: &AtomicBool,
    progress: Option<&Sender<TranscodeEvent>>,
    session_id: Uuid,
) -> Result<bool, EngineError> {
    loop {
        if cancel.load(Ordering::Relaxed) {
            debug!(session = %session_id, "cancel observed, stopping input");
            return Ok(true);
        }
        let Some((kind, pkt)) = decoder.read_packet()? else {
            break;
        };

        match kind {
            StreamKind::Video => results.decoded.video_packets += 1,
            StreamKind::Audio => results.decoded.audio_packets += 1,
        }
        // Passthrough calls have no decoder output to count, so forwarded
        // video packets stand in for frames.
        if !decode_active && kind == StreamKind::Video {
            results.decoded.frames += 1;
        }

        for session in sessions.iter_mut() {
            session.push_packet(kind, &pkt)?;
        }

        if decode_active {
            let decoded = &mut results.decoded;
            decoder.decode(kind, &pkt, &mut |frame| {
                match frame {
                    Decoded::Video(f) => {
                        decoded.add_frame(f.width(), f.height());
                        if let Some(tx) = progress {
                            if decoded.frames % PROGRESS_INTERVAL == 0 {
                                let _ = tx.send(TranscodeEvent::Progress {
                                    session: session_id,
                                    frames: decoded.frames,
                                });
                            }
                        }
                        for session in sessions.iter_mut() {
                            session.push_video(f)?;
                        }
                    }
                    Decoded::Audio(f) => {
                        for session in sessions.iter_mut() {
                            session.push_audio(f)?;
                        }
                    }
                }
                Ok(())
            })?;
        }
    }

    if decode_active {
        let decoded = &mut results.decoded;
        decoder.flush(&mut |frame| {
            match frame {
                Decoded::Video(f) => {
                    decoded.add_frame(f.width(), f.height());
                    for session in sessions.iter_mut() {
                        session.push_video(f)?;
                    }
                }
                Decoded::Audio(f) => {
                    for session in sessions.iter_mut() {
                        session.push_audio(f)?;
                    }
                }
            }
            Ok(())
        })?;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use segcast_core::options::Component;
    use segcast_core::profile::VideoProfile;

    #[test]
    fn empty_input_path_is_rejected() {
        let err = Transcoder::new()
            .transcode(&InputSpec::default(), &[])
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyData));
    }

    #[test]
    fn all_drop_outputs_are_rejected_before_any_open() {
        let mut out = OutputSpec::new("none.mp4", VideoProfile::empty());
        out.video = Component::drop_stream();
        out.audio = Component::drop_stream();
        // The input does not exist; the argument check must fire first.
        let err = Transcoder::new()
            .transcode(&InputSpec::file("does-not-exist.ts"), &[out])
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
        assert!(!std::path::Path::new("none.mp4").exists());
    }

    #[test]
    fn missing_input_is_a_demuxer_failure() {
        let err = Transcoder::new()
            .transcode(&InputSpec::file("definitely-not-here.ts"), &[])
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::DemuxerFailure(_) | EngineError::FormatNotFound(_)
        ));
    }

    #[test]
    fn cancel_token_is_shared() {
        let session = Transcoder::new();
        let token = session.cancel_token();
        token.store(true, Ordering::Relaxed);
        assert!(session.cancel.load(Ordering::Relaxed));
    }
}
