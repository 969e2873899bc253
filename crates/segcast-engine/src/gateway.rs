// crates/segcast-engine/src/gateway.rs
//
// Narrow surface over the media runtime: process-wide init/deinit, error
// classification, container inference, option dictionaries, and hardware
// device contexts. Everything above this module works with `EngineError`
// and never inspects a raw runtime error.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use ffmpeg_the_third as ffmpeg;
use tracing::debug;

use segcast_core::error::EngineError;

// ── Process-wide init ─────────────────────────────────────────────────────────

static INIT: OnceLock<Result<(), String>> = OnceLock::new();
static NETWORK_UP: AtomicBool = AtomicBool::new(false);

/// Initialise the media runtime, including its network layer (RTMP ingest).
/// Idempotent: every call after the first returns the first call's outcome.
pub fn init() -> Result<(), EngineError> {
    INIT.get_or_init(|| {
        ffmpeg::init().map_err(|e| e.to_string())?;
        unsafe {
            ffmpeg::ffi::avformat_network_init();
        }
        NETWORK_UP.store(true, Ordering::SeqCst);
        debug!("media runtime initialised");
        Ok(())
    })
    .clone()
    .map_err(EngineError::Runtime)
}

/// Tear down the network layer. Codec/format registration has no teardown
/// in the runtime; this exists for API symmetry at process shutdown.
pub fn deinit() {
    if NETWORK_UP.swap(false, Ordering::SeqCst) {
        unsafe {
            ffmpeg::ffi::avformat_network_deinit();
        }
        debug!("media runtime network layer shut down");
    }
}

// ── Error classification ──────────────────────────────────────────────────────

/// POSIX EINVAL; the runtime reports argument errors as positive errno.
const EINVAL: std::os::raw::c_int = 22;

/// Pipeline position at which a runtime error surfaced. Classification is
/// stage-sensitive: the same underlying error code means different things
/// at open time than mid-stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    DemuxOpen,
    Demux,
    Decode,
    Filter,
    Encode,
    MuxOpen,
    Mux,
    Hw,
}

/// Map a runtime error onto the engine taxonomy. Called exactly once per
/// failure, at the point where the error leaves runtime code.
pub fn classify(err: ffmpeg::Error, stage: Stage) -> EngineError {
    use ffmpeg::Error as E;
    match err {
        E::InvalidData => EngineError::InvalidData,
        E::DecoderNotFound | E::EncoderNotFound | E::BsfNotFound => {
            EngineError::CodecNotFound(err.to_string())
        }
        E::DemuxerNotFound | E::ProtocolNotFound => {
            EngineError::FormatNotFound(err.to_string())
        }
        E::MuxerNotFound => EngineError::FormatNotFound(err.to_string()),
        E::StreamNotFound => EngineError::FormatNotFound(err.to_string()),
        E::Eof if stage == Stage::DemuxOpen => EngineError::EmptyData,
        E::Other { errno } if errno == EINVAL => {
            EngineError::InvalidArgument(err.to_string())
        }
        _ => match stage {
            Stage::Hw => EngineError::HwEncoderInitFailure,
            Stage::DemuxOpen | Stage::Demux => EngineError::DemuxerFailure(err.to_string()),
            Stage::MuxOpen | Stage::Mux => EngineError::MuxerFailure(err.to_string()),
            Stage::Filter => EngineError::FilterFailure(err.to_string()),
            Stage::Decode | Stage::Encode => EngineError::Runtime(err.to_string()),
        },
    }
}

// ── Container inference ───────────────────────────────────────────────────────

/// Muxer name for a destination path, from its extension. An explicit muxer
/// override always wins over this.
pub fn infer_muxer(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "mp4" => Some("mp4"),
        "ts" => Some("mpegts"),
        "m3u8" => Some("hls"),
        "mpd" => Some("dash"),
        "mkv" => Some("matroska"),
        "nut" => Some("nut"),
        "flv" => Some("flv"),
        // mp4 fragment; the mp4 muxer emits these under fragmented movflags
        "m4s" => Some("mp4"),
        _ => None,
    }
}

// ── Option dictionaries ───────────────────────────────────────────────────────

/// Build a runtime option dictionary from a verbatim key/value map.
pub fn dict_from(opts: &BTreeMap<String, String>) -> ffmpeg::Dictionary<'static> {
    let mut dict = ffmpeg::Dictionary::new();
    for (key, value) in opts {
        dict.set(key, value);
    }
    dict
}

// ── Hardware device contexts ──────────────────────────────────────────────────

/// A reference-counted hardware device context. The session owns at most
/// one of these per device type; codec contexts borrow additional
/// references via `bind_to`, and the runtime frees the device when the
/// last reference drops. Teardown order is encoder, then decoder, then
/// this device, which Rust drop order enforces naturally when the session
/// stores the device last.
pub struct HwDevice {
    ptr: *mut ffmpeg::ffi::AVBufferRef,
}

// The underlying AVBufferRef is internally reference counted and the
// wrapped pointer is only handed to codec contexts as a fresh reference.
unsafe impl Send for HwDevice {}
unsafe impl Sync for HwDevice {}

impl HwDevice {
    /// Allocate a CUDA device context. `device` selects the GPU ordinal
    /// ("0", "1", ...); the runtime default applies when unset.
    pub fn cuda(device: Option<&str>) -> Result<Self, EngineError> {
        let device_c = match device {
            Some(d) => Some(
                CString::new(d)
                    .map_err(|_| EngineError::InvalidArgument(format!("device '{d}'")))?,
            ),
            None => None,
        };
        let mut ptr: *mut ffmpeg::ffi::AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            ffmpeg::ffi::av_hwdevice_ctx_create(
                &mut ptr,
                ffmpeg::ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
                device_c.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
                ptr::null_mut(),
                0,
            )
        };
        if ret < 0 || ptr.is_null() {
            return Err(EngineError::HwEncoderInitFailure);
        }
        debug!(device = device.unwrap_or("default"), "cuda device context created");
        Ok(Self { ptr })
    }

    /// Attach a new reference to a codec context. The codec context frees
    /// its reference when it closes; ours stays alive until drop.
    ///
    /// # Safety
    /// `codec_ctx` must point to a live, not-yet-opened AVCodecContext.
    pub unsafe fn bind_to(&self, codec_ctx: *mut ffmpeg::ffi::AVCodecContext) {
        (*codec_ctx).hw_device_ctx = ffmpeg::ffi::av_buffer_ref(self.ptr);
    }
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        unsafe {
            ffmpeg::ffi::av_buffer_unref(&mut self.ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn muxer_inference_covers_the_container_table() {
        assert_eq!(infer_muxer("out.mp4"), Some("mp4"));
        assert_eq!(infer_muxer("seg_0.ts"), Some("mpegts"));
        assert_eq!(infer_muxer("play.m3u8"), Some("hls"));
        assert_eq!(infer_muxer("out.mpd"), Some("dash"));
        assert_eq!(infer_muxer("out.mkv"), Some("matroska"));
        assert_eq!(infer_muxer("out.nut"), Some("nut"));
        assert_eq!(infer_muxer("out.flv"), Some("flv"));
        assert_eq!(infer_muxer("chunk-001.m4s"), Some("mp4"));
        assert_eq!(infer_muxer("/tmp/dir/OUT.MP4"), Some("mp4"));
        assert_eq!(infer_muxer("noext"), None);
        assert_eq!(infer_muxer("out.wav"), None);
    }

    #[test]
    fn classification_is_stage_sensitive() {
        let eof = ffmpeg::Error::Eof;
        assert!(matches!(
            classify(eof, Stage::DemuxOpen),
            EngineError::EmptyData
        ));
        assert!(matches!(
            classify(ffmpeg::Error::Eof, Stage::Mux),
            EngineError::MuxerFailure(_)
        ));
        assert!(matches!(
            classify(ffmpeg::Error::InvalidData, Stage::Mux),
            EngineError::InvalidData
        ));
        assert!(matches!(
            classify(ffmpeg::Error::EncoderNotFound, Stage::Encode),
            EngineError::CodecNotFound(_)
        ));
        assert!(matches!(
            classify(ffmpeg::Error::Bug, Stage::Hw),
            EngineError::HwEncoderInitFailure
        ));
    }

    #[test]
    fn dictionaries_forward_verbatim() {
        let mut opts = BTreeMap::new();
        opts.insert("strict".to_string(), "experimental".to_string());
        opts.insert(
            "movflags".to_string(),
            "frag_keyframe+negative_cts_offsets".to_string(),
        );
        let dict = dict_from(&opts);
        assert_eq!(dict.get("strict"), Some("experimental"));
        assert_eq!(dict.get("movflags"), Some("frag_keyframe+negative_cts_offsets"));
    }
}
