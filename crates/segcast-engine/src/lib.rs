// crates/segcast-engine/src/lib.rs
//
// In-process media pipeline. The public surface is small: process-wide
// init/deinit, one-shot `transcode`, the long-lived `Transcoder` session,
// the RTMP-to-HLS segmenter, and key-addressed registry calls.
//
// To add a pipeline capability:
//   1. Create a new module file here
//   2. Add `pub mod mymodule;` below
//   3. Wire it into transcode.rs (or expose it directly)

pub mod decode;
pub mod encode;
pub mod filter;
pub mod gateway;
pub mod registry;
pub mod segment;
pub mod transcode;

// Re-export the main public API so embedders get one flat import path.
pub use gateway::{deinit, init};
pub use segment::rtmp_to_hls;
pub use transcode::{transcode, TranscodeEvent, Transcoder};

pub use segcast_core::error::EngineError;
pub use segcast_core::options::{Accel, Component, InputSpec, OutputSpec};
pub use segcast_core::profile::{self, Format, VideoProfile};
pub use segcast_core::stats::{MediaInfo, TranscodeResults};
