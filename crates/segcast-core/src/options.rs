// crates/segcast-core/src/options.rs
//
// Input and output specifications for one transcode call.
//
// Component overrides are deliberately stringly-typed: encoder, muxer and
// their option maps are an enumerated configuration owned by the media
// runtime, which validates them at open time. The engine only recognises
// the `copy` and `drop` sentinels.

use std::collections::BTreeMap;

use crate::profile::VideoProfile;

/// Decode/encode accelerator selection.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Accel {
    #[default]
    Software,
    Cuda {
        /// Device ordinal or identifier, runtime-defined ("0", "1", ...).
        device: Option<String>,
    },
}

impl Accel {
    pub fn is_hardware(&self) -> bool {
        !matches!(self, Accel::Software)
    }
}

/// Per-component override: an encoder, decoder, or muxer selection plus a
/// verbatim option map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Component {
    /// Codec or muxer name. `copy` forwards packets verbatim, `drop` omits
    /// the stream, empty/`none` selects the default.
    pub name: Option<String>,
    pub opts: BTreeMap<String, String>,
}

impl Component {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            opts: BTreeMap::new(),
        }
    }

    pub fn copy() -> Self {
        Self::named("copy")
    }

    pub fn drop_stream() -> Self {
        Self::named("drop")
    }

    pub fn with_opt(mut self, key: &str, value: &str) -> Self {
        self.opts.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_copy(&self) -> bool {
        self.name.as_deref() == Some("copy")
    }

    pub fn is_drop(&self) -> bool {
        self.name.as_deref() == Some("drop")
    }

    /// True when the component names a concrete codec/muxer (not a sentinel,
    /// not the default).
    pub fn override_name(&self) -> Option<&str> {
        match self.name.as_deref() {
            None | Some("") | Some("none") | Some("copy") | Some("drop") => None,
            Some(other) => Some(other),
        }
    }
}

/// One input: a file path, stream URL, or previously segmented rendition.
#[derive(Clone, Debug, Default)]
pub struct InputSpec {
    pub path: String,
    pub accel: Accel,
    /// Key for registry-addressed calls; `None` uses an ephemeral session.
    pub session_key: Option<String>,
    /// Packet-level passthrough: no codecs are opened, timestamps are
    /// spliced at the container level.
    pub transmux: bool,
    /// Seek before the first read, in seconds from the start.
    pub seek_secs: Option<f64>,
    /// Stop after this many demuxed packets (then flush normally).
    pub packet_limit: Option<u64>,
}

impl InputSpec {
    pub fn file(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }
}

/// One output rendition of a transcode call.
#[derive(Clone, Debug, Default)]
pub struct OutputSpec {
    pub path: String,
    pub profile: VideoProfile,
    pub video: Component,
    pub audio: Component,
    pub muxer: Component,
}

impl OutputSpec {
    pub fn new(path: &str, profile: VideoProfile) -> Self {
        Self {
            path: path.to_string(),
            profile,
            ..Default::default()
        }
    }

    /// Both streams dropped: nothing would ever reach the muxer.
    pub fn drops_everything(&self) -> bool {
        self.video.is_drop() && self.audio.is_drop()
    }

    /// True when no stream of this output needs a decoder or filter.
    pub fn is_passthrough(&self) -> bool {
        (self.video.is_copy() || self.video.is_drop())
            && (self.audio.is_copy() || self.audio.is_drop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels() {
        assert!(Component::copy().is_copy());
        assert!(Component::drop_stream().is_drop());
        assert!(!Component::named("libx264").is_copy());
        assert_eq!(Component::named("snow").override_name(), Some("snow"));
        assert_eq!(Component::copy().override_name(), None);
        assert_eq!(Component::named("none").override_name(), None);
        assert_eq!(Component::default().override_name(), None);
    }

    #[test]
    fn passthrough_detection() {
        let mut out = OutputSpec::new("out.mp4", VideoProfile::empty());
        out.video = Component::copy();
        out.audio = Component::copy();
        assert!(out.is_passthrough());
        assert!(!out.drops_everything());

        out.audio = Component::drop_stream();
        assert!(out.is_passthrough());

        out.video = Component::drop_stream();
        assert!(out.drops_everything());

        out.video = Component::default();
        assert!(!out.is_passthrough());
    }

    #[test]
    fn component_opts_forward_verbatim() {
        let c = Component::named("vorbis").with_opt("strict", "experimental");
        assert_eq!(c.opts.get("strict").map(String::as_str), Some("experimental"));
    }
}
