// crates/segcast-core/src/profile.rs
//
// Video profiles and the aspect-ratio arithmetic that adjusts a requested
// output resolution to the source's proportions before the encoder opens.

use crate::error::EngineError;

/// Output container selector. `None` defers to inference from the output
/// file extension (or to an explicit muxer override).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Mpegts,
    Mp4,
    Mkv,
    Dash,
    None,
}

impl Format {
    /// Runtime muxer name, when the format forces one.
    pub fn muxer_name(self) -> Option<&'static str> {
        match self {
            Format::Mpegts => Some("mpegts"),
            Format::Mp4 => Some("mp4"),
            Format::Mkv => Some("matroska"),
            Format::Dash => Some("dash"),
            Format::None => None,
        }
    }
}

/// Requested output parameters for one rendition.
///
/// `width`/`height` are a request, not a promise: the encoded dimensions are
/// the aspect-adjusted values from [`adjusted_resolution`], so statistics and
/// players always see the source proportions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoProfile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    /// Target frame rate, `fps_num / fps_den`.
    pub fps_num: i32,
    pub fps_den: i32,
    pub format: Format,
    /// Keyframe interval in seconds; the encoder default applies when unset.
    pub gop_secs: Option<u32>,
    /// Video codec override; the accelerator default applies when unset.
    pub codec: Option<String>,
}

impl VideoProfile {
    pub fn new(name: &str, width: u32, height: u32, bitrate: u32, fps: i32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            bitrate,
            fps_num: fps,
            fps_den: 1,
            format: Format::None,
            gop_secs: None,
            codec: None,
        }
    }

    /// A profile carrying no video parameters at all; used for pure
    /// copy/drop (transmux) outputs.
    pub fn empty() -> Self {
        Self::new("", 0, 0, 0, 0)
    }

    pub fn fps(&self) -> f64 {
        if self.fps_den == 0 {
            return 0.0;
        }
        self.fps_num as f64 / self.fps_den as f64
    }

    pub fn has_resolution(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

impl Default for VideoProfile {
    fn default() -> Self {
        VideoProfile::empty()
    }
}

// ── Standard ladder ───────────────────────────────────────────────────────────

pub fn p144p_30fps_16x9() -> VideoProfile {
    VideoProfile::new("P144p30fps16x9", 256, 144, 400_000, 30)
}

pub fn p240p_30fps_16x9() -> VideoProfile {
    VideoProfile::new("P240p30fps16x9", 426, 240, 600_000, 30)
}

pub fn p360p_30fps_16x9() -> VideoProfile {
    VideoProfile::new("P360p30fps16x9", 640, 360, 1_200_000, 30)
}

pub fn p576p_30fps_16x9() -> VideoProfile {
    VideoProfile::new("P576p30fps16x9", 1024, 576, 1_500_000, 30)
}

pub fn p720p_30fps_16x9() -> VideoProfile {
    VideoProfile::new("P720p30fps16x9", 1280, 720, 2_000_000, 30)
}

pub fn p720p_60fps_16x9() -> VideoProfile {
    VideoProfile::new("P720p60fps16x9", 1280, 720, 6_000_000, 60)
}

// ── Aspect-ratio adjustment ───────────────────────────────────────────────────

/// Round to the nearest even integer (ties resolve to the lower even value,
/// so 5.0 becomes 4, not 6), clamped to the 2-pixel minimum every pixel
/// format can represent.
fn round_even(x: f64) -> u32 {
    ((((x / 2.0) - 0.5).ceil() as u32) * 2).max(2)
}

/// Fit the requested `(target_w, target_h)` to the source's proportions.
///
/// The dimension matching the source's orientation is pinned to the target
/// (width for landscape and square sources, height for portrait) and the
/// other follows the source aspect ratio, rounded to even. A square source
/// against a widescreen target therefore pins to the target width, yielding
/// a square output.
pub fn adjusted_resolution(
    src_w: u32,
    src_h: u32,
    target_w: u32,
    target_h: u32,
) -> Result<(u32, u32), EngineError> {
    if src_w == 0 || src_h == 0 {
        return Err(EngineError::InvalidArgument(format!(
            "source resolution {src_w}x{src_h}"
        )));
    }
    if target_w == 0 || target_h == 0 {
        return Err(EngineError::InvalidArgument(format!(
            "target resolution {target_w}x{target_h}"
        )));
    }

    let out = if src_w >= src_h {
        let w = (target_w & !1).max(2);
        let h = round_even(w as f64 * src_h as f64 / src_w as f64);
        (w, h)
    } else {
        let h = (target_h & !1).max(2);
        let w = round_even(h as f64 * src_w as f64 / src_h as f64);
        (w, h)
    };
    Ok(out)
}

/// Parse a `"WxH"` resolution string.
pub fn parse_resolution(s: &str) -> Result<(u32, u32), EngineError> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| EngineError::InvalidArgument(format!("resolution '{s}'")))?;
    let w = w
        .trim()
        .parse::<u32>()
        .map_err(|_| EngineError::InvalidArgument(format!("resolution '{s}'")))?;
    let h = h
        .trim()
        .parse::<u32>()
        .map_err(|_| EngineError::InvalidArgument(format!("resolution '{s}'")))?;
    if w == 0 || h == 0 {
        return Err(EngineError::InvalidArgument(format!("resolution '{s}'")));
    }
    Ok((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn landscape_source_pins_width() {
        assert_eq!(adjusted_resolution(1280, 720, 426, 240).unwrap(), (426, 240));
        assert_eq!(adjusted_resolution(1280, 720, 124, 456).unwrap(), (124, 70));
    }

    #[test]
    fn portrait_source_pins_height() {
        assert_eq!(adjusted_resolution(123, 456, 426, 240).unwrap(), (64, 240));
        assert_eq!(adjusted_resolution(123, 457, 426, 240).unwrap(), (64, 240));
    }

    #[test]
    fn square_source_pins_width_not_height() {
        assert_eq!(adjusted_resolution(123, 123, 426, 240).unwrap(), (426, 426));
    }

    #[test]
    fn transposed_source() {
        assert_eq!(adjusted_resolution(456, 123, 426, 240).unwrap(), (426, 114));
    }

    #[test]
    fn odd_target_dimensions_round_down_to_even() {
        // Pinned dimension is floored to even; the free one is rounded.
        assert_eq!(adjusted_resolution(1280, 720, 427, 240).unwrap(), (426, 240));
    }

    #[test]
    fn exact_ties_round_to_the_lower_even() {
        // 10 * 2 / 4 = 5.0, exactly halfway between 4 and 6: the free
        // dimension takes the lower even value.
        assert_eq!(adjusted_resolution(4, 2, 10, 10).unwrap(), (10, 4));
        assert_eq!(adjusted_resolution(2, 4, 10, 10).unwrap(), (4, 10));
    }

    #[test]
    fn zero_dimensions_rejected() {
        assert!(adjusted_resolution(0, 720, 426, 240).is_err());
        assert!(adjusted_resolution(1280, 720, 0, 240).is_err());
    }

    #[test]
    fn resolution_parsing() {
        assert_eq!(parse_resolution("426x240").unwrap(), (426, 240));
        assert_eq!(parse_resolution("1920x1080").unwrap(), (1920, 1080));
        assert!(parse_resolution("426").is_err());
        assert!(parse_resolution("x240").is_err());
        assert!(parse_resolution("0x240").is_err());
    }

    #[test]
    fn standard_ladder_is_even_and_ordered() {
        let ladder = [
            p144p_30fps_16x9(),
            p240p_30fps_16x9(),
            p360p_30fps_16x9(),
            p576p_30fps_16x9(),
            p720p_30fps_16x9(),
            p720p_60fps_16x9(),
        ];
        let mut last_pixels = 0;
        for p in &ladder {
            assert_eq!(p.width % 2, 0, "{}", p.name);
            assert_eq!(p.height % 2, 0, "{}", p.name);
            assert!(p.width as u64 * p.height as u64 >= last_pixels);
            last_pixels = p.width as u64 * p.height as u64;
        }
    }
}
