// crates/segcast-core/src/stats.rs
//
// Frame and pixel accounting returned from every transcode call.

/// Counters for one input or one output.
///
/// `frames` counts decoded (or encoded) video frames after late-packet
/// filtering; `pixels` is the running sum of width x height over those
/// frames, using each frame's actual dimensions on the decode side and the
/// aspect-adjusted output dimensions on the encode side. The packet
/// counters cover passthrough (copy/transmux) traffic, which never reaches
/// a codec.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MediaInfo {
    pub frames: u64,
    pub pixels: u64,
    pub video_packets: u64,
    pub audio_packets: u64,
    pub other_packets: u64,
}

impl MediaInfo {
    pub fn add_frame(&mut self, width: u32, height: u32) {
        self.frames += 1;
        self.pixels += width as u64 * height as u64;
    }
}

/// Result of one transcode call: the decoded input plus one entry per
/// requested output, in request order.
#[derive(Clone, Debug, Default)]
pub struct TranscodeResults {
    pub decoded: MediaInfo,
    pub encoded: Vec<MediaInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_accumulation_tracks_frame_dimensions() {
        let mut info = MediaInfo::default();
        info.add_frame(426, 240);
        info.add_frame(426, 240);
        info.add_frame(1280, 720);
        assert_eq!(info.frames, 3);
        assert_eq!(info.pixels, 2 * 426 * 240 + 1280 * 720);
    }

    #[test]
    fn encoded_pixels_equal_frames_times_adjusted_dims() {
        // The invariant the encode side maintains: constant dimensions per
        // output mean pixels factor exactly.
        let mut info = MediaInfo::default();
        for _ in 0..44 {
            info.add_frame(64, 240);
        }
        assert_eq!(info.pixels, info.frames * 64 * 240);
    }
}
