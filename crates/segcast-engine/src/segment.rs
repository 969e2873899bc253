// crates/segcast-engine/src/segment.rs
//
// RTMP-to-HLS segmenter: a packet-level pipeline that never touches a
// codec. Input streams are reordered so the segments carry video at index
// 0 and audio at index 1 (subtitles and data streams are dropped), and
// late video packets are rejected before they reach the muxer.
//
// Segment rotation belongs to the runtime's hls muxer: `hls_time` cuts a
// new segment at the first key frame on or after each cumulative multiple
// of the target duration, `hls_segment_filename` names the segment files,
// and `delete_segments` keeps a bounded rolling window on disk while the
// muxer maintains the playlist (#EXTINF entries, media sequence, stale
// file removal).

use ffmpeg_the_third as ffmpeg;
use ffmpeg::media::Type as MediaType;
use ffmpeg::Rational;
use tracing::{debug, warn};

use segcast_core::error::EngineError;

use crate::decode::{output_stream_index, StreamKind};
use crate::encode::add_copy_stream;
use crate::gateway::{self, classify, Stage};

/// Option dictionary for the hls muxer, forwarded verbatim. A zero
/// `max_segments` leaves the muxer's own playlist size in place (five
/// entries, so about six segment files on disk counting the one being
/// written).
fn hls_options(
    segment_template: &str,
    seg_secs: f64,
    max_segments: usize,
) -> ffmpeg::Dictionary<'static> {
    let mut opts = ffmpeg::Dictionary::new();
    opts.set("hls_time", &seg_secs.to_string());
    opts.set("hls_segment_filename", segment_template);
    opts.set("hls_flags", "+delete_segments");
    if max_segments > 0 {
        opts.set("hls_list_size", &max_segments.to_string());
    }
    opts
}

/// Segment a live RTMP (or file) input into a rolling HLS playlist.
/// `segment_template` names the segment files (`seg_%d.ts`);
/// `max_segments` bounds the live window (0 selects the muxer default).
pub fn rtmp_to_hls(
    input_url: &str,
    playlist: &str,
    segment_template: &str,
    seg_secs: f64,
    max_segments: usize,
) -> Result<(), EngineError> {
    gateway::init()?;
    if input_url.is_empty() {
        return Err(EngineError::EmptyData);
    }
    if seg_secs <= 0.0 {
        return Err(EngineError::InvalidArgument(format!(
            "segment duration {seg_secs}"
        )));
    }

    let mut ictx =
        ffmpeg::format::input(&input_url).map_err(|e| classify(e, Stage::DemuxOpen))?;

    let vi = ictx.streams().best(MediaType::Video).map(|s| s.index());
    let ai = ictx.streams().best(MediaType::Audio).map(|s| s.index());
    if vi.is_none() && ai.is_none() {
        return Err(EngineError::FormatNotFound(format!(
            "no audio or video streams in '{input_url}'"
        )));
    }
    let has_video = vi.is_some();

    let video_tb = vi
        .and_then(|i| ictx.stream(i))
        .map(|s| s.time_base())
        .unwrap_or_else(|| Rational::new(1, 90_000));
    let audio_tb = ai
        .and_then(|i| ictx.stream(i))
        .map(|s| s.time_base())
        .unwrap_or_else(|| Rational::new(1, 90_000));

    let mut octx =
        ffmpeg::format::output_as(&playlist, "hls").map_err(|e| classify(e, Stage::MuxOpen))?;

    // Video first so the segments always carry it at stream index 0.
    if let Some(params) = vi.and_then(|i| ictx.stream(i)).map(|s| s.parameters()) {
        add_copy_stream(&mut octx, params)?;
    }
    if let Some(params) = ai.and_then(|i| ictx.stream(i)).map(|s| s.parameters()) {
        add_copy_stream(&mut octx, params)?;
    }

    octx.write_header_with(hls_options(segment_template, seg_secs, max_segments))
        .map_err(|e| classify(e, Stage::MuxOpen))?;

    let video_ost_tb = octx
        .stream(output_stream_index(StreamKind::Video, has_video))
        .map(|s| s.time_base())
        .unwrap_or_else(|| Rational::new(1, 90_000));
    let audio_ost_tb = octx
        .stream(output_stream_index(StreamKind::Audio, has_video))
        .map(|s| s.time_base())
        .unwrap_or_else(|| Rational::new(1, 90_000));

    let mut last_video_dts: Option<i64> = None;
    let mut forwarded: u64 = 0;

    loop {
        let (index, mut pkt) = match ictx.packets().next() {
            None => break,
            Some(Err(ffmpeg::Error::Eof)) => break,
            Some(Err(e)) => return Err(classify(e, Stage::Demux)),
            Some(Ok((stream, pkt))) => (stream.index(), pkt),
        };

        let kind = if Some(index) == vi {
            StreamKind::Video
        } else if Some(index) == ai {
            StreamKind::Audio
        } else {
            continue;
        };

        if kind == StreamKind::Video {
            if let (Some(dts), Some(prev)) = (pkt.dts(), last_video_dts) {
                if dts < prev {
                    warn!(dts, prev, "dropping late video packet");
                    continue;
                }
            }
            if let Some(dts) = pkt.dts() {
                last_video_dts = Some(dts);
            }
        }

        let (in_tb, ost_tb) = match kind {
            StreamKind::Video => (video_tb, video_ost_tb),
            StreamKind::Audio => (audio_tb, audio_ost_tb),
        };
        pkt.set_stream(output_stream_index(kind, has_video));
        pkt.rescale_ts(in_tb, ost_tb);
        pkt.write_interleaved(&mut octx)
            .map_err(|e| classify(e, Stage::Mux))?;
        forwarded += 1;
    }

    octx.write_trailer().map_err(|e| classify(e, Stage::Mux))?;
    debug!(playlist, forwarded, "segmenting finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hls_options_forward_the_rolling_window() {
        let opts = hls_options("out_%d.ts", 1.0, 0);
        assert_eq!(opts.get("hls_time"), Some("1"));
        assert_eq!(opts.get("hls_segment_filename"), Some("out_%d.ts"));
        assert_eq!(opts.get("hls_flags"), Some("+delete_segments"));
        // The muxer default playlist size stays in effect.
        assert_eq!(opts.get("hls_list_size"), None);
    }

    #[test]
    fn explicit_window_sets_the_playlist_size() {
        let opts = hls_options("seg_%d.ts", 2.5, 8);
        assert_eq!(opts.get("hls_time"), Some("2.5"));
        assert_eq!(opts.get("hls_list_size"), Some("8"));
    }
}
