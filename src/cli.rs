// src/cli.rs
//
// Argument parsing for the segcast binary. One input path followed by one
// profile string per requested rendition; outputs land in the current
// directory as out<i><basename>.

use std::path::Path;

use anyhow::{anyhow, bail, Result};

use segcast_core::options::OutputSpec;
use segcast_core::profile::{parse_resolution, VideoProfile};

pub const USAGE: &str = "usage: segcast <inputPath> <w>x<h>,<bitrate>,<fps> [<w>x<h>,<bitrate>,<fps> ...]
example: segcast in.ts 426x240,600k,30 1280x720,2000k,30";

pub struct Job {
    pub input: String,
    pub outputs: Vec<OutputSpec>,
}

pub fn parse(args: &[String]) -> Result<Job> {
    let (input, profiles) = args
        .split_first()
        .ok_or_else(|| anyhow!("missing input path"))?;
    if profiles.is_empty() {
        bail!("at least one output profile is required");
    }

    let basename = Path::new(input)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("input '{input}' has no file name"))?;

    let mut outputs = Vec::with_capacity(profiles.len());
    for (i, spec) in profiles.iter().enumerate() {
        let profile = parse_profile(spec)?;
        outputs.push(OutputSpec::new(&format!("out{i}{basename}"), profile));
    }

    Ok(Job {
        input: input.clone(),
        outputs,
    })
}

/// Parse `"426x240,600k,30"` into a profile.
fn parse_profile(s: &str) -> Result<VideoProfile> {
    let parts: Vec<&str> = s.split(',').collect();
    let [res, bitrate, fps] = parts.as_slice() else {
        bail!("profile '{s}' is not <w>x<h>,<bitrate>,<fps>");
    };
    let (width, height) =
        parse_resolution(res).map_err(|_| anyhow!("bad resolution in '{s}'"))?;
    let bitrate = parse_bitrate(bitrate).ok_or_else(|| anyhow!("bad bitrate in '{s}'"))?;
    let fps: i32 = fps
        .trim()
        .parse()
        .map_err(|_| anyhow!("bad frame rate in '{s}'"))?;
    if fps <= 0 {
        bail!("bad frame rate in '{s}'");
    }
    Ok(VideoProfile::new(s, width, height, bitrate, fps))
}

/// Bitrate in bps; a `k` or `m` suffix scales accordingly.
fn parse_bitrate(s: &str) -> Option<u32> {
    let s = s.trim();
    let (digits, scale) = match s.as_bytes().last()? {
        b'k' | b'K' => (&s[..s.len() - 1], 1_000),
        b'm' | b'M' => (&s[..s.len() - 1], 1_000_000),
        _ => (s, 1),
    };
    digits.parse::<u32>().ok().map(|v| v.saturating_mul(scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_input_and_profiles() {
        let job = parse(&strings(&["test.ts", "426x240,600k,30", "1280x720,2000k,30"])).unwrap();
        assert_eq!(job.input, "test.ts");
        assert_eq!(job.outputs.len(), 2);
        assert_eq!(job.outputs[0].path, "out0test.ts");
        assert_eq!(job.outputs[1].path, "out1test.ts");
        assert_eq!(job.outputs[0].profile.width, 426);
        assert_eq!(job.outputs[0].profile.bitrate, 600_000);
        assert_eq!(job.outputs[1].profile.fps_num, 30);
    }

    #[test]
    fn output_names_use_the_basename_only() {
        let job = parse(&strings(&["/media/in/test.ts", "426x240,600k,30"])).unwrap();
        assert_eq!(job.outputs[0].path, "out0test.ts");
    }

    #[test]
    fn bitrate_suffixes() {
        assert_eq!(parse_bitrate("600k"), Some(600_000));
        assert_eq!(parse_bitrate("600000"), Some(600_000));
        assert_eq!(parse_bitrate("2M"), Some(2_000_000));
        assert_eq!(parse_bitrate("bogus"), None);
    }

    #[test]
    fn rejects_malformed_invocations() {
        assert!(parse(&strings(&[])).is_err());
        assert!(parse(&strings(&["in.ts"])).is_err());
        assert!(parse(&strings(&["in.ts", "426x240"])).is_err());
        assert!(parse(&strings(&["in.ts", "426x240,600k,0"])).is_err());
        assert!(parse(&strings(&["in.ts", "0x240,600k,30"])).is_err());
    }
}
