// crates/segcast-core/src/error.rs
//
// Error taxonomy for the whole engine. Media-runtime failures are classified
// into these kinds once, at the gateway boundary; everything above the
// gateway works in terms of `EngineError` only.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Input path or payload was empty.
    #[error("empty input data")]
    EmptyData,

    /// The source bitstream is incompatible with the requested operation
    /// (matches the runtime's wording so callers can string-match either).
    #[error("Invalid data found when processing input")]
    InvalidData,

    /// A requested encoder or decoder does not exist in this build.
    #[error("codec not found: {0}")]
    CodecNotFound(String),

    /// The demuxer could not recognise the input, or no usable stream
    /// was discovered after opening it.
    #[error("format not found: {0}")]
    FormatNotFound(String),

    #[error("muxer failure: {0}")]
    MuxerFailure(String),

    #[error("demuxer failure: {0}")]
    DemuxerFailure(String),

    #[error("hardware encoder initialisation failed")]
    HwEncoderInitFailure,

    /// Caller error: contradictory or missing parameters (all streams
    /// dropped, missing output resolution, malformed profile string, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("filter setup failed: {0}")]
    FilterFailure(String),

    /// The call was cancelled cooperatively; outputs were flushed and
    /// closed but must be considered incomplete.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Unclassified media-runtime failure.
    #[error("{0}")]
    Runtime(String),
}

impl EngineError {
    /// Stable process exit code for the CLI. Kinds without a dedicated
    /// code collapse into the generic bucket (8).
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::EmptyData => 1,
            EngineError::InvalidData => 2,
            EngineError::CodecNotFound(_) => 3,
            EngineError::FormatNotFound(_) => 4,
            EngineError::MuxerFailure(_) => 5,
            EngineError::DemuxerFailure(_) => 6,
            EngineError::HwEncoderInitFailure => 7,
            _ => 8,
        }
    }

    /// True for failures that abort a single output but not the whole call.
    pub fn is_output_scoped(&self) -> bool {
        matches!(
            self,
            EngineError::MuxerFailure(_)
                | EngineError::CodecNotFound(_)
                | EngineError::FilterFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(EngineError::EmptyData.exit_code(), 1);
        assert_eq!(EngineError::InvalidData.exit_code(), 2);
        assert_eq!(EngineError::CodecNotFound("snow".into()).exit_code(), 3);
        assert_eq!(EngineError::FormatNotFound("nope".into()).exit_code(), 4);
        assert_eq!(EngineError::MuxerFailure("x".into()).exit_code(), 5);
        assert_eq!(EngineError::DemuxerFailure("x".into()).exit_code(), 6);
        assert_eq!(EngineError::HwEncoderInitFailure.exit_code(), 7);
        assert_eq!(EngineError::Cancelled.exit_code(), 8);
        assert_eq!(EngineError::InvalidArgument("both streams dropped".into()).exit_code(), 8);
    }

    #[test]
    fn invalid_data_matches_runtime_wording() {
        let msg = EngineError::InvalidData.to_string();
        assert_eq!(msg, "Invalid data found when processing input");
    }
}
