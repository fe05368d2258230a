//! Render pipeline error types

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while resolving, extracting or rendering an artifact
///
/// Validation errors are terminal for a request; only [`RenderError::is_retryable`]
/// variants are retried by the scheduler.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Source recording does not exist
    #[error("Source file not found: {0}")]
    MissingSourceFile(PathBuf),

    /// Source recording exists but has zero length
    #[error("Source file is empty: {0}")]
    EmptySourceFile(PathBuf),

    /// Source recording could not be decoded
    #[error("Failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// Per-file call metadata is missing or malformed
    #[error("Corrupt call metadata for {path}: {reason}")]
    CorruptSegmentMetadata { path: PathBuf, reason: String },

    /// Requested call index is past the end of the metadata arrays
    #[error("Call index {index} out of range ({len} calls)")]
    IndexOutOfRange { index: usize, len: usize },

    /// Call onset/offset falls outside the decoded buffer
    #[error("Call boundary invalid: onset={onset}, offset={offset}, buffer length={len}")]
    BoundaryInvalid { onset: i64, offset: i64, len: usize },

    /// Requested channel does not exist in the source
    #[error("Channel {channel} out of range ({channels} channels)")]
    ChannelOutOfRange { channel: usize, channels: usize },

    /// Caller's content hash does not match the file on disk
    #[error("Content hash mismatch: expected {expected}, found {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Compute or encode fault inside the render engine
    #[error("Render failed: {0}")]
    RenderFailure(String),

    /// A retryable error persisted through every attempt
    #[error("Render failed after {attempts} attempts: {last_error}")]
    TaskRetriesExhausted { attempts: u32, last_error: String },

    /// Requested call index is the end of the sequence (every call processed)
    #[error("End of sequence: all {total_calls} calls processed")]
    EndOfSequence { total_calls: usize },

    /// Required wire parameter is absent
    #[error("Missing parameter: {0}")]
    MissingParameter(&'static str),

    /// Wire parameter present but unparsable
    #[error("Invalid value for {name}: {value:?}")]
    InvalidParameter { name: &'static str, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    /// Whether a fresh attempt could plausibly succeed
    ///
    /// Parameter and source problems never fix themselves, so only
    /// compute and I/O faults are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RenderFailure(_) | Self::Io(_))
    }

    /// Short machine-readable name, used in logs and events
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingSourceFile(_) => "MissingSourceFile",
            Self::EmptySourceFile(_) => "EmptySourceFile",
            Self::Decode { .. } => "Decode",
            Self::CorruptSegmentMetadata { .. } => "CorruptSegmentMetadata",
            Self::IndexOutOfRange { .. } => "IndexOutOfRange",
            Self::BoundaryInvalid { .. } => "BoundaryInvalid",
            Self::ChannelOutOfRange { .. } => "ChannelOutOfRange",
            Self::HashMismatch { .. } => "HashMismatch",
            Self::RenderFailure(_) => "RenderFailure",
            Self::TaskRetriesExhausted { .. } => "TaskRetriesExhausted",
            Self::EndOfSequence { .. } => "EndOfSequence",
            Self::MissingParameter(_) => "MissingParameter",
            Self::InvalidParameter { .. } => "InvalidParameter",
            Self::Io(_) => "Io",
        }
    }
}

/// Result type for render operations
pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(RenderError::RenderFailure("fft".into()).is_retryable());
        assert!(RenderError::Io(std::io::Error::other("disk")).is_retryable());

        assert!(!RenderError::HashMismatch {
            expected: "a".into(),
            actual: "b".into(),
        }
        .is_retryable());
        assert!(!RenderError::ChannelOutOfRange { channel: 4, channels: 3 }.is_retryable());
        assert!(!RenderError::MissingSourceFile(PathBuf::from("/x.wav")).is_retryable());
        assert!(!RenderError::TaskRetriesExhausted {
            attempts: 3,
            last_error: "boom".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = RenderError::IndexOutOfRange { index: 7, len: 5 };
        assert_eq!(err.to_string(), "Call index 7 out of range (5 calls)");
        assert_eq!(err.kind(), "IndexOutOfRange");
    }
}
