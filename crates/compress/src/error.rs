//! Errors raised while encoding or decoding chunk frames.

use derive_more::{Display, Error};

/// A frame codec error, carrying the location it was raised at.
pub type Error = exn::Exn<ErrorKind>;
/// Result of a frame codec operation.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The codec could not be set up.
    Encoder,
    /// Frame is corrupt or malformed. Don't retry with the same input.
    #[display("invalid or corrupted frame")]
    InvalidData,
    /// Frame decompressed to a different length than the chunk recorded.
    #[display("frame length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    /// No codec exists for this format name.
    #[display("unsupported format: {_0}")]
    UnsupportedFormat(#[error(not(source))] String),
    /// The codec exists but this build leaves it out.
    #[display("disabled format: {_0}")]
    DisabledFormat(#[error(not(source))] String),
    /// An I/O operation failed while encoding.
    #[display("I/O error")]
    Io,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exn::ResultExt;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::InvalidData.to_string(), "invalid or corrupted frame");
        assert_eq!(
            ErrorKind::LengthMismatch { expected: 3, actual: 2 }.to_string(),
            "frame length mismatch: expected 3 bytes, got 2"
        );
        assert_eq!(ErrorKind::UnsupportedFormat("lz4".to_string()).to_string(), "unsupported format: lz4");
    }

    #[test]
    fn test_only_io_is_retryable() {
        assert!(!ErrorKind::InvalidData.is_retryable());
        assert!(!ErrorKind::LengthMismatch { expected: 1, actual: 0 }.is_retryable());
        assert!(ErrorKind::Io.is_retryable());
    }

    #[test]
    fn error_from_result() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "truncated"));
        let err: Result<()> = result.or_raise(|| ErrorKind::InvalidData);
        assert_eq!(*err.unwrap_err(), ErrorKind::InvalidData);
    }
}
