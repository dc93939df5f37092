//! Centralized error handling for matpar.
//!
//! All failure conditions are propagated through the [`Result`] type; the
//! library never panics on malformed input. Errors are grouped by the domain
//! that produced them:
//!
//! - **I/O Errors** ([`MatError::Io`]): low-level file system operations
//! - **Format Errors** ([`MatError::Format`]): malformed or unsupported bytes
//! - **Bounds Errors** ([`MatError::Bounds`]): dimension/index mismatches on
//!   construction or access — a caller bug, failed immediately
//! - **Resource Errors** ([`MatError::Resource`]): allocator exhaustion or a
//!   buffer released twice, surfaced with the offending buffer identity
//! - **Pipeline Errors** ([`MatError::Pipeline`]): a concurrent task failed;
//!   wraps the first underlying error, collected after every scratch buffer
//!   has been drained
//!
//! Parsing never guesses past unrecognized data: an unknown element kind, a
//! bad magic/version field, a non-zero reserved field or a truncated
//! compressed stream all fail the current parse with [`MatError::Format`].
//!
//! The error type is `Clone` so worker threads can capture a failure while
//! the original propagates to the caller. I/O errors are wrapped in `Arc`
//! to keep cloning cheap.

use std::fmt;
use std::io;
use std::sync::Arc;

/// A specialized `Result` type for matpar operations.
pub type Result<T> = std::result::Result<T, MatError>;

/// The master error enum covering all failure domains in matpar.
#[derive(Debug, Clone)]
pub enum MatError {
    /// Low-level I/O failure (disk full, permissions, truncated file, etc.).
    ///
    /// The underlying `io::Error` is wrapped in an `Arc` to make the error
    /// `Clone`, allowing it to cross thread boundaries in the pipeline.
    Io(Arc<io::Error>),

    /// The byte stream is malformed or unsupported.
    ///
    /// Covers wrong header magic, unsupported versions, unknown element
    /// kinds or class ids, non-zero reserved fields, broken segment
    /// boundaries and corrupt compressed streams. Always fatal to the
    /// current parse.
    Format(String),

    /// Index or dimension mismatch on construction or access.
    ///
    /// Raised when dimensions do not match a payload length, an index is out
    /// of range, or a value cannot be represented in the requested text
    /// encoding. Indicates a caller bug rather than bad input bytes.
    Bounds(String),

    /// Scratch-buffer lifecycle violation.
    ///
    /// Raised on allocator exhaustion or when a buffer is released twice.
    /// The message carries the identity of the offending buffer.
    Resource(String),

    /// A concurrent codec task failed.
    ///
    /// Wraps the first underlying error observed by the pipeline. Emitted
    /// only after all pending tasks have been drained and their buffers
    /// returned to the allocator.
    Pipeline(Box<MatError>),
}

impl MatError {
    /// Shorthand for a [`MatError::Format`] with a formatted message.
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    /// Shorthand for a [`MatError::Bounds`] with a formatted message.
    pub fn bounds(msg: impl Into<String>) -> Self {
        Self::Bounds(msg.into())
    }

    /// Wraps this error as the root cause of a pipeline failure.
    ///
    /// Already-wrapped pipeline errors are passed through unchanged so the
    /// innermost cause is reported exactly once.
    pub fn into_pipeline(self) -> Self {
        match self {
            Self::Pipeline(_) => self,
            other => Self::Pipeline(Box::new(other)),
        }
    }
}

impl fmt::Display for MatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O Error: {e}"),
            Self::Format(s) => write!(f, "Format Error: {s}"),
            Self::Bounds(s) => write!(f, "Bounds Error: {s}"),
            Self::Resource(s) => write!(f, "Resource Error: {s}"),
            Self::Pipeline(e) => write!(f, "Pipeline Error: {e}"),
        }
    }
}

impl std::error::Error for MatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e.as_ref()),
            Self::Pipeline(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for MatError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn pipeline_wrap_is_idempotent() {
        let inner = MatError::format("bad tag");
        let wrapped = inner.into_pipeline();
        let rewrapped = wrapped.clone().into_pipeline();
        match (&wrapped, &rewrapped) {
            (MatError::Pipeline(a), MatError::Pipeline(b)) => {
                assert!(matches!(a.as_ref(), MatError::Format(_)));
                assert!(matches!(b.as_ref(), MatError::Format(_)));
            }
            _ => panic!("expected pipeline variants"),
        }
    }

    #[test]
    fn io_errors_preserve_source() {
        let err = MatError::from(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(err.source().is_some());
        let _cloned = err.clone();
    }
}
