//! Error taxonomy for the decode pipeline.
//!
//! Two layers of errors exist:
//!
//! - [`CodecError`] is the status vocabulary of the hardware boundary. Its
//!   transient members (`WouldBlock`, `FormatChanged`) are absorbed inside
//!   the pipeline and never reach callers.
//! - [`DecodeError`] is what the public futures reject with.

use std::fmt;

/// Result alias used throughout the hardware boundary.
pub type CodecStatus<T> = Result<T, CodecError>;

/// Status codes reported by a hardware codec backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// No buffer became available within the timeout. Not an error; retry
    /// after the next activity notification.
    WouldBlock,
    /// The output format changed. The caller must re-query the format and
    /// retry the same call.
    FormatChanged,
    /// The codec has not been allocated, or has already been released.
    NotInitialized,
    /// Unrecoverable hardware failure.
    Fatal(String),
}

impl CodecError {
    /// Returns true for statuses that are retried internally and must never
    /// surface as pipeline errors.
    pub fn is_transient(&self) -> bool {
        matches!(self, CodecError::WouldBlock | CodecError::FormatChanged)
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::WouldBlock => write!(f, "no buffer available, try again"),
            CodecError::FormatChanged => write!(f, "output format changed"),
            CodecError::NotInitialized => write!(f, "codec is not initialized"),
            CodecError::Fatal(msg) => write!(f, "codec failure: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors surfaced through the pipeline's public futures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The resource broker denied the codec reservation. Surfaced once at
    /// `init()`; the caller decides whether to retry with a fresh pipeline.
    ReservationDenied,
    /// The operation is not legal in the pipeline's current state.
    InvalidState(&'static str),
    /// Input was submitted after a drain started. A flush restores input.
    EndOfStream,
    /// Unrecoverable decode failure; the pipeline is shutting down.
    Fatal(String),
    /// The pipeline was shut down while the operation was pending.
    Cancelled,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::ReservationDenied => write!(f, "hardware decoder resource denied"),
            DecodeError::InvalidState(what) => write!(f, "invalid state: {what}"),
            DecodeError::EndOfStream => write!(f, "input not accepted after drain"),
            DecodeError::Fatal(msg) => write!(f, "decode failed: {msg}"),
            DecodeError::Cancelled => write!(f, "operation cancelled by shutdown"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<CodecError> for DecodeError {
    /// Maps a non-transient codec status to a pipeline error. Transient
    /// statuses must be handled before conversion; converting one is a bug
    /// in the pipeline, so it is folded into `Fatal` rather than panicking.
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::NotInitialized => DecodeError::InvalidState("codec not initialized"),
            other => DecodeError::Fatal(other.to_string()),
        }
    }
}
