//! Error types for payload decoding in mijia-types.

use thiserror::Error;

/// Errors that can occur when decoding Mijia sensor payloads.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in mijia-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Payload is shorter than the wire format requires.
    #[error("insufficient payload: expected {expected} bytes, got {actual}")]
    InsufficientBytes {
        /// Minimum number of bytes the format requires.
        expected: usize,
        /// Number of bytes actually received.
        actual: usize,
    },

    /// ASCII payload did not match the expected pattern.
    #[error("unexpected payload format: {0}")]
    PatternMismatch(String),

    /// A field decoded to a value the format cannot represent.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using mijia-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
