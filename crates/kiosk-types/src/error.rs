//! Error types for parsing in kiosk-types.

use thiserror::Error;

/// Errors that can occur when parsing kiosk values from their string form.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The string does not name a known variant.
    #[error("Unknown {kind}: '{value}'")]
    UnknownVariant {
        /// The kind of value being parsed (e.g. "session status").
        kind: &'static str,
        /// The rejected input.
        value: String,
    },
}

impl ParseError {
    pub(crate) fn unknown(kind: &'static str, value: &str) -> Self {
        Self::UnknownVariant {
            kind,
            value: value.to_string(),
        }
    }
}

/// Result type alias using kiosk-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
