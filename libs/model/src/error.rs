//! Error types for model parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating model values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The path string is empty.
    #[error("machine path cannot be empty")]
    EmptyPath,

    /// The path does not start with `/`.
    #[error("machine path must be absolute, got '{0}'")]
    RelativePath(String),

    /// The path has an empty segment (`//` or a trailing `/`).
    #[error("machine path '{0}' contains an empty segment")]
    EmptySegment(String),

    /// The path names only a datacenter, not a machine inside it.
    #[error("machine path '{0}' must contain a datacenter and a machine name")]
    TooShort(String),

    /// A path segment contains a character the inventory cannot hold.
    #[error("machine path segment '{segment}' contains invalid character {ch:?}")]
    InvalidCharacter { segment: String, ch: char },

    /// An enum value could not be parsed.
    #[error("invalid {kind} value '{value}', expected one of: {expected}")]
    InvalidValue {
        kind: &'static str,
        value: String,
        expected: &'static str,
    },
}

impl ModelError {
    /// Returns true if this error is about the shape of a machine path.
    pub fn is_path_error(&self) -> bool {
        !matches!(self, ModelError::InvalidValue { .. })
    }
}
