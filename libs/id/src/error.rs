//! Error types for name and ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing or validating names and IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("value cannot be empty")]
    Empty,

    /// The name exceeds the maximum length.
    #[error("value is {actual} bytes long, maximum is {max}")]
    TooLong { max: usize, actual: usize },

    /// The name contains a character that is not allowed.
    #[error("invalid character {ch:?} at byte {position}")]
    InvalidCharacter { ch: char, position: usize },

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}
