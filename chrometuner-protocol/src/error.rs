//! Error types for the chrometuner lineup and discovery surface.

use thiserror::Error;

/// Errors raised while building or validating a channel lineup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A channel was declared without a key.
    #[error("Channel #{0} has an empty key")]
    EmptyKey(usize),

    /// Two channels share the same key.
    #[error("Duplicate channel key: {0}")]
    DuplicateKey(String),

    /// Two channels share the same guide number.
    #[error("Duplicate guide number {number} (channels '{first}' and '{second}')")]
    DuplicateNumber {
        number: String,
        first: String,
        second: String,
    },

    /// A channel is missing a field required for streaming.
    #[error("Invalid channel '{key}': {reason}")]
    InvalidChannel { key: String, reason: String },
}
