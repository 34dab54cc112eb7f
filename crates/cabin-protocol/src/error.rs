//! Boundary validation errors

use cabin_artifact::{HashError, LabelError};

/// Errors raised when an engine, preflight or approval message fails
/// structural validation
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// A required field is empty
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A field holds a value outside its allowed set
    #[error("unknown {field}: {value:?}")]
    UnknownValue { field: &'static str, value: String },

    /// Engine output was produced for the other mode
    #[error("mode mismatch: expected {expected}, got {actual}")]
    ModeMismatch { expected: String, actual: String },

    /// Engine reported failure where success was required
    #[error("engine reported failure: {0}")]
    EngineFailed(String),

    /// Engine speaks a protocol version we do not
    #[error("unsupported protocol version {actual} (expected {expected})")]
    ProtocolVersion { expected: String, actual: String },

    /// Output names the same artifact twice
    #[error("duplicate artifact name: {0}")]
    DuplicateArtifact(String),

    /// Malformed label or identifier
    #[error(transparent)]
    Label(#[from] LabelError),

    /// Malformed hash
    #[error(transparent)]
    Hash(#[from] HashError),
}
