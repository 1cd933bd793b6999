//! Model and emitter error types.

use thiserror::Error;

/// Errors raised while building method bodies or mutating a module.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("label {label} is referenced but never marked")]
    UnmarkedLabel { label: u32 },

    #[error("label {label} is marked more than once")]
    LabelMarkedTwice { label: u32 },

    #[error("protected region misuse: {detail}")]
    UnbalancedRegion { detail: String },

    #[error("evaluation stack underflow at instruction {at}")]
    StackUnderflow { at: usize },

    #[error("type {0} not found in module")]
    TypeNotFound(String),

    #[error("duplicate {kind} '{name}' in type {owner}")]
    DuplicateMember {
        kind: &'static str,
        owner: String,
        name: String,
    },
}

/// Result type alias for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;
