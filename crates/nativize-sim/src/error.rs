//! Simulator error types.

use thiserror::Error;

/// Failures that stop the simulated process.
///
/// Managed exceptions that escape the called method are reported as
/// [`SimError::Unhandled`]; every other variant is a fault the runtime
/// itself could not recover from (malformed code, a wild native access).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimError {
    #[error("unhandled {class}: {message}")]
    Unhandled { class: String, message: String },

    #[error("method not found: {0}")]
    MissingMethod(String),

    #[error("method {0} has no body")]
    MissingBody(String),

    #[error("static field not found: {0}")]
    MissingField(String),

    #[error("type mismatch at {method}+{pc}: expected {expected}, found {found}")]
    TypeMismatch {
        method: String,
        pc: usize,
        expected: &'static str,
        found: String,
    },

    #[error("evaluation stack underflow at {method}+{pc}")]
    StackUnderflow { method: String, pc: usize },

    #[error("branch to unknown label in {0}")]
    BadLabel(String),

    #[error("invalid native address {0:#x}")]
    InvalidAddress(u64),

    #[error("double free of native block {0:#x}")]
    DoubleFree(u64),

    #[error("free of unknown native block {0:#x}")]
    InvalidFree(u64),

    #[error("native fault: {0}")]
    Native(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("type initializer for {type_name} failed: {source}")]
    TypeInitializer {
        type_name: String,
        #[source]
        source: Box<SimError>,
    },
}

impl SimError {
    /// Message of an unhandled managed exception, if this is one.
    pub fn exception_message(&self) -> Option<&str> {
        match self {
            SimError::Unhandled { message, .. } => Some(message),
            _ => None,
        }
    }
}

/// Result type alias for simulator operations.
pub type Result<T> = std::result::Result<T, SimError>;
