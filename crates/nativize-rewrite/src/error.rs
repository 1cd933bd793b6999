//! Rewrite error types.

use nativize_model::ModelError;

/// Errors that abort a rewrite run.
///
/// None of these are recoverable per method: a failing run produces no
/// output module.
#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    /// A referenced type has no definition in the module or its references.
    #[error("unresolved type: {type_name} (the assembly defining it was not loaded)")]
    UnresolvedType { type_name: String },

    /// A parameter or return slot of an import stub has no marshalling plan.
    #[error("unsupported signature in {method}: {ty} ({reason})")]
    UnsupportedSignature {
        method: String,
        ty: String,
        reason: String,
    },

    /// The declared calling convention has no indirect-call mapping.
    #[error("unknown calling convention {convention} on {method}")]
    UnknownCallingConvention { method: String, convention: String },

    /// A stub names a library that no loader was planned for.
    #[error("no library loader planned for {library} (needed by {method})")]
    MissingLibrary { method: String, library: String },

    /// The module already defines a type with the helper type's name.
    #[error("helper type {name} already exists but import stubs remain to be rewritten")]
    HelperTypeConflict { name: String },

    /// Building a generated body or member failed.
    #[error("failed to emit {context}: {source}")]
    Emit {
        context: String,
        #[source]
        source: ModelError,
    },

    /// Invalid rewrite configuration.
    #[error("invalid configuration: {detail}")]
    Config { detail: String },

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RewriteError {
    pub(crate) fn emit(context: impl Into<String>, source: ModelError) -> Self {
        RewriteError::Emit {
            context: context.into(),
            source,
        }
    }
}

/// Result type alias for rewrite operations.
pub type Result<T> = std::result::Result<T, RewriteError>;
