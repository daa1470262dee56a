//! Error types for policy compilation and evaluation.

use thiserror::Error;

/// Result type alias for policy operations.
pub type Result<T> = std::result::Result<T, PolicyError>;

/// Errors from compiling or evaluating a policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A policy expression or declaration failed to compile.
    #[error("Policy '{policy}' failed to compile at {path}: {message}")]
    CompileError {
        /// The policy name.
        policy: String,
        /// Field path of the offending declaration.
        path: String,
        /// Parser or validation message.
        message: String,
    },

    /// A runtime failure during evaluation, distinct from a validation
    /// saying no.
    #[error("Policy '{policy}' could not be evaluated: {message}")]
    EvaluationError {
        /// The policy name.
        policy: String,
        /// What went wrong.
        message: String,
    },

    /// Registry access failed during image prefetch.
    #[error(transparent)]
    Registry(#[from] dike_registry::RegistryError),
}
