//! Error types for Dike core operations.

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Dike core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An image string could not be parsed.
    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidReference {
        /// The image string that failed to parse.
        reference: String,
        /// Reason the string is invalid.
        reason: String,
    },

    /// A policy document is structurally invalid.
    #[error("Invalid policy: {reason}")]
    InvalidPolicy {
        /// Reason the policy is invalid.
        reason: String,
    },

    /// A signed envelope is malformed.
    #[error("Invalid envelope: {reason}")]
    InvalidEnvelope {
        /// Reason the envelope is invalid.
        reason: String,
    },

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML deserialization error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

impl Error {
    /// Creates an [`Error::InvalidReference`] for the given image string.
    pub fn invalid_reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_reference_display() {
        let err = Error::invalid_reference("!!bad!!", "repository contains invalid characters");
        assert_eq!(
            err.to_string(),
            "Invalid image reference '!!bad!!': repository contains invalid characters"
        );
    }

    #[test]
    fn test_invalid_policy_display() {
        let err = Error::InvalidPolicy {
            reason: "duplicate attestor name 'keyed'".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid policy: duplicate attestor name 'keyed'");
    }
}
