//! Error types for registry operations.

use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The image string could not be parsed.
    #[error(transparent)]
    InvalidReference(#[from] dike_core::Error),

    /// Failed to connect to a registry.
    #[error("Failed to connect to registry at {url}: {source}")]
    ConnectionFailed {
        /// Registry URL.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// HTTP error from a registry.
    #[error("HTTP error from registry: {status} - {message}")]
    HttpError {
        /// HTTP status code.
        status: u16,
        /// Error message.
        message: String,
    },

    /// Image or manifest not found.
    #[error("Image not found: {image}")]
    NotFound {
        /// The image reference.
        image: String,
    },

    /// Authentication or credential resolution failed.
    #[error("Authentication failed for {registry}: {message}")]
    AuthenticationFailed {
        /// Registry host.
        registry: String,
        /// Error message.
        message: String,
    },

    /// A pull secret could not be used.
    #[error("Pull secret '{name}' is unusable: {message}")]
    SecretError {
        /// Secret name.
        name: String,
        /// Error message.
        message: String,
    },

    /// A fetched manifest or index could not be decoded.
    #[error("Invalid manifest for {image}: {message}")]
    InvalidManifest {
        /// The image reference.
        image: String,
        /// Error message.
        message: String,
    },

    /// A referrer payload exceeded the configured size cap.
    #[error("Referrer blob {digest} is {size} bytes, exceeding the {limit} byte limit")]
    ReferrerTooLarge {
        /// Blob digest.
        digest: String,
        /// Actual size.
        size: u64,
        /// Configured limit.
        limit: u64,
    },

    /// The referrers index exceeded the configured entry cap.
    #[error("Referrers index for {image} has {count} entries, exceeding the limit of {limit}")]
    TooManyReferrers {
        /// The image reference.
        image: String,
        /// Actual entry count.
        count: usize,
        /// Configured limit.
        limit: usize,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {source}")]
    JsonError {
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::ConnectionFailed {
                url: err
                    .url()
                    .map_or_else(|| "unknown".to_string(), ToString::to_string),
                source: err,
            }
        } else {
            let status = err.status().map_or(0, |s| s.as_u16());
            Self::HttpError {
                status,
                message: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError { source: err }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = RegistryError::NotFound {
            image: "ghcr.io/org/app:v1".to_string(),
        };
        assert_eq!(err.to_string(), "Image not found: ghcr.io/org/app:v1");
    }

    #[test]
    fn test_error_display_referrer_too_large() {
        let err = RegistryError::ReferrerTooLarge {
            digest: "sha256:abc".to_string(),
            size: 20_000_000,
            limit: 10_485_760,
        };
        assert!(err.to_string().contains("exceeding the 10485760 byte limit"));
    }

    #[test]
    fn test_invalid_reference_passthrough() {
        let err = RegistryError::from(dike_core::Error::invalid_reference("", "empty image string"));
        assert!(err.to_string().contains("empty image string"));
    }
}
