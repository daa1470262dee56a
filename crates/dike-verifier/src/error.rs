//! Error types for signature verification.

use thiserror::Error;

/// Result type alias for verification operations.
pub type Result<T> = std::result::Result<T, VerifyError>;

/// Errors that can occur while verifying signatures and attestations.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Registry access failed while fetching signatures or payloads.
    #[error(transparent)]
    Registry(#[from] dike_registry::RegistryError),

    /// A signing envelope could not be decoded.
    #[error(transparent)]
    Envelope(#[from] dike_core::Error),

    /// A configured public key could not be parsed or resolved.
    #[error("Invalid verification key: {message}")]
    InvalidKey {
        /// What was wrong with the key.
        message: String,
    },

    /// A certificate or certificate chain could not be parsed.
    #[error("Invalid certificate: {message}")]
    InvalidCertificate {
        /// What was wrong with the certificate.
        message: String,
    },

    /// An attestor's trust configuration is unusable.
    #[error("Invalid attestor configuration: {message}")]
    InvalidAttestor {
        /// What was wrong with the configuration.
        message: String,
    },

    /// The image has no signatures of the requested artifact type.
    #[error("No signatures found for {image}")]
    NoSignatures {
        /// The image reference.
        image: String,
    },

    /// Cryptographic verification failed for every candidate signature.
    #[error("Signature verification failed for {image}: {message}")]
    VerificationFailed {
        /// The image reference.
        image: String,
        /// Accumulated per-candidate failures.
        message: String,
    },

    /// Bundle verification requires every signature to verify.
    #[error("Signature count mismatch: {total} signatures, {verified} verified")]
    SignatureCountMismatch {
        /// Total number of signatures in the envelope.
        total: usize,
        /// Number that verified.
        verified: usize,
    },

    /// A required annotation was missing or had the wrong value.
    #[error("Annotation mismatch on '{key}': expected '{expected}', found {found:?}")]
    AnnotationMismatch {
        /// Annotation key.
        key: String,
        /// Expected value.
        expected: String,
        /// Value present on the signature, if any.
        found: Option<String>,
    },

    /// No keyless identity matcher accepted the signing certificate.
    #[error("Certificate identity (issuer: {issuer:?}, subject: {subject:?}) matched no configured identity")]
    IdentityMismatch {
        /// Issuer recorded in the certificate.
        issuer: Option<String>,
        /// Subject recorded in the certificate.
        subject: Option<String>,
    },

    /// The statement subject does not cover the image digest.
    #[error("Statement subject does not match image digest {digest}")]
    SubjectMismatch {
        /// The image digest.
        digest: String,
    },

    /// No usable trust root could be acquired.
    #[error("Trust root unavailable: {message}")]
    TrustRootUnavailable {
        /// Why acquisition failed.
        message: String,
    },

    /// A certificate uses an algorithm the verifier does not support.
    #[error("Unsupported signature algorithm: {algorithm}")]
    UnsupportedAlgorithm {
        /// The algorithm OID or name.
        algorithm: String,
    },
}
