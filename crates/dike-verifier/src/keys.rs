//! Public key parsing and signature checking.

use ed25519_dalek::Verifier as _;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use dike_core::policy::HashAlgorithm;

use crate::error::{Result, VerifyError};

/// A parsed verification key.
///
/// Cosign key material is either ECDSA over P-256 or Ed25519; both arrive
/// as PKCS#8 SubjectPublicKeyInfo PEM.
#[derive(Debug, Clone)]
pub enum VerificationKey {
    /// ECDSA P-256.
    EcdsaP256(p256::ecdsa::VerifyingKey),

    /// Ed25519.
    Ed25519(ed25519_dalek::VerifyingKey),
}

impl VerificationKey {
    /// Parses a PEM-encoded public key, trying P-256 first and Ed25519
    /// second.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::InvalidKey`] when neither parser accepts the
    /// input.
    pub fn from_pem(pem: &str) -> Result<Self> {
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_pem(pem) {
            return Ok(Self::EcdsaP256(key));
        }
        ed25519_dalek::VerifyingKey::from_public_key_pem(pem)
            .map(Self::Ed25519)
            .map_err(|e| VerifyError::InvalidKey {
                message: format!("not a P-256 or Ed25519 public key: {e}"),
            })
    }

    /// Parses a key from a DER-encoded SubjectPublicKeyInfo.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::InvalidKey`] when the DER does not hold a
    /// supported key.
    pub fn from_spki_der(der: &[u8]) -> Result<Self> {
        if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(der) {
            return Ok(Self::EcdsaP256(key));
        }
        ed25519_dalek::VerifyingKey::from_public_key_der(der)
            .map(Self::Ed25519)
            .map_err(|e| VerifyError::InvalidKey {
                message: format!("not a P-256 or Ed25519 public key: {e}"),
            })
    }

    /// Verifies a signature over a message.
    ///
    /// For ECDSA the message is hashed with the configured algorithm and
    /// checked against the prehash; Ed25519 defines its own internal hash
    /// and ignores `hash`. ECDSA signatures are accepted in DER or raw
    /// fixed-width form.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::VerificationFailed`] when the signature does
    /// not verify.
    pub fn verify(&self, message: &[u8], signature: &[u8], hash: HashAlgorithm) -> Result<()> {
        match self {
            Self::EcdsaP256(key) => {
                let sig = p256::ecdsa::Signature::from_der(signature)
                    .or_else(|_| p256::ecdsa::Signature::from_slice(signature))
                    .map_err(|e| VerifyError::InvalidKey {
                        message: format!("malformed ECDSA signature: {e}"),
                    })?;
                let digest = digest_message(message, hash);
                key.verify_prehash(&digest, &sig).map_err(|_| failed())
            }
            Self::Ed25519(key) => {
                let sig = ed25519_dalek::Signature::from_slice(signature).map_err(|e| {
                    VerifyError::InvalidKey {
                        message: format!("malformed Ed25519 signature: {e}"),
                    }
                })?;
                key.verify(message, &sig).map_err(|_| failed())
            }
        }
    }
}

fn digest_message(message: &[u8], hash: HashAlgorithm) -> Vec<u8> {
    match hash {
        HashAlgorithm::Sha224 => Sha224::digest(message).to_vec(),
        HashAlgorithm::Sha256 => Sha256::digest(message).to_vec(),
        HashAlgorithm::Sha384 => Sha384::digest(message).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(message).to_vec(),
    }
}

fn failed() -> VerifyError {
    VerifyError::VerificationFailed {
        image: String::new(),
        message: "signature does not verify".to_string(),
    }
}
