//! Trust root acquisition for transparency-log verification.
//!
//! The trust root carries the log's public key. It is fetched from an
//! update-framework mirror list in order, with the public ecosystem mirror
//! appended as a fallback; the first mirror yielding a parseable root wins
//! and later mirrors are never consulted.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Result, VerifyError};
use crate::keys::VerificationKey;

/// The public ecosystem update-framework mirror.
pub const PUBLIC_TUF_MIRROR: &str = "https://tuf-repo-cdn.sigstore.dev";

/// Path of the trusted-root document below a mirror.
const TRUSTED_ROOT_PATH: &str = "targets/trusted_root.json";

/// An acquired trust root: log keys plus certificate-authority roots.
#[derive(Debug, Clone)]
pub struct TrustRoot {
    /// Transparency-log public keys, in mirror order.
    pub log_keys: Vec<VerificationKey>,

    /// Certificate-authority chain certificates, DER-encoded, for keyless
    /// verification.
    pub ca_certs_der: Vec<Vec<u8>>,
}

#[derive(Deserialize)]
struct TrustedRootDocument {
    #[serde(default)]
    tlogs: Vec<LogEntry>,

    #[serde(default, rename = "certificateAuthorities")]
    certificate_authorities: Vec<CertificateAuthority>,
}

#[derive(Deserialize)]
struct LogEntry {
    #[serde(rename = "publicKey")]
    public_key: LogKey,
}

#[derive(Deserialize)]
struct LogKey {
    #[serde(rename = "rawBytes")]
    raw_bytes: String,
}

#[derive(Deserialize)]
struct CertificateAuthority {
    #[serde(rename = "certChain")]
    cert_chain: CertChainDocument,
}

#[derive(Deserialize)]
struct CertChainDocument {
    certificates: Vec<RawCertificate>,
}

#[derive(Deserialize)]
struct RawCertificate {
    #[serde(rename = "rawBytes")]
    raw_bytes: String,
}

impl TrustRoot {
    /// Parses a trusted-root JSON document.
    ///
    /// # Errors
    ///
    /// Fails when the document does not parse or holds no usable log key.
    pub fn from_document(document: &[u8]) -> Result<Self> {
        let document: TrustedRootDocument =
            serde_json::from_slice(document).map_err(|e| VerifyError::TrustRootUnavailable {
                message: format!("trusted root does not parse: {e}"),
            })?;

        let mut log_keys = Vec::new();
        for entry in &document.tlogs {
            let der = decode_raw_bytes(&entry.public_key.raw_bytes, "log key")?;
            log_keys.push(VerificationKey::from_spki_der(&der)?);
        }

        let mut ca_certs_der = Vec::new();
        for authority in &document.certificate_authorities {
            for certificate in &authority.cert_chain.certificates {
                ca_certs_der.push(decode_raw_bytes(&certificate.raw_bytes, "CA certificate")?);
            }
        }

        if log_keys.is_empty() {
            return Err(VerifyError::TrustRootUnavailable {
                message: "trusted root declares no transparency logs".to_string(),
            });
        }
        Ok(Self {
            log_keys,
            ca_certs_der,
        })
    }

    /// Builds a trust root from a single PEM public key, for explicit
    /// per-policy key overrides.
    ///
    /// # Errors
    ///
    /// Fails when the PEM does not hold a supported key.
    pub fn from_pem_key(pem: &str) -> Result<Self> {
        Ok(Self {
            log_keys: vec![VerificationKey::from_pem(pem)?],
            ca_certs_der: Vec::new(),
        })
    }

    /// Returns whether any log key verifies the given signature.
    #[must_use]
    pub fn any_key_verifies(&self, message: &[u8], signature: &[u8]) -> bool {
        self.log_keys.iter().any(|key| {
            key.verify(message, signature, dike_core::policy::HashAlgorithm::Sha256)
                .is_ok()
        })
    }
}

/// Fetches a trust root from the configured mirrors.
///
/// Mirrors are tried in order with the public mirror appended last. The
/// first mirror that yields a parseable root wins.
///
/// # Errors
///
/// Returns [`VerifyError::TrustRootUnavailable`] when every mirror fails.
pub fn fetch_trust_root(mirrors: &[String]) -> Result<TrustRoot> {
    let client = reqwest::blocking::Client::new();

    let mut candidates: Vec<&str> = mirrors.iter().map(String::as_str).collect();
    if !candidates.contains(&PUBLIC_TUF_MIRROR) {
        candidates.push(PUBLIC_TUF_MIRROR);
    }

    let mut failures = Vec::new();
    for mirror in candidates {
        let url = format!("{}/{TRUSTED_ROOT_PATH}", mirror.trim_end_matches('/'));
        match fetch_document(&client, &url) {
            Ok(document) => match TrustRoot::from_document(&document) {
                Ok(root) => {
                    debug!(mirror, "Acquired trust root");
                    return Ok(root);
                }
                Err(e) => {
                    warn!(mirror, error = %e, "Mirror served an unusable trust root");
                    failures.push(format!("{mirror}: {e}"));
                }
            },
            Err(e) => {
                warn!(mirror, error = %e, "Trust root fetch failed");
                failures.push(format!("{mirror}: {e}"));
            }
        }
    }

    Err(VerifyError::TrustRootUnavailable {
        message: failures.join("; "),
    })
}

fn decode_raw_bytes(raw: &str, what: &str) -> Result<Vec<u8>> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, raw).map_err(|e| {
        VerifyError::TrustRootUnavailable {
            message: format!("{what} is not valid base64: {e}"),
        }
    })
}

/// Fetches a transparency log's public key directly from the log itself.
///
/// Used when a policy pins the log by URL instead of going through the
/// update-framework mirrors.
///
/// # Errors
///
/// Returns [`VerifyError::TrustRootUnavailable`] when the key cannot be
/// fetched or parsed.
pub fn fetch_log_key(url: &str) -> Result<TrustRoot> {
    let client = reqwest::blocking::Client::new();
    let endpoint = format!("{}/api/v1/log/publicKey", url.trim_end_matches('/'));

    let pem = fetch_document(&client, &endpoint)
        .map_err(|e| VerifyError::TrustRootUnavailable {
            message: format!("{endpoint}: {e}"),
        })
        .and_then(|bytes| {
            String::from_utf8(bytes).map_err(|_| VerifyError::TrustRootUnavailable {
                message: format!("{endpoint}: key is not UTF-8 PEM"),
            })
        })?;

    TrustRoot::from_pem_key(&pem)
}

fn fetch_document(
    client: &reqwest::blocking::Client,
    url: &str,
) -> std::result::Result<Vec<u8>, reqwest::Error> {
    let response = client.get(url).send()?.error_for_status()?;
    Ok(response.bytes()?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use p256::pkcs8::EncodePublicKey;

    fn sample_document(keys: usize) -> Vec<u8> {
        let tlogs: Vec<_> = (0..keys)
            .map(|_| {
                let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
                let der = key.verifying_key().to_public_key_der().unwrap();
                serde_json::json!({
                    "baseUrl": "https://rekor.example",
                    "publicKey": {"rawBytes": BASE64.encode(der.as_bytes())}
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({"tlogs": tlogs})).unwrap()
    }

    #[test]
    fn test_document_parsing() {
        let root = TrustRoot::from_document(&sample_document(2)).unwrap();
        assert_eq!(root.log_keys.len(), 2);
    }

    #[test]
    fn test_document_without_logs_rejected() {
        let err = TrustRoot::from_document(&sample_document(0)).unwrap_err();
        assert!(matches!(err, VerifyError::TrustRootUnavailable { .. }));
    }

    #[test]
    fn test_pem_key_override() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let pem = key
            .verifying_key()
            .to_public_key_pem(Default::default())
            .unwrap();

        let root = TrustRoot::from_pem_key(&pem).unwrap();
        assert_eq!(root.log_keys.len(), 1);
    }
}
