//! Certificate chain parsing and classification.

use const_oid::db::rfc5280::ID_KP_TIME_STAMPING;
use const_oid::db::rfc5912::ECDSA_WITH_SHA_256;
use der::asn1::ObjectIdentifier;
use der::{Decode, Encode};
use x509_cert::ext::pkix::{BasicConstraints, ExtendedKeyUsage};
use x509_cert::Certificate;

use crate::error::{Result, VerifyError};
use crate::keys::VerificationKey;

/// A certificate with its evaluated extended-key-usage set.
///
/// The usage set can differ from the certificate's own EKU extension: the
/// chain splitter assigns a timestamping usage to intermediates that
/// declare none, without touching the certificate DER.
#[derive(Debug, Clone)]
pub struct CertEntry {
    /// The parsed certificate.
    pub certificate: Certificate,

    /// Extended key usages considered during validation.
    pub ekus: Vec<ObjectIdentifier>,
}

impl CertEntry {
    fn new(certificate: Certificate) -> Self {
        let ekus = certificate
            .tbs_certificate
            .get::<ExtendedKeyUsage>()
            .ok()
            .flatten()
            .map(|(_, eku)| eku.0)
            .unwrap_or_default();
        Self { certificate, ekus }
    }

    /// Returns whether the evaluated usage set allows timestamping.
    #[must_use]
    pub fn allows_timestamping(&self) -> bool {
        self.ekus.contains(&ID_KP_TIME_STAMPING)
    }
}

/// A PEM bundle split into its chain roles.
#[derive(Debug, Clone, Default)]
pub struct CertChain {
    /// End-entity certificates (not CA).
    pub leaves: Vec<CertEntry>,

    /// CA certificates that are not self-signed. A cross-signed root lands
    /// here: it is a CA but its issuer is another authority.
    pub intermediates: Vec<CertEntry>,

    /// Self-signed CA certificates.
    pub roots: Vec<CertEntry>,
}

/// Splits a PEM bundle into leaves, intermediates, and roots.
///
/// Roles: non-CA certificates are leaves; CA certificates whose raw subject
/// DER equals their raw issuer DER are roots; remaining CA certificates are
/// intermediates. Intermediates that declare no extended key usage get a
/// timestamping usage in their evaluated set so timestamp-authority chain
/// validation does not fail on a bare cross-signed authority.
///
/// # Errors
///
/// Returns [`VerifyError::InvalidCertificate`] when the PEM does not parse
/// or contains no certificates.
pub fn split_cert_chain(pem: &str) -> Result<CertChain> {
    // load_pem_chain cannot handle zero-length input.
    if pem.trim().is_empty() {
        return Err(VerifyError::InvalidCertificate {
            message: "PEM bundle is empty".to_string(),
        });
    }
    let certificates =
        Certificate::load_pem_chain(pem.as_bytes()).map_err(|e| VerifyError::InvalidCertificate {
            message: format!("failed to parse PEM chain: {e}"),
        })?;
    if certificates.is_empty() {
        return Err(VerifyError::InvalidCertificate {
            message: "PEM bundle contains no certificates".to_string(),
        });
    }

    let mut chain = CertChain::default();
    for certificate in certificates {
        let ca = is_ca(&certificate);
        let self_signed = is_self_signed(&certificate)?;
        let mut entry = CertEntry::new(certificate);

        if !ca {
            chain.leaves.push(entry);
        } else if self_signed {
            chain.roots.push(entry);
        } else {
            if entry.ekus.is_empty() {
                entry.ekus.push(ID_KP_TIME_STAMPING);
            }
            chain.intermediates.push(entry);
        }
    }
    Ok(chain)
}

fn is_ca(certificate: &Certificate) -> bool {
    certificate
        .tbs_certificate
        .get::<BasicConstraints>()
        .ok()
        .flatten()
        .is_some_and(|(_, bc)| bc.ca)
}

fn is_self_signed(certificate: &Certificate) -> Result<bool> {
    let subject = der_bytes(&certificate.tbs_certificate.subject)?;
    let issuer = der_bytes(&certificate.tbs_certificate.issuer)?;
    Ok(subject == issuer)
}

fn der_bytes<T: Encode>(value: &T) -> Result<Vec<u8>> {
    value.to_der().map_err(|e| VerifyError::InvalidCertificate {
        message: format!("failed to re-encode certificate name: {e}"),
    })
}

/// Verifies that `certificate` was signed by `issuer`'s key.
///
/// Only ECDSA-with-SHA-256 is supported; other algorithms produce
/// [`VerifyError::UnsupportedAlgorithm`].
///
/// # Errors
///
/// Fails when the signature does not verify or the material is malformed.
pub fn verify_issued_by(certificate: &Certificate, issuer: &Certificate) -> Result<()> {
    let algorithm = certificate.signature_algorithm.oid;
    if algorithm != ECDSA_WITH_SHA_256 {
        return Err(VerifyError::UnsupportedAlgorithm {
            algorithm: algorithm.to_string(),
        });
    }

    let spki =
        issuer
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| VerifyError::InvalidCertificate {
                message: format!("failed to encode issuer key: {e}"),
            })?;
    let key = VerificationKey::from_spki_der(&spki)?;

    let tbs = certificate
        .tbs_certificate
        .to_der()
        .map_err(|e| VerifyError::InvalidCertificate {
            message: format!("failed to encode certificate body: {e}"),
        })?;
    let signature = certificate
        .signature
        .as_bytes()
        .ok_or_else(|| VerifyError::InvalidCertificate {
            message: "certificate signature is not byte-aligned".to_string(),
        })?;

    key.verify(
        &tbs,
        signature,
        dike_core::policy::HashAlgorithm::Sha256,
    )
    .map_err(|_| VerifyError::InvalidCertificate {
        message: "certificate is not signed by the claimed issuer".to_string(),
    })
}

/// Verifies that a leaf certificate chains to one of the trusted roots,
/// walking through the supplied intermediates by issuer name.
///
/// # Errors
///
/// Fails when no path of valid signatures reaches a trusted root.
pub fn validate_chain(
    leaf: &Certificate,
    intermediates: &[CertEntry],
    roots: &[CertEntry],
) -> Result<()> {
    // Bounded walk; chains deeper than this are not legitimate.
    const MAX_DEPTH: usize = 8;

    let mut current = leaf.clone();
    for _ in 0..MAX_DEPTH {
        let issuer_name = der_bytes(&current.tbs_certificate.issuer)?;

        for root in roots {
            if der_bytes(&root.certificate.tbs_certificate.subject)? == issuer_name
                && verify_issued_by(&current, &root.certificate).is_ok()
            {
                return Ok(());
            }
        }

        let next = intermediates.iter().find(|entry| {
            der_bytes(&entry.certificate.tbs_certificate.subject)
                .is_ok_and(|subject| subject == issuer_name)
                && verify_issued_by(&current, &entry.certificate).is_ok()
        });
        match next {
            Some(entry) => current = entry.certificate.clone(),
            None => break,
        }
    }

    Err(VerifyError::InvalidCertificate {
        message: "certificate does not chain to a trusted root".to_string(),
    })
}

/// Parses a single PEM certificate.
///
/// # Errors
///
/// Returns [`VerifyError::InvalidCertificate`] when the input does not hold
/// exactly one parseable certificate.
pub fn parse_certificate(pem: &str) -> Result<Certificate> {
    let mut certificates =
        Certificate::load_pem_chain(pem.as_bytes()).map_err(|e| VerifyError::InvalidCertificate {
            message: format!("failed to parse PEM certificate: {e}"),
        })?;
    match certificates.len() {
        1 => Ok(certificates.remove(0)),
        n => Err(VerifyError::InvalidCertificate {
            message: format!("expected one certificate, found {n}"),
        }),
    }
}

/// Parses a certificate from DER bytes.
///
/// # Errors
///
/// Returns [`VerifyError::InvalidCertificate`] on malformed DER.
pub fn parse_certificate_der(der: &[u8]) -> Result<Certificate> {
    Certificate::from_der(der).map_err(|e| VerifyError::InvalidCertificate {
        message: format!("failed to parse DER certificate: {e}"),
    })
}
