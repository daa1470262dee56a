//! Certificate/trust-store signature verification.
//!
//! The notary-style backend trusts a PEM bundle of certificates instead of
//! a key or an identity: signatures carry their signing certificate, and a
//! signature verifies when its certificate chains to a root in the bundle
//! and its envelope signature checks out. Verification is always performed
//! at the strict level of a trust policy scoped to one named trust store.

use serde_json::Value;
use tracing::{debug, instrument};

use dike_core::intoto::{Envelope, LogBundle};
use dike_core::policy::{AttestationSpec, HashAlgorithm, NotaryAttestor};
use dike_core::Attestation;
use dike_registry::{Descriptor, ImageData};

use crate::chain::{self, CertChain};
use crate::error::{Result, VerifyError};
use crate::keys::VerificationKey;

/// Artifact type of notary signature envelopes.
pub const NOTARY_SIGNATURE_ARTIFACT_TYPE: &str = "application/vnd.cncf.notary.signature";

/// Name of the trust store every verification is scoped to.
const TRUST_STORE_NAME: &str = "dike";

/// Signature verification level of a trust policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationLevel {
    /// All checks enforced.
    Strict,
}

/// The trust policy a verification call runs under.
///
/// Always strict, always scoped to the fixed trust store, wildcarded over
/// registry scopes. Kept as an explicit value so the policy shows up in
/// logs and errors rather than being implied.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    /// Policy name.
    pub name: String,

    /// Registry scopes the policy covers.
    pub registry_scopes: Vec<String>,

    /// Enforcement level.
    pub level: VerificationLevel,

    /// The trust store holding the anchors.
    pub trust_store: String,
}

impl TrustPolicy {
    fn strict() -> Self {
        Self {
            name: "dike-trust-policy".to_string(),
            registry_scopes: vec!["*".to_string()],
            level: VerificationLevel::Strict,
            trust_store: TRUST_STORE_NAME.to_string(),
        }
    }
}

/// The certificate/trust-store verification backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotaryVerifier;

impl NotaryVerifier {
    /// Creates a verifier.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Verifies the image's notary signature envelopes against the
    /// attestor's certificate bundle.
    ///
    /// Failures from every candidate signature are collected; the call
    /// errors only when none verifies.
    ///
    /// # Errors
    ///
    /// Fails when the bundle does not parse, the image is unsigned, or no
    /// candidate signature verifies.
    #[instrument(skip(self, image, attestor), fields(image = %image.resolved_image))]
    pub fn verify_image_signature(
        &self,
        image: &ImageData,
        attestor: &NotaryAttestor,
    ) -> Result<()> {
        let trust = self.build_trust(attestor)?;

        let referrers = image.fetch_referrers(NOTARY_SIGNATURE_ARTIFACT_TYPE)?;
        if referrers.is_empty() {
            return Err(VerifyError::NoSignatures {
                image: image.resolved_image.clone(),
            });
        }

        let mut failures = Vec::new();
        for referrer in &referrers {
            match self.verify_envelope_referrer(image, referrer, &trust, &image.digest) {
                Ok(()) => {
                    image.record_verified_referrer(NOTARY_SIGNATURE_ARTIFACT_TYPE, referrer);
                    debug!(policy = %trust.policy.name, digest = %referrer.digest, "Notary signature verified");
                    return Ok(());
                }
                Err(e) => failures.push(format!("{}: {e}", referrer.digest)),
            }
        }

        Err(VerifyError::VerificationFailed {
            image: image.resolved_image.clone(),
            message: failures.join("; "),
        })
    }

    /// Verifies a named attestation: iterates all referrers of the
    /// requested artifact/predicate type and succeeds on the first one that
    /// verifies, accumulating errors only if none do.
    ///
    /// # Errors
    ///
    /// Fails when no candidate verifies.
    #[instrument(skip(self, image, attestation, attestor), fields(image = %image.resolved_image, attestation = %attestation.name))]
    pub fn verify_attestation_signature(
        &self,
        image: &ImageData,
        attestation: &Attestation,
        attestor: &NotaryAttestor,
    ) -> Result<()> {
        let trust = self.build_trust(attestor)?;

        match &attestation.spec {
            AttestationSpec::InToto { predicate_type } => {
                self.verify_intoto(image, predicate_type, &trust)
            }
            AttestationSpec::Referrer { artifact_type } => {
                self.verify_referrer_artifact(image, artifact_type, &trust)
            }
        }
    }

    fn verify_intoto(&self, image: &ImageData, predicate_type: &str, trust: &Trust) -> Result<()> {
        let referrers = image.fetch_referrers(super::cosign::INTOTO_ARTIFACT_TYPE)?;

        let mut failures = Vec::new();
        let mut candidates = 0;
        for referrer in &referrers {
            let blob = image.fetch_referrer_data(referrer)?;
            let Ok(envelope) = serde_json::from_slice::<Envelope>(&blob) else {
                failures.push(format!("{}: not a DSSE envelope", referrer.digest));
                continue;
            };
            let Ok(statement) = envelope.statement() else {
                failures.push(format!("{}: undecodable statement", referrer.digest));
                continue;
            };
            if statement.predicate_type != predicate_type {
                continue;
            }
            candidates += 1;

            match verify_envelope(&envelope, trust, &image.digest) {
                Ok(()) => {
                    image.record_verified_referrer(predicate_type, referrer);
                    image.record_verified_payload(
                        predicate_type,
                        serde_json::to_value(&statement).unwrap_or(Value::Null),
                    );
                    return Ok(());
                }
                Err(e) => failures.push(format!("{}: {e}", referrer.digest)),
            }
        }

        if candidates == 0 {
            return Err(VerifyError::NoSignatures {
                image: image.resolved_image.clone(),
            });
        }
        Err(VerifyError::VerificationFailed {
            image: image.resolved_image.clone(),
            message: failures.join("; "),
        })
    }

    fn verify_referrer_artifact(
        &self,
        image: &ImageData,
        artifact_type: &str,
        trust: &Trust,
    ) -> Result<()> {
        let artifacts = image.fetch_referrers(artifact_type)?;
        if artifacts.is_empty() {
            return Err(VerifyError::NoSignatures {
                image: image.resolved_image.clone(),
            });
        }

        let mut failures = Vec::new();
        for artifact in &artifacts {
            let signatures = image
                .fetch_referrers_for_digest(&artifact.digest, NOTARY_SIGNATURE_ARTIFACT_TYPE)?;
            if signatures.is_empty() {
                failures.push(format!("{}: artifact is unsigned", artifact.digest));
                continue;
            }

            for signature in &signatures {
                match self.verify_envelope_referrer(image, signature, trust, &artifact.digest) {
                    Ok(()) => {
                        let blob = image.fetch_referrer_data(artifact)?;
                        let payload = serde_json::from_slice(&blob).unwrap_or(Value::Null);
                        image.record_verified_referrer(artifact_type, artifact);
                        image.record_verified_payload(artifact_type, payload);
                        return Ok(());
                    }
                    Err(e) => failures.push(format!("{}: {e}", signature.digest)),
                }
            }
        }

        Err(VerifyError::VerificationFailed {
            image: image.resolved_image.clone(),
            message: failures.join("; "),
        })
    }

    fn verify_envelope_referrer(
        &self,
        image: &ImageData,
        referrer: &Descriptor,
        trust: &Trust,
        expected_digest: &str,
    ) -> Result<()> {
        let blob = image.fetch_referrer_data(referrer)?;
        let envelope: Envelope =
            serde_json::from_slice(&blob).map_err(|e| VerifyError::VerificationFailed {
                image: image.resolved_image.clone(),
                message: format!("referrer blob is not a DSSE envelope: {e}"),
            })?;
        verify_envelope(&envelope, trust, expected_digest)
    }

    /// Splits the attestor's bundles and pins the trust policy.
    fn build_trust(&self, attestor: &NotaryAttestor) -> Result<Trust> {
        let chain = chain::split_cert_chain(&attestor.certs)?;
        if chain.roots.is_empty() {
            return Err(VerifyError::InvalidAttestor {
                message: "certificate bundle contains no self-signed root".to_string(),
            });
        }

        let tsa_chain = match attestor.tsa_certs.as_deref() {
            Some(pem) => Some(build_tsa_chain(pem)?),
            None => None,
        };

        Ok(Trust {
            policy: TrustPolicy::strict(),
            chain,
            tsa_chain,
        })
    }
}

/// Trust material for one verification call.
#[derive(Debug)]
struct Trust {
    policy: TrustPolicy,
    chain: CertChain,
    tsa_chain: Option<CertChain>,
}

/// Splits and validates a timestamp-authority bundle: it must carry its own
/// self-signed root, and every signing certificate must hold the
/// timestamping purpose and chain to that root.
fn build_tsa_chain(pem: &str) -> Result<CertChain> {
    let tsa = chain::split_cert_chain(pem)?;
    if tsa.roots.is_empty() {
        return Err(VerifyError::InvalidAttestor {
            message: "timestamp-authority bundle contains no self-signed root".to_string(),
        });
    }
    if tsa.leaves.is_empty() {
        return Err(VerifyError::InvalidAttestor {
            message: "timestamp-authority bundle contains no signing certificate".to_string(),
        });
    }
    for leaf in &tsa.leaves {
        if !leaf.allows_timestamping() {
            return Err(VerifyError::InvalidAttestor {
                message: "timestamp-authority certificate lacks the timestamping purpose"
                    .to_string(),
            });
        }
        chain::validate_chain(&leaf.certificate, &tsa.intermediates, &tsa.roots)?;
    }
    Ok(tsa)
}

/// Verifies an envelope against the trust material: the statement must
/// cover the expected digest, and at least one signature must carry a
/// certificate that chains to a trusted root and verifies the PAE. When a
/// timestamp authority is configured, the strict level additionally
/// requires a countersignature from it on the winning signature.
fn verify_envelope(envelope: &Envelope, trust: &Trust, expected_digest: &str) -> Result<()> {
    let chain = &trust.chain;
    let statement = envelope.statement()?;
    if !statement.matches_digest(expected_digest) {
        return Err(VerifyError::SubjectMismatch {
            digest: expected_digest.to_string(),
        });
    }

    let pae = envelope.pae()?;
    let mut failures = Vec::new();

    for signature in &envelope.signatures {
        let result = (|| -> Result<()> {
            let certificate = match &signature.cert {
                Some(pem) => chain::parse_certificate(pem)?,
                None => {
                    // Envelopes may omit the certificate when the trust
                    // bundle already holds the leaf.
                    let leaf = chain.leaves.first().ok_or_else(|| {
                        VerifyError::InvalidCertificate {
                            message: "signature carries no certificate and the bundle has no leaf"
                                .to_string(),
                        }
                    })?;
                    leaf.certificate.clone()
                }
            };

            chain::validate_chain(&certificate, &chain.intermediates, &chain.roots)?;

            let spki = der::Encode::to_der(
                &certificate.tbs_certificate.subject_public_key_info,
            )
            .map_err(|e| VerifyError::InvalidCertificate {
                message: format!("failed to encode signer key: {e}"),
            })?;
            VerificationKey::from_spki_der(&spki)?.verify(
                &pae,
                &signature.decode()?,
                HashAlgorithm::Sha256,
            )?;

            // Strict level: a configured timestamp authority must have
            // countersigned the signature.
            if let Some(tsa) = &trust.tsa_chain {
                let bundle = signature.bundle.as_ref().ok_or_else(|| {
                    VerifyError::VerificationFailed {
                        image: expected_digest.to_string(),
                        message: "signature carries no timestamp countersignature".to_string(),
                    }
                })?;
                verify_timestamp(bundle, tsa, expected_digest)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => return Ok(()),
            Err(e) => failures.push(e.to_string()),
        }
    }

    Err(VerifyError::VerificationFailed {
        image: expected_digest.to_string(),
        message: failures.join("; "),
    })
}

/// Checks a timestamp countersignature: the signed entry timestamp must
/// verify over the bundle's canonical payload under one of the
/// timestamp-authority signing keys.
fn verify_timestamp(bundle: &LogBundle, tsa: &CertChain, expected_digest: &str) -> Result<()> {
    let canonical = bundle.canonical_payload()?;
    let set = bundle.decode_set()?;

    for entry in &tsa.leaves {
        let spki = der::Encode::to_der(&entry.certificate.tbs_certificate.subject_public_key_info)
            .map_err(|e| VerifyError::InvalidCertificate {
                message: format!("failed to encode timestamp-authority key: {e}"),
            })?;
        if VerificationKey::from_spki_der(&spki)?
            .verify(&canonical, &set, HashAlgorithm::Sha256)
            .is_ok()
        {
            return Ok(());
        }
    }

    Err(VerifyError::VerificationFailed {
        image: expected_digest.to_string(),
        message: "timestamp countersignature does not match any timestamp-authority key"
            .to_string(),
    })
}
