//! Keyed and keyless signature verification.
//!
//! Signatures and in-toto attestations travel as DSSE envelopes attached to
//! the image through the registry referrers API. Verification builds an
//! options bundle per call from the attestor configuration, checks every
//! candidate envelope, and records successes into the image's side tables.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use der::asn1::ObjectIdentifier;
use der::Encode;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::Certificate;

use dike_core::intoto::Envelope;
use dike_core::policy::{
    AttestationSpec, CosignAttestor, HashAlgorithm, IdentityMatcher, Keyless,
};
use dike_core::Attestation;
use dike_registry::{Descriptor, ImageData};

use crate::chain::{self, CertChain};
use crate::error::{Result, VerifyError};
use crate::keys::VerificationKey;
use crate::trustroot::{self, TrustRoot};

/// Artifact type of image signature envelopes.
pub const SIGNATURE_ARTIFACT_TYPE: &str = "application/vnd.dev.cosign.artifact.sig.v1+json";

/// Artifact type of in-toto attestation envelopes.
pub const INTOTO_ARTIFACT_TYPE: &str = "application/vnd.in-toto+json";

/// The certificate extension carrying the OIDC issuer of a keyless
/// signing identity.
const ISSUER_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.57264.1.1");

/// Resolves key references (KMS or cluster secret URIs) to PEM material.
pub trait KeyResolver: Send + Sync {
    /// Resolves a key reference to a PEM-encoded public key.
    ///
    /// # Errors
    ///
    /// Returns an error when the reference cannot be resolved.
    fn resolve(&self, reference: &str) -> Result<String>;
}

/// The keyed/keyless verification backend.
#[derive(Default, Clone)]
pub struct CosignVerifier {
    key_resolver: Option<Arc<dyn KeyResolver>>,
}

impl std::fmt::Debug for CosignVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CosignVerifier")
            .field("has_key_resolver", &self.key_resolver.is_some())
            .finish()
    }
}

/// Trust material resolved for one verification call.
enum Material {
    Key(VerificationKey, HashAlgorithm),
    Certificate {
        certificate: Box<Certificate>,
        chain: Option<CertChain>,
    },
    Keyless {
        identities: Vec<CompiledIdentity>,
        roots: CertChain,
    },
}

/// Per-call options bundle.
struct VerificationOptions<'a> {
    material: Material,
    annotations: &'a BTreeMap<String, String>,
    /// Log keys for signed-entry-timestamp checks; `None` when the policy
    /// opted out of transparency-log verification.
    trust_root: Option<TrustRoot>,
}

impl CosignVerifier {
    /// Creates a verifier without a key-reference resolver; attestors must
    /// carry inline key material.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a resolver for KMS / secret key references.
    #[must_use]
    pub fn with_key_resolver(mut self, resolver: Arc<dyn KeyResolver>) -> Self {
        self.key_resolver = Some(resolver);
        self
    }

    /// Verifies the image's signature envelopes against an attestor.
    ///
    /// On success the verified referrer is recorded on the image under the
    /// signature artifact type.
    ///
    /// # Errors
    ///
    /// Fails closed: no signatures, no verifying envelope, annotation
    /// mismatch, or unusable trust configuration all error.
    #[instrument(skip(self, image, attestor), fields(image = %image.resolved_image))]
    pub fn verify_image_signature(
        &self,
        image: &ImageData,
        attestor: &CosignAttestor,
    ) -> Result<()> {
        let options = self.build_options(attestor)?;

        let referrers = image.fetch_referrers(SIGNATURE_ARTIFACT_TYPE)?;
        if referrers.is_empty() {
            return Err(VerifyError::NoSignatures {
                image: image.resolved_image.clone(),
            });
        }

        let mut failures = Vec::new();
        for referrer in &referrers {
            match self.verify_signature_referrer(image, referrer, &options, &image.digest) {
                Ok(()) => {
                    image.record_verified_referrer(SIGNATURE_ARTIFACT_TYPE, referrer);
                    debug!(digest = %referrer.digest, "Image signature verified");
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

    /// Verifies a named attestation against an attestor.
    ///
    /// In-toto attestations are DSSE envelopes filtered by predicate type;
    /// referrer attestations are arbitrary artifacts whose own signature
    /// envelopes are fetched via the referrers of the artifact. The decoded
    /// payload of the first verified candidate is recorded on the image
    /// under the attestation's type string.
    ///
    /// # Errors
    ///
    /// Fails when no candidate of the requested type verifies.
    #[instrument(skip(self, image, attestation, attestor), fields(image = %image.resolved_image, attestation = %attestation.name))]
    pub fn verify_attestation_signature(
        &self,
        image: &ImageData,
        attestation: &Attestation,
        attestor: &CosignAttestor,
    ) -> Result<()> {
        let options = self.build_options(attestor)?;

        match &attestation.spec {
            AttestationSpec::InToto { predicate_type } => {
                self.verify_intoto(image, predicate_type, &options)
            }
            AttestationSpec::Referrer { artifact_type } => {
                self.verify_referrer_artifact(image, artifact_type, &options)
            }
        }
    }

    fn verify_intoto(
        &self,
        image: &ImageData,
        predicate_type: &str,
        options: &VerificationOptions<'_>,
    ) -> Result<()> {
        let referrers = image.fetch_referrers(INTOTO_ARTIFACT_TYPE)?;

        let mut failures = Vec::new();
        let mut candidates = 0;
        for referrer in &referrers {
            let blob = image.fetch_referrer_data(referrer)?;
            let envelope: Envelope = match serde_json::from_slice(&blob) {
                Ok(envelope) => envelope,
                Err(e) => {
                    failures.push(format!("{}: not a DSSE envelope: {e}", referrer.digest));
                    continue;
                }
            };
            let statement = match envelope.statement() {
                Ok(statement) => statement,
                Err(e) => {
                    failures.push(format!("{}: {e}", referrer.digest));
                    continue;
                }
            };
            if statement.predicate_type != predicate_type {
                continue;
            }
            candidates += 1;

            match verify_envelope(&envelope, options, &image.digest)
                .and_then(|()| check_annotations(options.annotations, referrer.annotations.as_ref()))
            {
                Ok(()) => {
                    image.record_verified_referrer(predicate_type, referrer);
                    image.record_verified_payload(
                        predicate_type,
                        serde_json::to_value(&statement).unwrap_or(Value::Null),
                    );
                    debug!(predicate_type, "Attestation verified");
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
        options: &VerificationOptions<'_>,
    ) -> Result<()> {
        let artifacts = image.fetch_referrers(artifact_type)?;
        if artifacts.is_empty() {
            return Err(VerifyError::NoSignatures {
                image: image.resolved_image.clone(),
            });
        }

        let mut failures = Vec::new();
        for artifact in &artifacts {
            // Signatures over the artifact hang off the artifact itself.
            let signatures =
                image.fetch_referrers_for_digest(&artifact.digest, SIGNATURE_ARTIFACT_TYPE)?;
            if signatures.is_empty() {
                failures.push(format!("{}: artifact is unsigned", artifact.digest));
                continue;
            }

            for signature in &signatures {
                match self.verify_signature_referrer(image, signature, options, &artifact.digest)
                    .and_then(|()| {
                        check_annotations(options.annotations, artifact.annotations.as_ref())
                    }) {
                    Ok(()) => {
                        let blob = image.fetch_referrer_data(artifact)?;
                        let payload: Value =
                            serde_json::from_slice(&blob).unwrap_or_else(|_| Value::Null);
                        image.record_verified_referrer(artifact_type, artifact);
                        image.record_verified_payload(artifact_type, payload);
                        debug!(artifact_type, "Referrer artifact verified");
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

    /// Verifies one signature referrer: fetch its envelope blob, check the
    /// statement subject against `expected_digest`, then the signatures.
    fn verify_signature_referrer(
        &self,
        image: &ImageData,
        referrer: &Descriptor,
        options: &VerificationOptions<'_>,
        expected_digest: &str,
    ) -> Result<()> {
        let blob = image.fetch_referrer_data(referrer)?;
        let envelope: Envelope =
            serde_json::from_slice(&blob).map_err(|e| VerifyError::VerificationFailed {
                image: image.resolved_image.clone(),
                message: format!("referrer blob is not a DSSE envelope: {e}"),
            })?;
        verify_envelope(&envelope, options, expected_digest)?;
        check_annotations(options.annotations, referrer.annotations.as_ref())
    }

    /// Builds the per-call options bundle from the attestor configuration.
    fn build_options<'a>(&self, attestor: &'a CosignAttestor) -> Result<VerificationOptions<'a>> {
        let trust_root = self.acquire_trust_root(attestor)?;
        let material = self.resolve_material(attestor, trust_root.as_ref())?;

        Ok(VerificationOptions {
            material,
            annotations: &attestor.annotations,
            trust_root,
        })
    }

    /// Acquires transparency-log keys unless the attestor opts out.
    ///
    /// Without the opt-out flag a missing trust root is an error: verifying
    /// against a null root must fail, not silently skip the log check.
    fn acquire_trust_root(&self, attestor: &CosignAttestor) -> Result<Option<TrustRoot>> {
        let ctlog = attestor.ctlog.as_ref();
        if ctlog.is_some_and(|c| c.insecure_ignore_tlog) {
            return Ok(None);
        }

        let root = match ctlog {
            Some(c) if c.pubkey.is_some() => {
                TrustRoot::from_pem_key(c.pubkey.as_deref().unwrap_or_default())?
            }
            Some(c) if c.url.is_some() => {
                trustroot::fetch_log_key(c.url.as_deref().unwrap_or_default())?
            }
            Some(c) => trustroot::fetch_trust_root(&c.tuf_mirrors)?,
            None => trustroot::fetch_trust_root(&[])?,
        };
        Ok(Some(root))
    }

    fn resolve_material(
        &self,
        attestor: &CosignAttestor,
        trust_root: Option<&TrustRoot>,
    ) -> Result<Material> {
        if let Some(key) = &attestor.key {
            let pem = match (&key.data, &key.reference) {
                (Some(data), _) => data.clone(),
                (None, Some(reference)) => {
                    let resolver =
                        self.key_resolver
                            .as_ref()
                            .ok_or_else(|| VerifyError::InvalidAttestor {
                                message: format!(
                                    "key reference '{reference}' given but no key resolver is configured"
                                ),
                            })?;
                    resolver.resolve(reference)?
                }
                (None, None) => {
                    return Err(VerifyError::InvalidAttestor {
                        message: "key attestor has neither inline data nor a reference".to_string(),
                    })
                }
            };
            return Ok(Material::Key(
                VerificationKey::from_pem(&pem)?,
                key.hash_algorithm,
            ));
        }

        if let Some(certificate) = &attestor.certificate {
            let pem = certificate.certificate.as_deref().ok_or_else(|| {
                VerifyError::InvalidAttestor {
                    message: "certificate attestor carries no certificate".to_string(),
                }
            })?;
            let parsed = chain::parse_certificate(pem)?;
            let cert_chain = certificate
                .certificate_chain
                .as_deref()
                .map(chain::split_cert_chain)
                .transpose()?;
            return Ok(Material::Certificate {
                certificate: Box::new(parsed),
                chain: cert_chain,
            });
        }

        if let Some(keyless) = &attestor.keyless {
            return Ok(Material::Keyless {
                identities: compile_identities(keyless)?,
                roots: keyless_roots(keyless, trust_root)?,
            });
        }

        Err(VerifyError::InvalidAttestor {
            message: "attestor declares no key, certificate, or keyless identities".to_string(),
        })
    }
}

/// Root pool for keyless verification: the policy's own PEM roots when
/// configured, otherwise the CA certificates from the acquired trust root.
fn keyless_roots(keyless: &Keyless, trust_root: Option<&TrustRoot>) -> Result<CertChain> {
    if let Some(pem) = &keyless.roots {
        return chain::split_cert_chain(pem);
    }

    let trust_root = trust_root.ok_or_else(|| VerifyError::TrustRootUnavailable {
        message: "keyless verification needs roots, but the transparency log is disabled and no roots are configured"
            .to_string(),
    })?;

    let mut roots = CertChain::default();
    for der in &trust_root.ca_certs_der {
        let certificate = chain::parse_certificate_der(der)?;
        roots.roots.push(crate::chain::CertEntry {
            ekus: Vec::new(),
            certificate,
        });
    }
    if roots.roots.is_empty() {
        return Err(VerifyError::TrustRootUnavailable {
            message: "trust root carries no certificate authorities".to_string(),
        });
    }
    Ok(roots)
}

/// Checks the statement subject and every signature of an envelope.
///
/// With transparency-log checking enabled, every signature must verify and
/// carry a log bundle whose signed entry timestamp one of the log keys
/// accepts; without it, a single verifying signature suffices.
fn verify_envelope(
    envelope: &Envelope,
    options: &VerificationOptions<'_>,
    expected_digest: &str,
) -> Result<()> {
    let statement = envelope.statement()?;
    if !statement.matches_digest(expected_digest) {
        return Err(VerifyError::SubjectMismatch {
            digest: expected_digest.to_string(),
        });
    }

    if envelope.signatures.is_empty() {
        return Err(VerifyError::NoSignatures {
            image: expected_digest.to_string(),
        });
    }

    let pae = envelope.pae()?;
    let mut verified = 0;
    let mut last_error = None;

    for signature in &envelope.signatures {
        match verify_one_signature(signature, &pae, options) {
            Ok(()) => verified += 1,
            Err(e) => last_error = Some(e),
        }
    }

    let total = envelope.signatures.len();
    if options.trust_root.is_some() {
        // Bundle verification mode: every signature must check out.
        if verified != total {
            return match last_error {
                Some(e) if verified == 0 => Err(e),
                _ => Err(VerifyError::SignatureCountMismatch { total, verified }),
            };
        }
        return Ok(());
    }

    if verified == 0 {
        return Err(last_error.unwrap_or_else(|| VerifyError::NoSignatures {
            image: expected_digest.to_string(),
        }));
    }
    Ok(())
}

fn verify_one_signature(
    signature: &dike_core::EnvelopeSignature,
    pae: &[u8],
    options: &VerificationOptions<'_>,
) -> Result<()> {
    let sig_bytes = signature.decode()?;

    match &options.material {
        Material::Key(key, hash) => key.verify(pae, &sig_bytes, *hash)?,
        Material::Certificate { certificate, chain } => {
            if let Some(chain) = chain {
                chain::validate_chain(certificate, &chain.intermediates, &chain.roots)?;
            }
            certificate_key(certificate)?.verify(pae, &sig_bytes, HashAlgorithm::Sha256)?;
        }
        Material::Keyless { identities, roots } => {
            let pem = signature.cert.as_deref().ok_or_else(|| {
                VerifyError::InvalidCertificate {
                    message: "keyless signature carries no certificate".to_string(),
                }
            })?;
            let certificate = chain::parse_certificate(pem)?;

            let (issuer, subject) = certificate_identity(&certificate);
            if !identities
                .iter()
                .any(|identity| identity.matches(issuer.as_deref(), subject.as_deref()))
            {
                return Err(VerifyError::IdentityMismatch { issuer, subject });
            }

            chain::validate_chain(&certificate, &roots.intermediates, &roots.roots)?;
            certificate_key(&certificate)?.verify(pae, &sig_bytes, HashAlgorithm::Sha256)?;
        }
    }

    if let Some(trust_root) = &options.trust_root {
        let bundle = signature
            .bundle
            .as_ref()
            .ok_or_else(|| VerifyError::VerificationFailed {
                image: String::new(),
                message: "signature has no transparency-log bundle".to_string(),
            })?;
        let canonical = bundle.canonical_payload()?;
        let set = bundle.decode_set()?;
        if !trust_root.any_key_verifies(&canonical, &set) {
            return Err(VerifyError::VerificationFailed {
                image: String::new(),
                message: "signed entry timestamp does not verify against any log key".to_string(),
            });
        }
    }

    Ok(())
}

fn certificate_key(certificate: &Certificate) -> Result<VerificationKey> {
    let spki = certificate
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| VerifyError::InvalidCertificate {
            message: format!("failed to encode certificate key: {e}"),
        })?;
    VerificationKey::from_spki_der(&spki)
}

/// Extracts the (OIDC issuer, signing identity) pair from a keyless
/// certificate: the issuer extension and the subject alternative name.
fn certificate_identity(certificate: &Certificate) -> (Option<String>, Option<String>) {
    let issuer = certificate
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|ext| ext.extn_id == ISSUER_OID)
        .map(|ext| String::from_utf8_lossy(ext.extn_value.as_bytes()).into_owned());

    let subject = certificate
        .tbs_certificate
        .get::<SubjectAltName>()
        .ok()
        .flatten()
        .and_then(|(_, san)| {
            san.0.into_iter().find_map(|name| match name {
                GeneralName::Rfc822Name(address) => Some(address.to_string()),
                GeneralName::UniformResourceIdentifier(uri) => Some(uri.to_string()),
                _ => None,
            })
        });

    (issuer, subject)
}

/// One compiled keyless identity constraint; all present fields must match.
struct CompiledIdentity {
    issuer: Option<String>,
    subject: Option<String>,
    issuer_regex: Option<Regex>,
    subject_regex: Option<Regex>,
}

impl CompiledIdentity {
    fn matches(&self, issuer: Option<&str>, subject: Option<&str>) -> bool {
        let issuer_ok = match (&self.issuer, &self.issuer_regex) {
            (Some(expected), _) => issuer == Some(expected.as_str()),
            (None, Some(regex)) => issuer.is_some_and(|i| regex.is_match(i)),
            (None, None) => true,
        };
        let subject_ok = match (&self.subject, &self.subject_regex) {
            (Some(expected), _) => subject == Some(expected.as_str()),
            (None, Some(regex)) => subject.is_some_and(|s| regex.is_match(s)),
            (None, None) => true,
        };
        issuer_ok && subject_ok
    }
}

fn compile_identities(keyless: &Keyless) -> Result<Vec<CompiledIdentity>> {
    if keyless.identities.is_empty() {
        return Err(VerifyError::InvalidAttestor {
            message: "keyless attestor declares no identities".to_string(),
        });
    }
    keyless.identities.iter().map(compile_identity).collect()
}

fn compile_identity(matcher: &IdentityMatcher) -> Result<CompiledIdentity> {
    let compile = |pattern: &Option<String>| -> Result<Option<Regex>> {
        pattern
            .as_deref()
            .map(|p| {
                Regex::new(p).map_err(|e| VerifyError::InvalidAttestor {
                    message: format!("bad identity regex '{p}': {e}"),
                })
            })
            .transpose()
    };
    Ok(CompiledIdentity {
        issuer: matcher.issuer.clone(),
        subject: matcher.subject.clone(),
        issuer_regex: compile(&matcher.issuer_regex)?,
        subject_regex: compile(&matcher.subject_regex)?,
    })
}

/// Exact-subset annotation check: every expected key/value must appear in
/// the signature's own annotation set.
fn check_annotations(
    expected: &BTreeMap<String, String>,
    actual: Option<&HashMap<String, String>>,
) -> Result<()> {
    for (key, value) in expected {
        let found = actual.and_then(|a| a.get(key));
        if found != Some(value) {
            return Err(VerifyError::AnnotationMismatch {
                key: key.clone(),
                expected: value.clone(),
                found: found.cloned(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use dike_core::intoto::{pae, LogBundle, LogPayload};
    use dike_core::policy::{CosignKey, CtLog};
    use dike_core::{EnvelopeSignature, ImageReference};
    use dike_registry::oci::{OCI_INDEX, OCI_MANIFEST};
    use dike_registry::{
        CacheLimits, ImageIndex, Manifest, RegistryApi, RegistryAuth, RegistryError,
    };
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::pkcs8::EncodePublicKey;
    use sha2::{Digest, Sha256};

    const IMAGE_DIGEST: &str =
        "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    /// Fake registry serving referrer manifests and blobs by digest.
    #[derive(Default)]
    struct FakeApi {
        referrers: HashMap<String, Vec<Descriptor>>,
        manifests: HashMap<String, Vec<u8>>,
        blobs: HashMap<String, Vec<u8>>,
    }

    impl RegistryApi for FakeApi {
        fn get_manifest(
            &self,
            _registry: &str,
            _repository: &str,
            reference: &str,
            _auth: &RegistryAuth,
        ) -> dike_registry::Result<(Vec<u8>, String)> {
            self.manifests
                .get(reference)
                .map(|m| (m.clone(), OCI_MANIFEST.to_string()))
                .ok_or_else(|| RegistryError::NotFound {
                    image: reference.to_string(),
                })
        }

        fn head_manifest(
            &self,
            _registry: &str,
            _repository: &str,
            reference: &str,
            _auth: &RegistryAuth,
        ) -> dike_registry::Result<Descriptor> {
            Err(RegistryError::NotFound {
                image: reference.to_string(),
            })
        }

        fn get_blob(
            &self,
            _registry: &str,
            _repository: &str,
            digest: &str,
            _auth: &RegistryAuth,
        ) -> dike_registry::Result<Vec<u8>> {
            self.blobs
                .get(digest)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound {
                    image: digest.to_string(),
                })
        }

        fn get_referrers(
            &self,
            _registry: &str,
            _repository: &str,
            digest: &str,
            _auth: &RegistryAuth,
        ) -> dike_registry::Result<ImageIndex> {
            Ok(ImageIndex {
                schema_version: 2,
                media_type: Some(OCI_INDEX.to_string()),
                manifests: self.referrers.get(digest).cloned().unwrap_or_default(),
            })
        }
    }

    /// A fake that attaches one DSSE envelope to the image under the given
    /// artifact type and annotations.
    fn attach_envelope(
        api: &mut FakeApi,
        subject_digest: &str,
        artifact_type: &str,
        envelope: &Envelope,
        annotations: Option<HashMap<String, String>>,
    ) {
        let blob = serde_json::to_vec(envelope).unwrap();
        let blob_digest = format!("sha256:{}", hex_digest(&blob));
        let referrer_digest = format!("sha256:{}", hex_digest(blob_digest.as_bytes()));

        let manifest = Manifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST.to_string()),
            config: None,
            layers: vec![Descriptor::new(
                "application/vnd.dsse.envelope.v1+json",
                blob_digest.clone(),
                blob.len() as u64,
            )],
            artifact_type: Some(artifact_type.to_string()),
            subject: None,
            annotations: None,
        };
        api.manifests
            .insert(referrer_digest.clone(), serde_json::to_vec(&manifest).unwrap());
        api.blobs.insert(blob_digest, blob);
        api.referrers
            .entry(subject_digest.to_string())
            .or_default()
            .push(Descriptor {
                artifact_type: Some(artifact_type.to_string()),
                annotations,
                ..Descriptor::new(OCI_MANIFEST, referrer_digest, 100)
            });
    }

    fn hex_digest(data: &[u8]) -> String {
        Sha256::digest(data)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    fn image_data(api: FakeApi) -> ImageData {
        let reference = ImageReference::parse("ghcr.io/acme/payments:signed").unwrap();
        ImageData::new(
            reference,
            b"{}".to_vec(),
            Manifest {
                schema_version: 2,
                media_type: Some(OCI_MANIFEST.to_string()),
                config: None,
                layers: Vec::new(),
                artifact_type: None,
                subject: None,
                annotations: None,
            },
            None,
            None,
            IMAGE_DIGEST.to_string(),
            Arc::new(api),
            RegistryAuth::Anonymous,
            CacheLimits::default(),
        )
    }

    fn statement_json(digest: &str, predicate_type: &str) -> Value {
        let hex = digest.strip_prefix("sha256:").unwrap();
        serde_json::json!({
            "_type": dike_core::intoto::STATEMENT_TYPE,
            "subject": [{"name": "ghcr.io/acme/payments", "digest": {"sha256": hex}}],
            "predicateType": predicate_type,
            "predicate": {"verified": true}
        })
    }

    fn sign_envelope(
        statement: &Value,
        key: &p256::ecdsa::SigningKey,
        bundle_key: Option<&p256::ecdsa::SigningKey>,
    ) -> Envelope {
        let payload = serde_json::to_vec(statement).unwrap();
        let payload_b64 = BASE64.encode(&payload);
        let encoded = pae(INTOTO_ARTIFACT_TYPE, &payload);
        let digest = Sha256::digest(&encoded);
        let sig: p256::ecdsa::Signature = key.sign_prehash(&digest).unwrap();

        let bundle = bundle_key.map(|log_key| {
            let payload = LogPayload {
                body: BASE64.encode(b"entry"),
                integrated_time: 1_700_000_000,
                log_index: 7,
                log_id: "test-log".to_string(),
            };
            let mut bundle = LogBundle {
                signed_entry_timestamp: String::new(),
                payload,
            };
            let canonical = bundle.canonical_payload().unwrap();
            let set: p256::ecdsa::Signature =
                log_key.sign_prehash(&Sha256::digest(&canonical)).unwrap();
            bundle.signed_entry_timestamp = BASE64.encode(set.to_der().as_bytes());
            bundle
        });

        Envelope {
            payload: payload_b64,
            payload_type: INTOTO_ARTIFACT_TYPE.to_string(),
            signatures: vec![EnvelopeSignature {
                sig: BASE64.encode(sig.to_der().as_bytes()),
                bundle,
                ..EnvelopeSignature::default()
            }],
        }
    }

    fn key_attestor(key: &p256::ecdsa::SigningKey) -> CosignAttestor {
        let pem = key
            .verifying_key()
            .to_public_key_pem(Default::default())
            .unwrap();
        CosignAttestor {
            key: Some(CosignKey {
                data: Some(pem),
                reference: None,
                hash_algorithm: HashAlgorithm::Sha256,
            }),
            certificate: None,
            keyless: None,
            ctlog: Some(CtLog {
                url: None,
                pubkey: None,
                insecure_ignore_tlog: true,
                tuf_mirrors: Vec::new(),
            }),
            annotations: BTreeMap::new(),
        }
    }

    #[test]
    fn test_key_mode_signature_verifies() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let envelope = sign_envelope(&statement_json(IMAGE_DIGEST, "cosign.sigstore.dev/message"), &key, None);

        let mut api = FakeApi::default();
        attach_envelope(&mut api, IMAGE_DIGEST, SIGNATURE_ARTIFACT_TYPE, &envelope, None);
        let image = image_data(api);

        CosignVerifier::new()
            .verify_image_signature(&image, &key_attestor(&key))
            .unwrap();
        assert!(image.verified_referrer(SIGNATURE_ARTIFACT_TYPE).is_some());
    }

    #[test]
    fn test_unsigned_image_fails_closed() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let image = image_data(FakeApi::default());

        let err = CosignVerifier::new()
            .verify_image_signature(&image, &key_attestor(&key))
            .unwrap_err();
        assert!(matches!(err, VerifyError::NoSignatures { .. }));
    }

    #[test]
    fn test_wrong_key_fails() {
        let signer = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let other = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let envelope = sign_envelope(&statement_json(IMAGE_DIGEST, "cosign.sigstore.dev/message"), &signer, None);

        let mut api = FakeApi::default();
        attach_envelope(&mut api, IMAGE_DIGEST, SIGNATURE_ARTIFACT_TYPE, &envelope, None);
        let image = image_data(api);

        let err = CosignVerifier::new()
            .verify_image_signature(&image, &key_attestor(&other))
            .unwrap_err();
        assert!(matches!(err, VerifyError::VerificationFailed { .. }));
    }

    #[test]
    fn test_subject_digest_mismatch_fails() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let other_digest =
            "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
        let envelope = sign_envelope(&statement_json(other_digest, "cosign.sigstore.dev/message"), &key, None);

        let mut api = FakeApi::default();
        attach_envelope(&mut api, IMAGE_DIGEST, SIGNATURE_ARTIFACT_TYPE, &envelope, None);
        let image = image_data(api);

        let err = CosignVerifier::new()
            .verify_image_signature(&image, &key_attestor(&key))
            .unwrap_err();
        assert!(matches!(err, VerifyError::VerificationFailed { .. }));
    }

    #[test]
    fn test_annotation_subset_semantics() {
        let all: HashMap<String, String> = [("a", "1"), ("b", "2"), ("c", "3")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let subset: BTreeMap<String, String> = [("a", "1"), ("b", "2")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        check_annotations(&subset, Some(&all)).unwrap();

        let wrong_value: BTreeMap<String, String> = [("a", "1"), ("b", "wrong")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(check_annotations(&wrong_value, Some(&all)).is_err());

        let missing: BTreeMap<String, String> =
            [("missing", "1")].into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        assert!(check_annotations(&missing, Some(&all)).is_err());
    }

    #[test]
    fn test_intoto_attestation_records_payload() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let predicate_type = "https://slsa.dev/provenance/v1";
        let envelope = sign_envelope(&statement_json(IMAGE_DIGEST, predicate_type), &key, None);

        let mut api = FakeApi::default();
        attach_envelope(&mut api, IMAGE_DIGEST, INTOTO_ARTIFACT_TYPE, &envelope, None);
        let image = image_data(api);

        let attestation = Attestation {
            name: "provenance".to_string(),
            spec: AttestationSpec::InToto {
                predicate_type: predicate_type.to_string(),
            },
        };
        CosignVerifier::new()
            .verify_attestation_signature(&image, &attestation, &key_attestor(&key))
            .unwrap();

        let payload = image.verified_payload(predicate_type).unwrap();
        assert_eq!(payload["predicate"]["verified"], true);
    }

    #[test]
    fn test_intoto_predicate_type_filter() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let envelope =
            sign_envelope(&statement_json(IMAGE_DIGEST, "https://other.example/v1"), &key, None);

        let mut api = FakeApi::default();
        attach_envelope(&mut api, IMAGE_DIGEST, INTOTO_ARTIFACT_TYPE, &envelope, None);
        let image = image_data(api);

        let attestation = Attestation {
            name: "provenance".to_string(),
            spec: AttestationSpec::InToto {
                predicate_type: "https://slsa.dev/provenance/v1".to_string(),
            },
        };
        let err = CosignVerifier::new()
            .verify_attestation_signature(&image, &attestation, &key_attestor(&key))
            .unwrap_err();
        assert!(matches!(err, VerifyError::NoSignatures { .. }));
    }

    #[test]
    fn test_bundle_verification_with_log_key() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let log_key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let envelope = sign_envelope(
            &statement_json(IMAGE_DIGEST, "cosign.sigstore.dev/message"),
            &key,
            Some(&log_key),
        );

        let mut api = FakeApi::default();
        attach_envelope(&mut api, IMAGE_DIGEST, SIGNATURE_ARTIFACT_TYPE, &envelope, None);
        let image = image_data(api);

        let mut attestor = key_attestor(&key);
        attestor.ctlog = Some(CtLog {
            url: None,
            pubkey: Some(
                log_key
                    .verifying_key()
                    .to_public_key_pem(Default::default())
                    .unwrap(),
            ),
            insecure_ignore_tlog: false,
            tuf_mirrors: Vec::new(),
        });

        CosignVerifier::new()
            .verify_image_signature(&image, &attestor)
            .unwrap();
    }

    #[test]
    fn test_bundle_required_when_log_enabled() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let log_key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        // Envelope signed correctly but without a log bundle.
        let envelope = sign_envelope(
            &statement_json(IMAGE_DIGEST, "cosign.sigstore.dev/message"),
            &key,
            None,
        );

        let mut api = FakeApi::default();
        attach_envelope(&mut api, IMAGE_DIGEST, SIGNATURE_ARTIFACT_TYPE, &envelope, None);
        let image = image_data(api);

        let mut attestor = key_attestor(&key);
        attestor.ctlog = Some(CtLog {
            url: None,
            pubkey: Some(
                log_key
                    .verifying_key()
                    .to_public_key_pem(Default::default())
                    .unwrap(),
            ),
            insecure_ignore_tlog: false,
            tuf_mirrors: Vec::new(),
        });

        let err = CosignVerifier::new()
            .verify_image_signature(&image, &attestor)
            .unwrap_err();
        assert!(matches!(err, VerifyError::VerificationFailed { .. }));
    }

    #[test]
    fn test_attestor_without_material_rejected() {
        let image = image_data(FakeApi::default());
        let attestor = CosignAttestor {
            key: None,
            certificate: None,
            keyless: None,
            ctlog: Some(CtLog {
                url: None,
                pubkey: None,
                insecure_ignore_tlog: true,
                tuf_mirrors: Vec::new(),
            }),
            annotations: BTreeMap::new(),
        };

        let err = CosignVerifier::new()
            .verify_image_signature(&image, &attestor)
            .unwrap_err();
        assert!(matches!(err, VerifyError::InvalidAttestor { .. }));
    }
}
