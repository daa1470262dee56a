//! Image verification policy document model.
//!
//! An [`ImagePolicy`] declares which resources it applies to, how container
//! image strings are extracted from them, which trust configurations
//! ([`Attestor`]) and verifiable artifacts ([`Attestation`]) exist, and the
//! validation expressions evaluated against the verification results.
//!
//! Documents deserialize from YAML or JSON. Expressions are Rego; their
//! compilation lives in `dike-policy`, this module only carries the source
//! text.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A named image verification policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePolicy {
    /// Policy name, used in reported outcomes and the result annotation.
    pub name: String,

    /// Policy specification.
    pub spec: PolicySpec,
}

impl ImagePolicy {
    /// Loads a policy from a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not deserialize.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Loads a policy from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not deserialize.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Looks up an attestor by name.
    #[must_use]
    pub fn attestor(&self, name: &str) -> Option<&Attestor> {
        self.spec.attestors.iter().find(|a| a.name == name)
    }

    /// Looks up an attestation by name.
    #[must_use]
    pub fn attestation(&self, name: &str) -> Option<&Attestation> {
        self.spec.attestations.iter().find(|a| a.name == name)
    }
}

/// Specification body of an [`ImagePolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicySpec {
    /// What to do when match-condition evaluation itself errors.
    pub failure_policy: FailurePolicy,

    /// Conditions deciding whether the policy applies to a resource.
    /// An empty list means the policy always matches.
    pub match_conditions: Vec<MatchCondition>,

    /// Named expressions extracting image strings from the resource.
    pub image_extractors: Vec<ImageExtractor>,

    /// Rules filtering which extracted images are verified.
    pub image_rules: Vec<ImageRule>,

    /// Named trust configurations.
    pub attestors: Vec<Attestor>,

    /// Named verifiable artifacts.
    pub attestations: Vec<Attestation>,

    /// Validation programs, evaluated strictly in declaration order.
    pub validations: Vec<Validation>,

    /// Registry credential configuration used when fetching image metadata.
    pub credentials: CredentialSources,
}

/// Failure handling for match-condition evaluation errors.
///
/// This mode governs only match-condition errors; verification and compile
/// errors are never absorbed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FailurePolicy {
    /// Treat an erroring match condition as a silent non-match.
    Ignore,
    /// Surface the evaluation error to the caller.
    #[default]
    Fail,
}

/// A named boolean expression over the admission context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCondition {
    /// Condition name, reported when the expression errors.
    pub name: String,

    /// Rego expression over `input.object`, `input.oldObject`,
    /// `input.request`, and `input.namespaceObject`.
    pub expression: String,
}

/// A named expression producing a list of image strings from the resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageExtractor {
    /// Extractor name; keys the extracted image map exposed to validations.
    pub name: String,

    /// Rego expression over `input.object` yielding a list of strings.
    pub expression: String,
}

/// A rule deciding whether an extracted image is subject to verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageRule {
    /// Shell-style wildcard over the full image string.
    Glob {
        /// The wildcard pattern (e.g. `ghcr.io/org/*`).
        glob: String,
    },

    /// Boolean Rego expression with the image string bound to `input.ref`.
    Expression {
        /// The expression source.
        expression: String,
    },
}

/// A named trust configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestor {
    /// Attestor name, unique within a policy.
    pub name: String,

    /// The trust model this attestor uses.
    #[serde(flatten)]
    pub spec: AttestorSpec,
}

/// Trust model variants for an [`Attestor`].
///
/// Modeled as a tagged union so backend dispatch is a `match`, not a set of
/// boolean predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttestorSpec {
    /// Keyed or keyless signature-and-transparency-log trust.
    Cosign(CosignAttestor),

    /// Certificate-chain / trust-store trust.
    Notary(NotaryAttestor),
}

/// Cosign-style trust configuration.
///
/// Exactly one of `key`, `certificate`, or `keyless` is expected; the
/// verifier rejects configurations providing none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CosignAttestor {
    /// Key-based verification material.
    pub key: Option<CosignKey>,

    /// Certificate-based verification material.
    pub certificate: Option<CosignCertificate>,

    /// Keyless (identity-based) verification configuration.
    pub keyless: Option<Keyless>,

    /// Transparency-log options.
    pub ctlog: Option<CtLog>,

    /// Annotations that must appear, with these exact values, in every
    /// accepted signature. Extra signature annotations are ignored.
    pub annotations: BTreeMap<String, String>,
}

/// Key material for cosign key-based verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CosignKey {
    /// Inline PEM-encoded public key.
    pub data: Option<String>,

    /// Reference to externally managed key material (KMS URI or
    /// `k8s://namespace/name` secret reference).
    pub reference: Option<String>,

    /// Hash algorithm applied to the payload before signature verification.
    pub hash_algorithm: HashAlgorithm,
}

/// Certificate material for cosign certificate-based verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CosignCertificate {
    /// PEM-encoded signing certificate.
    pub certificate: Option<String>,

    /// PEM-encoded chain up to a trusted root.
    pub certificate_chain: Option<String>,
}

/// Keyless verification configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Keyless {
    /// Accepted signer identities. A signature is accepted when any entry
    /// matches.
    pub identities: Vec<IdentityMatcher>,

    /// PEM root certificate pool overriding the ecosystem's public root
    /// authority.
    pub roots: Option<String>,
}

/// One accepted (issuer, subject) identity, exact or regex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct IdentityMatcher {
    /// Exact OIDC issuer.
    pub issuer: Option<String>,

    /// Exact signer subject.
    pub subject: Option<String>,

    /// Issuer regular expression, tried when `issuer` is unset.
    pub issuer_regex: Option<String>,

    /// Subject regular expression, tried when `subject` is unset.
    pub subject_regex: Option<String>,
}

/// Transparency-log options for cosign verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CtLog {
    /// Transparency-log base URL. Defaults to the public log.
    pub url: Option<String>,

    /// Explicit PEM log public key, skipping the fresh fetch.
    pub pubkey: Option<String>,

    /// Skip transparency-log and timestamp checks entirely. Required when
    /// no trusted-material bundle is available for the log.
    pub insecure_ignore_tlog: bool,

    /// Update-framework mirrors consulted, in order, for the trust root.
    /// The public mirror is always tried last.
    pub tuf_mirrors: Vec<String>,
}

/// Notary-style trust configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotaryAttestor {
    /// PEM bundle of trust-anchor certificates.
    pub certs: String,

    /// PEM bundle of timestamp-authority certificates.
    #[serde(default)]
    pub tsa_certs: Option<String>,
}

/// A named description of a verifiable artifact attached to an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    /// Attestation name, unique within a policy.
    pub name: String,

    /// How the artifact is located and interpreted.
    #[serde(flatten)]
    pub spec: AttestationSpec,
}

/// Artifact location/interpretation variants for an [`Attestation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttestationSpec {
    /// An in-toto statement fetched via a signed envelope.
    #[serde(rename = "intoto")]
    InToto {
        /// The in-toto predicate type (e.g. `https://slsa.dev/provenance/v1`).
        #[serde(rename = "predicateType")]
        predicate_type: String,
    },

    /// An OCI referrer artifact fetched via the registry referrers API.
    Referrer {
        /// The referrer artifact type (e.g.
        /// `application/vnd.cyclonedx+json`).
        #[serde(rename = "type")]
        artifact_type: String,
    },
}

impl AttestationSpec {
    /// Returns the artifact or predicate type string this spec selects on.
    #[must_use]
    pub fn type_string(&self) -> &str {
        match self {
            Self::InToto { predicate_type } => predicate_type,
            Self::Referrer { artifact_type } => artifact_type,
        }
    }
}

/// One validation program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    /// Boolean Rego expression over the verification extension functions
    /// and the extracted image map.
    pub expression: String,

    /// Static failure message.
    #[serde(default)]
    pub message: Option<String>,

    /// Expression producing a dynamic failure message; takes precedence
    /// over `message` when it evaluates to a string.
    #[serde(default)]
    pub message_expression: Option<String>,
}

/// Registry credential configuration carried by a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialSources {
    /// Names of image pull secrets, resolved through the secret lister.
    pub secrets: Vec<String>,

    /// Named cloud credential helpers (e.g. `aws`, `gcp`, `azure`).
    pub providers: Vec<String>,

    /// Allow plain-HTTP/unverified-TLS registries.
    pub allow_insecure_registry: bool,
}

/// A policy exception document.
///
/// A resource matching any exception's conditions skips validation for the
/// policies the exception names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyException {
    /// Exception name, reported in the evaluation result.
    pub name: String,

    /// Conditions under which the exception applies.
    #[serde(default)]
    pub match_conditions: Vec<MatchCondition>,
}

/// Hash algorithms accepted for key-based signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgorithm {
    /// SHA-224.
    Sha224,
    /// SHA-256 (default).
    #[default]
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY_YAML: &str = r#"
name: require-signed-images
spec:
  failurePolicy: Fail
  matchConditions:
    - name: pods-only
      expression: 'input.request.resource.resource == "pods"'
  imageExtractors:
    - name: containers
      expression: '[c.image | c := input.object.spec.containers[_]]'
  imageRules:
    - glob: "ghcr.io/acme/*"
  attestors:
    - name: keyed
      cosign:
        key:
          data: |
            -----BEGIN PUBLIC KEY-----
            MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAE...
            -----END PUBLIC KEY-----
        ctlog:
          insecureIgnoreTlog: true
  attestations:
    - name: provenance
      intoto:
        predicateType: https://slsa.dev/provenance/v1
    - name: sbom
      referrer:
        type: application/vnd.cyclonedx+json
  validations:
    - expression: 'verify_image_signatures(input.images.containers[0], ["keyed"]) > 0'
      message: image is not signed by the release key
"#;

    #[test]
    fn test_policy_from_yaml() {
        let policy = ImagePolicy::from_yaml(POLICY_YAML).unwrap();

        assert_eq!(policy.name, "require-signed-images");
        assert_eq!(policy.spec.failure_policy, FailurePolicy::Fail);
        assert_eq!(policy.spec.match_conditions.len(), 1);
        assert_eq!(policy.spec.validations.len(), 1);
    }

    #[test]
    fn test_attestor_is_tagged_by_kind() {
        let policy = ImagePolicy::from_yaml(POLICY_YAML).unwrap();
        let attestor = policy.attestor("keyed").unwrap();

        match &attestor.spec {
            AttestorSpec::Cosign(cosign) => {
                let key = cosign.key.as_ref().unwrap();
                assert!(key.data.as_ref().unwrap().contains("BEGIN PUBLIC KEY"));
                assert_eq!(key.hash_algorithm, HashAlgorithm::Sha256);
                assert!(cosign.ctlog.as_ref().unwrap().insecure_ignore_tlog);
            }
            AttestorSpec::Notary(_) => panic!("expected cosign attestor"),
        }
    }

    #[test]
    fn test_attestation_kinds() {
        let policy = ImagePolicy::from_yaml(POLICY_YAML).unwrap();

        let provenance = policy.attestation("provenance").unwrap();
        assert_eq!(
            provenance.spec.type_string(),
            "https://slsa.dev/provenance/v1"
        );

        let sbom = policy.attestation("sbom").unwrap();
        assert!(matches!(sbom.spec, AttestationSpec::Referrer { .. }));
    }

    #[test]
    fn test_failure_policy_defaults_to_fail() {
        let policy = ImagePolicy::from_yaml("name: p\nspec: {}\n").unwrap();
        assert_eq!(policy.spec.failure_policy, FailurePolicy::Fail);
    }

    #[test]
    fn test_notary_attestor_roundtrip() {
        let attestor = Attestor {
            name: "notation".to_string(),
            spec: AttestorSpec::Notary(NotaryAttestor {
                certs: "-----BEGIN CERTIFICATE-----\n...".to_string(),
                tsa_certs: None,
            }),
        };

        let json = serde_json::to_string(&attestor).unwrap();
        assert!(json.contains(r#""notary""#));

        let back: Attestor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, attestor);
    }

    #[test]
    fn test_image_rule_variants() {
        let yaml = r#"
- glob: "*"
- expression: 'startswith(input.ref, "ghcr.io/")'
"#;
        let rules: Vec<ImageRule> = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(rules[0], ImageRule::Glob { .. }));
        assert!(matches!(rules[1], ImageRule::Expression { .. }));
    }
}
