//! Verification extension functions.
//!
//! Validation expressions call into the verifier backends through four
//! extension functions registered on the evaluation engine:
//!
//! * `verify_image_signatures(image, attestors)` — number of listed
//!   attestors whose image signature verified.
//! * `verify_attestation_signatures(image, attestation, attestors)` —
//!   number of listed attestors whose signature over the named attestation
//!   verified.
//! * `get_image_data(image)` — the image's descriptor document.
//! * `extract_payload(image, attestation)` — the decoded payload of a
//!   previously verified attestation.
//!
//! A verification that merely fails contributes zero to the count and is
//! logged; an unknown attestor or attestation name, or an image that was
//! never prefetched, is a configuration error and aborts the evaluation.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _};
use tracing::debug;

use dike_core::policy::{Attestation, Attestor, AttestorSpec};
use dike_registry::{ImageContext, ImageData};
use dike_verifier::{CosignVerifier, NotaryVerifier};

use crate::engine::ExprEvaluator;
use crate::error::Result;

/// Everything the extension closures need: the per-evaluation image
/// context, the verifier backends, and the policy's named trust tables.
#[derive(Clone)]
pub struct VerificationEnv {
    context: Arc<ImageContext>,
    cosign: CosignVerifier,
    notary: NotaryVerifier,
    attestors: Arc<BTreeMap<String, Attestor>>,
    attestations: Arc<BTreeMap<String, Attestation>>,
}

impl std::fmt::Debug for VerificationEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationEnv")
            .field("attestors", &self.attestors.keys())
            .field("attestations", &self.attestations.keys())
            .finish_non_exhaustive()
    }
}

impl VerificationEnv {
    /// Bundles the evaluation state shared by all four functions.
    #[must_use]
    pub fn new(
        context: Arc<ImageContext>,
        cosign: CosignVerifier,
        notary: NotaryVerifier,
        attestors: Arc<BTreeMap<String, Attestor>>,
        attestations: Arc<BTreeMap<String, Attestation>>,
    ) -> Self {
        Self {
            context,
            cosign,
            notary,
            attestors,
            attestations,
        }
    }

    /// Registers the four verification functions on an evaluator.
    ///
    /// # Errors
    ///
    /// Fails when a function name collides with one already registered.
    pub fn register(&self, policy: &str, evaluator: &mut ExprEvaluator) -> Result<()> {
        let env = self.clone();
        evaluator.add_extension(policy, "verify_image_signatures", 2, move |args| {
            let image = string_arg(&args, 0, "verify_image_signatures")?;
            let attestors = string_list_arg(&args, 1, "verify_image_signatures")?;
            let count = env.verify_image_signatures(&image, &attestors)?;
            Ok(regorus::Value::from(serde_json::json!(count)))
        })?;

        let env = self.clone();
        evaluator.add_extension(policy, "verify_attestation_signatures", 3, move |args| {
            let image = string_arg(&args, 0, "verify_attestation_signatures")?;
            let attestation = string_arg(&args, 1, "verify_attestation_signatures")?;
            let attestors = string_list_arg(&args, 2, "verify_attestation_signatures")?;
            let count = env.verify_attestation_signatures(&image, &attestation, &attestors)?;
            Ok(regorus::Value::from(serde_json::json!(count)))
        })?;

        let env = self.clone();
        evaluator.add_extension(policy, "get_image_data", 1, move |args| {
            let image = string_arg(&args, 0, "get_image_data")?;
            let data = env.image(&image)?;
            Ok(regorus::Value::from(data.descriptor_json()))
        })?;

        let env = self.clone();
        evaluator.add_extension(policy, "extract_payload", 2, move |args| {
            let image = string_arg(&args, 0, "extract_payload")?;
            let attestation = string_arg(&args, 1, "extract_payload")?;
            let payload = env.extract_payload(&image, &attestation)?;
            Ok(regorus::Value::from(payload))
        })?;

        Ok(())
    }

    fn image(&self, image: &str) -> anyhow::Result<Arc<ImageData>> {
        self.context
            .get(image)
            .with_context(|| format!("failed to fetch image '{image}'"))
    }

    fn attestor(&self, name: &str) -> anyhow::Result<&Attestor> {
        self.attestors
            .get(name)
            .ok_or_else(|| anyhow!("unknown attestor '{name}'"))
    }

    fn verify_image_signatures(&self, image: &str, attestors: &[String]) -> anyhow::Result<i64> {
        let data = self.image(image)?;

        let mut verified = 0i64;
        for name in attestors {
            let attestor = self.attestor(name)?;
            let outcome = match &attestor.spec {
                AttestorSpec::Cosign(cosign) => self.cosign.verify_image_signature(&data, cosign),
                AttestorSpec::Notary(notary) => self.notary.verify_image_signature(&data, notary),
            };
            match outcome {
                Ok(()) => verified += 1,
                Err(e) => {
                    debug!(image, attestor = %name, error = %e, "Image signature verification failed");
                }
            }
        }
        Ok(verified)
    }

    fn verify_attestation_signatures(
        &self,
        image: &str,
        attestation: &str,
        attestors: &[String],
    ) -> anyhow::Result<i64> {
        let data = self.image(image)?;
        let attestation = self
            .attestations
            .get(attestation)
            .ok_or_else(|| anyhow!("unknown attestation '{attestation}'"))?;

        let mut verified = 0i64;
        for name in attestors {
            let attestor = self.attestor(name)?;
            let outcome = match &attestor.spec {
                AttestorSpec::Cosign(cosign) => {
                    self.cosign
                        .verify_attestation_signature(&data, attestation, cosign)
                }
                AttestorSpec::Notary(notary) => {
                    self.notary
                        .verify_attestation_signature(&data, attestation, notary)
                }
            };
            match outcome {
                Ok(()) => verified += 1,
                Err(e) => {
                    debug!(
                        image,
                        attestation = %attestation.name,
                        attestor = %name,
                        error = %e,
                        "Attestation verification failed"
                    );
                }
            }
        }
        Ok(verified)
    }

    fn extract_payload(&self, image: &str, attestation: &str) -> anyhow::Result<serde_json::Value> {
        let data = self.image(image)?;
        let attestation = self
            .attestations
            .get(attestation)
            .ok_or_else(|| anyhow!("unknown attestation '{attestation}'"))?;

        data.verified_payload(attestation.spec.type_string())
            .ok_or_else(|| {
                anyhow!(
                    "attestation '{}' of image '{image}' has no verified payload; \
                     verify it before extracting",
                    attestation.name
                )
            })
    }
}

fn string_arg(args: &[regorus::Value], index: usize, function: &str) -> anyhow::Result<String> {
    let value = args
        .get(index)
        .ok_or_else(|| anyhow!("{function}: missing argument {index}"))?;
    serde_json::to_value(value)?
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("{function}: argument {index} must be a string"))
}

fn string_list_arg(
    args: &[regorus::Value],
    index: usize,
    function: &str,
) -> anyhow::Result<Vec<String>> {
    let value = args
        .get(index)
        .ok_or_else(|| anyhow!("{function}: missing argument {index}"))?;
    let serde_json::Value::Array(items) = serde_json::to_value(value)? else {
        bail!("{function}: argument {index} must be a list of strings");
    };
    items
        .into_iter()
        .map(|item| {
            item.as_str()
                .map(ToString::to_string)
                .ok_or_else(|| anyhow!("{function}: argument {index} must be a list of strings"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_arg_coercion() {
        let args = vec![regorus::Value::from(serde_json::json!("ghcr.io/org/app"))];
        assert_eq!(
            string_arg(&args, 0, "get_image_data").unwrap(),
            "ghcr.io/org/app"
        );
        assert!(string_arg(&args, 1, "get_image_data").is_err());
    }

    #[test]
    fn test_string_list_arg_coercion() {
        let args = vec![regorus::Value::from(serde_json::json!(["a", "b"]))];
        assert_eq!(
            string_list_arg(&args, 0, "verify_image_signatures").unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );

        let bad = vec![regorus::Value::from(serde_json::json!([1, 2]))];
        assert!(string_list_arg(&bad, 0, "verify_image_signatures").is_err());
    }
}
