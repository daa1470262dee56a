//! Admission-time policy evaluation.
//!
//! One [`PolicyEvaluator`] serves many evaluations; each call builds a
//! fresh [`ImageContext`] so verified state never leaks between admission
//! requests. Evaluation is a fixed state machine:
//!
//! 1. match conditions (ANDed, failure policy governs their errors),
//! 2. exception check,
//! 3. image extraction,
//! 4. image-rule filtering,
//! 5. batch prefetch of the filtered images,
//! 6. validations strictly in declaration order.
//!
//! A `false` validation is a verdict ([`EvaluationOutcome::Fail`]); a
//! runtime error or non-boolean result is
//! [`PolicyError::EvaluationError`], so callers can tell "policy said no"
//! apart from "policy could not be evaluated".

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, instrument};

use dike_registry::{
    CacheLimits, CredentialResolver, ImageContext, ImageFetcher, RegistryApi, RegistryOptions,
};
use dike_verifier::{CosignVerifier, NotaryVerifier};

use crate::compile::{CompiledCondition, CompiledPolicy, CompiledValidation};
use crate::engine::{EvalOutcome, ExprEvaluator};
use crate::error::{PolicyError, Result};
use crate::extensions::VerificationEnv;
use crate::rules::match_image;

/// Annotation recording the per-policy outcome on the admitted resource.
pub const OUTCOME_ANNOTATION: &str = "dike.io/verify-images";

/// The resource under admission.
#[derive(Debug, Clone)]
pub enum AdmissionInput {
    /// A Kubernetes-style admission request.
    Kube {
        /// The object under admission.
        object: Value,
        /// The prior version of the object, if any.
        old_object: Option<Value>,
        /// The admission request metadata (operation, resource, namespace).
        request: Value,
        /// The namespace object, when available.
        namespace_object: Option<Value>,
    },

    /// A bare JSON document, exposed as `input.object` only.
    Json(Value),
}

impl AdmissionInput {
    /// The `input` document bound during expression evaluation.
    #[must_use]
    pub fn bindings(&self) -> Value {
        match self {
            Self::Kube {
                object,
                old_object,
                request,
                namespace_object,
            } => json!({
                "object": object,
                "oldObject": old_object.clone().unwrap_or(Value::Null),
                "request": request,
                "namespaceObject": namespace_object.clone().unwrap_or(Value::Null),
            }),
            Self::Json(value) => json!({ "object": value }),
        }
    }

    /// The object the annotation patch applies to.
    #[must_use]
    pub const fn object(&self) -> &Value {
        match self {
            Self::Kube { object, .. } | Self::Json(object) => object,
        }
    }
}

/// Terminal state of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationOutcome {
    /// Every validation held.
    Pass,

    /// A validation evaluated to `false`.
    Fail {
        /// Zero-based index of the failed validation.
        index: usize,
        /// The resolved failure message.
        message: String,
    },

    /// The resource matched one or more policy exceptions.
    ExceptionMatched {
        /// Names of the matching exceptions.
        exceptions: Vec<String>,
    },

    /// The policy's match conditions did not select this resource.
    NoMatch,
}

/// The outcome of evaluating one policy against one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    /// The policy name.
    pub policy: String,

    /// The terminal state.
    pub outcome: EvaluationOutcome,

    /// Extracted images by extractor name, after rule filtering.
    pub images: BTreeMap<String, Vec<String>>,
}

impl EvaluationResult {
    /// Whether the resource should be admitted under this policy.
    #[must_use]
    pub fn passed(&self) -> bool {
        !matches!(self.outcome, EvaluationOutcome::Fail { .. })
    }

    /// A one-line human-readable report for webhook responses.
    #[must_use]
    pub fn report(&self) -> String {
        match &self.outcome {
            EvaluationOutcome::Pass => format!("policy '{}' passed", self.policy),
            EvaluationOutcome::Fail { index, message } => {
                format!("policy '{}' failed validation {index}: {message}", self.policy)
            }
            EvaluationOutcome::ExceptionMatched { exceptions } => format!(
                "policy '{}' skipped by exception(s): {}",
                self.policy,
                exceptions.join(", ")
            ),
            EvaluationOutcome::NoMatch => {
                format!("policy '{}' did not match the resource", self.policy)
            }
        }
    }

    /// Builds the JSON-patch operation recording this outcome as a resource
    /// annotation.
    ///
    /// When the object has no `/metadata/annotations` map the patch adds
    /// the whole map; otherwise it adds (or replaces) the single outcome
    /// key inside the existing map.
    #[must_use]
    pub fn annotation_patch(&self, object: &Value) -> Value {
        let value = json!({
            "policy": self.policy,
            "passed": self.passed(),
            "report": self.report(),
        })
        .to_string();

        let has_annotations = object
            .pointer("/metadata/annotations")
            .is_some_and(Value::is_object);

        if has_annotations {
            // `/` inside a JSON-pointer segment escapes as `~1`.
            let escaped = OUTCOME_ANNOTATION.replace('~', "~0").replace('/', "~1");
            json!({
                "op": "add",
                "path": format!("/metadata/annotations/{escaped}"),
                "value": value,
            })
        } else {
            json!({
                "op": "add",
                "path": "/metadata/annotations",
                "value": { OUTCOME_ANNOTATION: value },
            })
        }
    }
}

/// Evaluates compiled policies against admission requests.
pub struct PolicyEvaluator {
    client: Arc<dyn RegistryApi>,
    resolver: CredentialResolver,
    cosign: CosignVerifier,
    notary: NotaryVerifier,
    limits: CacheLimits,
    allow_insecure_registries: bool,
}

impl std::fmt::Debug for PolicyEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEvaluator")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl PolicyEvaluator {
    /// Creates an evaluator over a registry client and credential resolver.
    #[must_use]
    pub fn new(client: Arc<dyn RegistryApi>, resolver: CredentialResolver) -> Self {
        Self {
            client,
            resolver,
            cosign: CosignVerifier::new(),
            notary: NotaryVerifier::new(),
            limits: CacheLimits::default(),
            allow_insecure_registries: false,
        }
    }

    /// Permits policies that declare `allowInsecureRegistry`.
    ///
    /// The TLS posture of the registry client is fixed at construction, so
    /// a policy cannot weaken it at evaluation time. An evaluator built
    /// over an insecure-capable client opts in here; otherwise such
    /// policies are rejected instead of being silently served over TLS.
    #[must_use]
    pub const fn with_insecure_registries(mut self, allow: bool) -> Self {
        self.allow_insecure_registries = allow;
        self
    }

    /// Replaces the cosign backend, e.g. to install a key resolver.
    #[must_use]
    pub fn with_cosign_verifier(mut self, cosign: CosignVerifier) -> Self {
        self.cosign = cosign;
        self
    }

    /// Overrides the cache and prefetch limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: CacheLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Evaluates one compiled policy against one admission input.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::EvaluationError`] for runtime expression
    /// failures (subject to the failure policy for match conditions only)
    /// and [`PolicyError::Registry`] when image prefetch fails.
    #[instrument(skip(self, policy, input), fields(policy = %policy.name))]
    pub fn evaluate(
        &self,
        policy: &CompiledPolicy,
        input: &AdmissionInput,
    ) -> Result<EvaluationResult> {
        let bindings = input.bindings();

        // 1. Match conditions.
        match check_conditions(policy, &policy.match_conditions, &bindings) {
            Ok(true) => {}
            Ok(false) => return Ok(no_match(policy)),
            Err(e) => {
                return match policy.failure_policy {
                    dike_core::policy::FailurePolicy::Ignore => {
                        debug!(error = %e, "Match condition errored; policy set to ignore");
                        Ok(no_match(policy))
                    }
                    dike_core::policy::FailurePolicy::Fail => Err(e),
                };
            }
        }

        // 2. Exceptions. Their condition errors always surface.
        let mut matched_exceptions = Vec::new();
        for exception in &policy.exceptions {
            if check_conditions(policy, &exception.conditions, &bindings)? {
                matched_exceptions.push(exception.name.clone());
            }
        }
        if !matched_exceptions.is_empty() {
            debug!(exceptions = ?matched_exceptions, "Resource excepted");
            return Ok(EvaluationResult {
                policy: policy.name.clone(),
                outcome: EvaluationOutcome::ExceptionMatched {
                    exceptions: matched_exceptions,
                },
                images: BTreeMap::new(),
            });
        }

        // 3. Image extraction.
        let extracted = extract_images(policy, &bindings)?;

        // 4. Rule filtering.
        let mut images = BTreeMap::new();
        let mut to_fetch = Vec::new();
        let mut seen = HashSet::new();
        for (name, list) in extracted {
            let mut kept = Vec::new();
            for image in list {
                if match_image(&policy.name, &policy.image_rules, &image)? {
                    if seen.insert(image.clone()) {
                        to_fetch.push(image.clone());
                    }
                    kept.push(image);
                }
            }
            images.insert(name, kept);
        }

        // 5. Batch prefetch; any fetch failure aborts the evaluation.
        if policy.credentials.allow_insecure_registry && !self.allow_insecure_registries {
            return Err(PolicyError::EvaluationError {
                policy: policy.name.clone(),
                message: "policy declares allowInsecureRegistry but the registry client \
                          does not permit insecure registries"
                    .to_string(),
            });
        }
        let context = self.build_context(policy);
        context.add_images(&to_fetch)?;

        // 6. Validations.
        let outcome = self.run_validations(policy, &context, &bindings, &images)?;

        Ok(EvaluationResult {
            policy: policy.name.clone(),
            outcome,
            images,
        })
    }

    fn build_context(&self, policy: &CompiledPolicy) -> Arc<ImageContext> {
        let options = RegistryOptions::from_credentials(&policy.credentials);
        let fetcher = ImageFetcher::new(
            Arc::clone(&self.client),
            self.resolver.clone(),
            self.limits,
        );
        Arc::new(ImageContext::new(fetcher, options, self.limits))
    }

    fn run_validations(
        &self,
        policy: &CompiledPolicy,
        context: &Arc<ImageContext>,
        bindings: &Value,
        images: &BTreeMap<String, Vec<String>>,
    ) -> Result<EvaluationOutcome> {
        let mut evaluator = ExprEvaluator::new();

        let env = VerificationEnv::new(
            Arc::clone(context),
            self.cosign.clone(),
            self.notary,
            Arc::clone(&policy.attestors),
            Arc::clone(&policy.attestations),
        );
        env.register(&policy.name, &mut evaluator)?;

        for validation in &policy.validations {
            evaluator.add_program(&policy.name, &validation.program)?;
            if let Some(program) = &validation.message_program {
                evaluator.add_program(&policy.name, program)?;
            }
        }

        let mut input = bindings.clone();
        if let Some(map) = input.as_object_mut() {
            map.insert("images".to_string(), json!(images));
        }
        evaluator.set_input(input);

        for (index, validation) in policy.validations.iter().enumerate() {
            match evaluator.eval(&policy.name, &validation.program)? {
                EvalOutcome::Bool(true) => {}
                EvalOutcome::Bool(false) => {
                    let message = resolve_message(policy, &mut evaluator, index, validation);
                    debug!(index, message, "Validation failed");
                    return Ok(EvaluationOutcome::Fail { index, message });
                }
                other => {
                    return Err(PolicyError::EvaluationError {
                        policy: policy.name.clone(),
                        message: format!(
                            "validation {index} produced a non-boolean result: {other:?}"
                        ),
                    });
                }
            }
        }

        Ok(EvaluationOutcome::Pass)
    }
}

/// Evaluates a condition set, ANDed. All conditions run even after a
/// failure so every error is reported at once.
fn check_conditions(
    policy: &CompiledPolicy,
    conditions: &[CompiledCondition],
    bindings: &Value,
) -> Result<bool> {
    if conditions.is_empty() {
        return Ok(true);
    }

    let mut evaluator = ExprEvaluator::new();
    for condition in conditions {
        evaluator.add_program(&policy.name, &condition.program)?;
    }
    evaluator.set_input(bindings.clone());

    let mut matched = true;
    let mut errors = Vec::new();
    for condition in conditions {
        match evaluator.eval(&policy.name, &condition.program) {
            Ok(EvalOutcome::Bool(true)) => {}
            Ok(EvalOutcome::Bool(false)) => matched = false,
            Ok(other) => errors.push(format!(
                "condition '{}' produced a non-boolean result: {other:?}",
                condition.name
            )),
            Err(e) => errors.push(format!("condition '{}': {e}", condition.name)),
        }
    }

    if errors.is_empty() {
        Ok(matched)
    } else {
        Err(PolicyError::EvaluationError {
            policy: policy.name.clone(),
            message: errors.join("; "),
        })
    }
}

fn extract_images(
    policy: &CompiledPolicy,
    bindings: &Value,
) -> Result<BTreeMap<String, Vec<String>>> {
    if policy.image_extractors.is_empty() {
        return Ok(BTreeMap::new());
    }

    let mut evaluator = ExprEvaluator::new();
    for extractor in &policy.image_extractors {
        evaluator.add_program(&policy.name, &extractor.program)?;
    }
    evaluator.set_input(bindings.clone());

    let mut extracted = BTreeMap::new();
    for extractor in &policy.image_extractors {
        let images = match evaluator.eval(&policy.name, &extractor.program)? {
            EvalOutcome::String(image) => vec![image],
            EvalOutcome::Value(Value::Array(items)) => items
                .into_iter()
                .map(|item| {
                    item.as_str().map(ToString::to_string).ok_or_else(|| {
                        PolicyError::EvaluationError {
                            policy: policy.name.clone(),
                            message: format!(
                                "extractor '{}' produced a non-string image entry",
                                extractor.name
                            ),
                        }
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            EvalOutcome::Undefined => Vec::new(),
            other => {
                return Err(PolicyError::EvaluationError {
                    policy: policy.name.clone(),
                    message: format!(
                        "extractor '{}' must produce a string or list of strings, got {other:?}",
                        extractor.name
                    ),
                });
            }
        };
        extracted.insert(extractor.name.clone(), images);
    }
    Ok(extracted)
}

/// Resolves the failure message for a failed validation: the message
/// expression when it yields a string, the static message otherwise,
/// with a generic fallback.
fn resolve_message(
    policy: &CompiledPolicy,
    evaluator: &mut ExprEvaluator,
    index: usize,
    validation: &CompiledValidation,
) -> String {
    if let Some(program) = &validation.message_program {
        match evaluator.eval(&policy.name, program) {
            Ok(EvalOutcome::String(message)) => return message,
            Ok(other) => {
                debug!(index, ?other, "Message expression did not yield a string");
            }
            Err(e) => {
                debug!(index, error = %e, "Message expression errored");
            }
        }
    }
    validation
        .message
        .clone()
        .unwrap_or_else(|| format!("validation {index} of policy '{}' failed", policy.name))
}

fn no_match(policy: &CompiledPolicy) -> EvaluationResult {
    EvaluationResult {
        policy: policy.name.clone(),
        outcome: EvaluationOutcome::NoMatch,
        images: BTreeMap::new(),
    }
}
