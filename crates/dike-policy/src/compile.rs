//! Policy compilation.
//!
//! Compilation turns an [`ImagePolicy`] document into a [`CompiledPolicy`]:
//! every Rego expression is parse-checked up front with its field path, so
//! admission-time evaluation never discovers a syntax error. Compilation
//! also rejects duplicate attestor and attestation names, which would make
//! name lookups from validation expressions ambiguous.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use dike_core::policy::{
    Attestation, Attestor, CredentialSources, FailurePolicy, ImagePolicy, PolicyException,
};

use crate::engine::ExprProgram;
use crate::error::{PolicyError, Result};
use crate::rules::CompiledImageRule;

/// A compiled match condition.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    /// Condition name, reported when evaluation errors.
    pub name: String,

    /// The compiled boolean program.
    pub program: ExprProgram,
}

/// A compiled image extractor.
#[derive(Debug, Clone)]
pub struct CompiledExtractor {
    /// Extractor name; keys the image map exposed to validations.
    pub name: String,

    /// The compiled program producing a string or list of strings.
    pub program: ExprProgram,
}

/// A compiled validation.
#[derive(Debug, Clone)]
pub struct CompiledValidation {
    /// The compiled boolean program.
    pub program: ExprProgram,

    /// Static failure message.
    pub message: Option<String>,

    /// Compiled dynamic message program, preferred over `message` when it
    /// yields a string.
    pub message_program: Option<ExprProgram>,
}

/// A compiled policy exception.
#[derive(Debug, Clone)]
pub struct CompiledException {
    /// Exception name, reported in the outcome.
    pub name: String,

    /// Compiled conditions; the exception applies when all hold.
    pub conditions: Vec<CompiledCondition>,
}

/// A policy ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    /// Policy name.
    pub name: String,

    /// Error handling mode for match conditions.
    pub failure_policy: FailurePolicy,

    /// Compiled match conditions, ANDed together.
    pub match_conditions: Vec<CompiledCondition>,

    /// Compiled exceptions bound to this policy.
    pub exceptions: Vec<CompiledException>,

    /// Compiled image extractors, in declaration order.
    pub image_extractors: Vec<CompiledExtractor>,

    /// Compiled image rules, in declaration order.
    pub image_rules: Vec<CompiledImageRule>,

    /// Compiled validations, in declaration order.
    pub validations: Vec<CompiledValidation>,

    /// Attestors by name, shared with the extension closures.
    pub attestors: Arc<BTreeMap<String, Attestor>>,

    /// Attestations by name, shared with the extension closures.
    pub attestations: Arc<BTreeMap<String, Attestation>>,

    /// Registry credential configuration.
    pub credentials: CredentialSources,
}

/// Compiles policies and their exceptions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyCompiler;

impl PolicyCompiler {
    /// Creates a compiler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Compiles a policy together with the exceptions that name it.
    ///
    /// Only exceptions relevant to this policy should be passed; the caller
    /// owns that association.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::CompileError`] for any unparsable expression
    /// or duplicate attestor/attestation name, with the field path of the
    /// offending declaration.
    pub fn compile(
        &self,
        policy: &ImagePolicy,
        exceptions: &[PolicyException],
    ) -> Result<CompiledPolicy> {
        let name = &policy.name;
        let spec = &policy.spec;

        let match_conditions = spec
            .match_conditions
            .iter()
            .enumerate()
            .map(|(i, condition)| {
                let path = format!("spec.matchConditions[{i}].expression");
                Ok(CompiledCondition {
                    name: condition.name.clone(),
                    program: ExprProgram::compile(name, &path, &condition.expression)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let image_extractors = spec
            .image_extractors
            .iter()
            .enumerate()
            .map(|(i, extractor)| {
                let path = format!("spec.imageExtractors[{i}].expression");
                Ok(CompiledExtractor {
                    name: extractor.name.clone(),
                    program: ExprProgram::compile(name, &path, &extractor.expression)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let image_rules = spec
            .image_rules
            .iter()
            .enumerate()
            .map(|(i, rule)| CompiledImageRule::compile(name, i, rule))
            .collect::<Result<Vec<_>>>()?;

        let validations = spec
            .validations
            .iter()
            .enumerate()
            .map(|(i, validation)| {
                let path = format!("spec.validations[{i}].expression");
                let program = ExprProgram::compile(name, &path, &validation.expression)?;
                let message_program = validation
                    .message_expression
                    .as_deref()
                    .map(|source| {
                        let path = format!("spec.validations[{i}].messageExpression");
                        ExprProgram::compile(name, &path, source)
                    })
                    .transpose()?;
                Ok(CompiledValidation {
                    program,
                    message: validation.message.clone(),
                    message_program,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let attestors = index_by_name(
            name,
            spec.attestors.iter().map(|a| (a.name.clone(), a.clone())),
            "spec.attestors",
        )?;
        let attestations = index_by_name(
            name,
            spec.attestations.iter().map(|a| (a.name.clone(), a.clone())),
            "spec.attestations",
        )?;

        let exceptions = exceptions
            .iter()
            .map(|exception| {
                let conditions = exception
                    .match_conditions
                    .iter()
                    .enumerate()
                    .map(|(i, condition)| {
                        let path = format!(
                            "exception({}).matchConditions[{i}].expression",
                            exception.name
                        );
                        Ok(CompiledCondition {
                            name: condition.name.clone(),
                            program: ExprProgram::compile(name, &path, &condition.expression)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(CompiledException {
                    name: exception.name.clone(),
                    conditions,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            policy = %name,
            conditions = match_conditions.len(),
            extractors = image_extractors.len(),
            validations = validations.len(),
            "Policy compiled"
        );

        Ok(CompiledPolicy {
            name: name.clone(),
            failure_policy: spec.failure_policy,
            match_conditions,
            exceptions,
            image_extractors,
            image_rules,
            validations,
            attestors: Arc::new(attestors),
            attestations: Arc::new(attestations),
            credentials: spec.credentials.clone(),
        })
    }
}

fn index_by_name<T>(
    policy: &str,
    entries: impl Iterator<Item = (String, T)>,
    field: &str,
) -> Result<BTreeMap<String, T>> {
    let mut map = BTreeMap::new();
    for (index, (name, value)) in entries.enumerate() {
        if map.insert(name.clone(), value).is_some() {
            return Err(PolicyError::CompileError {
                policy: policy.to_string(),
                path: format!("{field}[{index}].name"),
                message: format!("duplicate name '{name}'"),
            });
        }
    }
    Ok(map)
}
