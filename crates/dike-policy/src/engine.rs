//! Rego expression programs.
//!
//! Every policy expression (match condition, image extractor, expression
//! image rule, validation, message expression) is wrapped into a tiny Rego
//! module with a single `result` rule and validated at compile time by
//! parsing it on a scratch engine. Evaluation rebuilds an engine per
//! admission call so extension functions can bind to that evaluation's
//! image context.

use serde_json::Value;

use crate::error::{PolicyError, Result};

/// A compiled single-expression program.
///
/// Immutable and reusable; the expression has been parse-checked but
/// carries no evaluation state.
#[derive(Debug, Clone)]
pub struct ExprProgram {
    package: String,
    source: String,
    query: String,
}

impl ExprProgram {
    /// Wraps an expression into a module and parse-checks it.
    ///
    /// `path` names the originating policy field for error reporting and,
    /// sanitized, the generated package.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::CompileError`] when the expression does not
    /// parse as Rego.
    pub fn compile(policy: &str, path: &str, expression: &str) -> Result<Self> {
        let package = format!("dike.{}", sanitize(path));
        // `future.keywords` lets expressions use `in`, `if`, and `every`
        // without their own imports.
        let source =
            format!("package {package}\n\nimport future.keywords\n\nresult := ({expression})\n");
        let query = format!("data.{package}.result");

        // Parse on a throwaway engine so malformed expressions are rejected
        // per policy at compile time, with the field path attached.
        let mut scratch = regorus::Engine::new();
        scratch
            .add_policy(format!("{path}.rego"), source.clone())
            .map_err(|e| PolicyError::CompileError {
                policy: policy.to_string(),
                path: path.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            package,
            source,
            query,
        })
    }

    /// The generated module name.
    #[must_use]
    pub fn module_name(&self) -> String {
        format!("{}.rego", self.package)
    }
}

/// The outcome of evaluating one program.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    /// A boolean result.
    Bool(bool),

    /// A string result.
    String(String),

    /// Any other defined value.
    Value(Value),

    /// The expression was undefined for this input.
    Undefined,
}

/// One evaluation session: a regorus engine with programs, extensions, and
/// input bound for a single admission call.
pub struct ExprEvaluator {
    engine: regorus::Engine,
}

impl std::fmt::Debug for ExprEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExprEvaluator")
    }
}

impl Default for ExprEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExprEvaluator {
    /// Creates an empty evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            engine: regorus::Engine::new(),
        }
    }

    /// Loads a compiled program into the session.
    ///
    /// # Errors
    ///
    /// Fails only if the program no longer parses, which indicates a bug.
    pub fn add_program(&mut self, policy: &str, program: &ExprProgram) -> Result<()> {
        self.engine
            .add_policy(program.module_name(), program.source.clone())
            .map_err(|e| PolicyError::EvaluationError {
                policy: policy.to_string(),
                message: format!("failed to load compiled program: {e}"),
            })?;
        Ok(())
    }

    /// Registers an extension function callable from expressions.
    ///
    /// # Errors
    ///
    /// Fails when the name collides with an existing function.
    pub fn add_extension<F>(&mut self, policy: &str, name: &str, nargs: u8, f: F) -> Result<()>
    where
        F: FnMut(Vec<regorus::Value>) -> anyhow::Result<regorus::Value>
            + Clone
            + Send
            + Sync
            + 'static,
    {
        self.engine
            .add_extension(name.to_string(), nargs, Box::new(f))
            .map_err(|e| PolicyError::EvaluationError {
                policy: policy.to_string(),
                message: format!("failed to register extension '{name}': {e}"),
            })
    }

    /// Binds the `input` document for subsequent evaluations.
    pub fn set_input(&mut self, input: Value) {
        self.engine.set_input(input.into());
    }

    /// Evaluates one loaded program against the current input.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::EvaluationError`] on a runtime error inside
    /// the expression or an extension.
    pub fn eval(&mut self, policy: &str, program: &ExprProgram) -> Result<EvalOutcome> {
        let results = self
            .engine
            .eval_query(program.query.clone(), false)
            .map_err(|e| PolicyError::EvaluationError {
                policy: policy.to_string(),
                message: e.to_string(),
            })?;

        let Some(expression) = results
            .result
            .first()
            .and_then(|r| r.expressions.first())
        else {
            return Ok(EvalOutcome::Undefined);
        };

        let value: Value = serde_json::to_value(&expression.value).map_err(|e| {
            PolicyError::EvaluationError {
                policy: policy.to_string(),
                message: format!("result is not representable as JSON: {e}"),
            }
        })?;

        Ok(match value {
            Value::Bool(b) => EvalOutcome::Bool(b),
            Value::String(s) => EvalOutcome::String(s),
            Value::Null => EvalOutcome::Undefined,
            other => EvalOutcome::Value(other),
        })
    }
}

/// Turns a field path like `spec.validations[2].expression` into a Rego
/// package segment.
fn sanitize(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
