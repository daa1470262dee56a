//! Image rule matching.
//!
//! Image rules decide which extracted images are subject to verification.
//! A rule is either a shell-style glob over the full image string or a
//! boolean Rego expression with the image bound to `input.ref`. Rules are
//! evaluated strictly in declaration order; the first match wins.

use serde_json::json;

use dike_core::policy::ImageRule;
use wildmatch::WildMatch;

use crate::engine::{EvalOutcome, ExprEvaluator, ExprProgram};
use crate::error::{PolicyError, Result};

/// A compiled image rule.
#[derive(Debug, Clone)]
pub enum CompiledImageRule {
    /// Shell-style wildcard match over the full image string.
    Glob(WildMatch),

    /// Boolean expression over `input.ref`.
    Expr(ExprProgram),
}

impl CompiledImageRule {
    /// Compiles one rule declaration.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::CompileError`] for an unparsable expression.
    pub fn compile(policy: &str, index: usize, rule: &ImageRule) -> Result<Self> {
        match rule {
            ImageRule::Glob { glob } => Ok(Self::Glob(WildMatch::new(glob))),
            ImageRule::Expression { expression } => {
                let path = format!("spec.imageRules[{index}]");
                ExprProgram::compile(policy, &path, expression).map(Self::Expr)
            }
        }
    }
}

/// Decides whether an image is subject to verification.
///
/// Rules run in declaration order and the first match wins; no match means
/// the image is skipped. An empty rule set matches every image. A runtime
/// error in an expression rule is propagated, never treated as a non-match.
///
/// # Errors
///
/// Returns [`PolicyError::EvaluationError`] when an expression rule errors
/// or yields a non-boolean.
pub fn match_image(policy: &str, rules: &[CompiledImageRule], image: &str) -> Result<bool> {
    if rules.is_empty() {
        return Ok(true);
    }

    for rule in rules {
        match rule {
            CompiledImageRule::Glob(pattern) => {
                if pattern.matches(image) {
                    return Ok(true);
                }
            }
            CompiledImageRule::Expr(program) => {
                let mut evaluator = ExprEvaluator::new();
                evaluator.add_program(policy, program)?;
                evaluator.set_input(json!({ "ref": image }));
                match evaluator.eval(policy, program)? {
                    EvalOutcome::Bool(true) => return Ok(true),
                    EvalOutcome::Bool(false) => {}
                    other => {
                        return Err(PolicyError::EvaluationError {
                            policy: policy.to_string(),
                            message: format!(
                                "image rule for '{image}' produced a non-boolean result: {other:?}"
                            ),
                        });
                    }
                }
            }
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_all(rules: &[ImageRule]) -> Vec<CompiledImageRule> {
        rules
            .iter()
            .enumerate()
            .map(|(i, r)| CompiledImageRule::compile("demo", i, r).unwrap())
            .collect()
    }

    #[test]
    fn test_empty_rules_match_everything() {
        assert!(match_image("demo", &[], "ghcr.io/org/app:v1").unwrap());
    }

    #[test]
    fn test_glob_rule() {
        let rules = compile_all(&[ImageRule::Glob {
            glob: "ghcr.io/org/*".to_string(),
        }]);

        assert!(match_image("demo", &rules, "ghcr.io/org/app:v1").unwrap());
        assert!(!match_image("demo", &rules, "docker.io/library/nginx").unwrap());
    }

    #[test]
    fn test_expression_rule() {
        let rules = compile_all(&[ImageRule::Expression {
            expression: r#"startswith(input.ref, "ghcr.io/")"#.to_string(),
        }]);

        assert!(match_image("demo", &rules, "ghcr.io/org/app:v1").unwrap());
        assert!(!match_image("demo", &rules, "quay.io/org/app:v1").unwrap());
    }

    #[test]
    fn test_first_match_wins_across_kinds() {
        let rules = compile_all(&[
            ImageRule::Glob {
                glob: "quay.io/*".to_string(),
            },
            ImageRule::Expression {
                expression: r#"contains(input.ref, "org")"#.to_string(),
            },
        ]);

        // Matched by the second rule after the glob misses.
        assert!(match_image("demo", &rules, "ghcr.io/org/app:v1").unwrap());
        // Matched by the first rule alone.
        assert!(match_image("demo", &rules, "quay.io/other/app").unwrap());
        assert!(!match_image("demo", &rules, "docker.io/library/nginx").unwrap());
    }

    #[test]
    fn test_non_boolean_expression_errors() {
        let rules = compile_all(&[ImageRule::Expression {
            expression: "input.ref".to_string(),
        }]);

        let err = match_image("demo", &rules, "ghcr.io/org/app").unwrap_err();
        assert!(matches!(err, PolicyError::EvaluationError { .. }));
    }

    #[test]
    fn test_undefined_expression_errors() {
        let rules = compile_all(&[ImageRule::Expression {
            expression: "input.missing.field".to_string(),
        }]);

        assert!(match_image("demo", &rules, "ghcr.io/org/app").is_err());
    }
}
