//! Policy compilation and admission-time evaluation.
//!
//! This crate turns [`dike_core::policy::ImagePolicy`] documents into
//! executable programs and runs them against admission requests, wiring
//! the verifier backends in as extension functions of the expression
//! language. See [`compile::PolicyCompiler`] and
//! [`evaluate::PolicyEvaluator`] for the two entry points.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod compile;
pub mod engine;
pub mod error;
pub mod evaluate;
pub mod extensions;
pub mod rules;

pub use compile::{
    CompiledCondition, CompiledException, CompiledExtractor, CompiledPolicy, CompiledValidation,
    PolicyCompiler,
};
pub use engine::{EvalOutcome, ExprEvaluator, ExprProgram};
pub use error::{PolicyError, Result};
pub use evaluate::{
    AdmissionInput, EvaluationOutcome, EvaluationResult, PolicyEvaluator, OUTCOME_ANNOTATION,
};
pub use extensions::VerificationEnv;
pub use rules::{match_image, CompiledImageRule};
