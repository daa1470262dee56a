//! # Dike Core
//!
//! Core types for the Dike image trust verification engine.
//!
//! This crate provides the foundational data structures used throughout the
//! Dike ecosystem, including:
//!
//! - [`ImageReference`] - Parsed container image reference
//! - [`ImagePolicy`] - The image verification policy document
//! - [`intoto`] - DSSE envelope and in-toto statement types
//!
//! ## Example
//!
//! ```rust
//! use dike_core::ImageReference;
//!
//! let reference = ImageReference::parse("ghcr.io/acme/payments:signed")?;
//! assert_eq!(reference.name(), "ghcr.io/acme/payments");
//! # Ok::<(), dike_core::Error>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod intoto;
pub mod policy;
pub mod reference;

// Re-export main types at crate root
pub use error::{Error, Result};
pub use intoto::{Envelope, EnvelopeSignature, LogBundle, LogPayload, Statement};
pub use policy::{
    Attestation, AttestationSpec, Attestor, AttestorSpec, CosignAttestor, CredentialSources,
    FailurePolicy, HashAlgorithm, ImagePolicy, ImageRule, MatchCondition, NotaryAttestor,
    PolicyException, PolicySpec, Validation,
};
pub use reference::ImageReference;
