//! Signature verification backends.
//!
//! Two independent trust models over the same registry data: the cosign
//! style (keys, certificates, or keyless identities plus a transparency
//! log) and the notary style (a certificate trust store). Both record
//! their successes into the image's side tables; the policy layer reads
//! those tables to answer `extractPayload` calls without re-verifying.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chain;
pub mod cosign;
pub mod error;
pub mod keys;
pub mod notary;
pub mod trustroot;

pub use chain::{split_cert_chain, CertChain, CertEntry};
pub use cosign::{CosignVerifier, KeyResolver, INTOTO_ARTIFACT_TYPE, SIGNATURE_ARTIFACT_TYPE};
pub use error::{Result, VerifyError};
pub use keys::VerificationKey;
pub use notary::{NotaryVerifier, TrustPolicy, NOTARY_SIGNATURE_ARTIFACT_TYPE};
pub use trustroot::{fetch_trust_root, TrustRoot, PUBLIC_TUF_MIRROR};
