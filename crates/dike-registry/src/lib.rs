//! Registry access for image verification.
//!
//! This crate turns image references into verified-ready metadata: it
//! resolves registry credentials, speaks the OCI Distribution API over
//! blocking HTTP, and caches everything fetched during one admission
//! evaluation so no image is pulled twice.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod fetch;
pub mod image;
pub mod oci;

pub use client::{compute_digest, HttpRegistryClient, RegistryApi};
pub use config::{CacheLimits, RegistryAuth, RegistryOptions};
pub use context::ImageContext;
pub use credentials::{CredentialHelper, CredentialResolver, RegistrySecret, SecretLister};
pub use error::{RegistryError, Result};
pub use fetch::ImageFetcher;
pub use image::ImageData;
pub use oci::{ConfigFile, Descriptor, ImageIndex, Manifest, Platform};
