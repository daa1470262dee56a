//! Image fetching: reference to fully populated [`ImageData`].

use std::sync::Arc;

use tracing::{debug, instrument};

use dike_core::ImageReference;

use crate::client::RegistryApi;
use crate::config::{CacheLimits, RegistryOptions};
use crate::credentials::CredentialResolver;
use crate::error::{RegistryError, Result};
use crate::image::ImageData;
use crate::oci::{self, ConfigFile, ImageIndex, Manifest};

/// Fetches image metadata through an injected [`RegistryApi`].
pub struct ImageFetcher {
    client: Arc<dyn RegistryApi>,
    resolver: CredentialResolver,
    limits: CacheLimits,
}

impl std::fmt::Debug for ImageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageFetcher")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ImageFetcher {
    /// Creates a fetcher.
    #[must_use]
    pub fn new(client: Arc<dyn RegistryApi>, resolver: CredentialResolver, limits: CacheLimits) -> Self {
        Self {
            client,
            resolver,
            limits,
        }
    }

    /// Fetches everything the verifiers need for one image: manifest,
    /// canonical digest, configuration blob, and index entries for a
    /// multi-platform image.
    ///
    /// # Errors
    ///
    /// Fails when the reference does not parse, credentials cannot be
    /// resolved, or any registry call fails.
    #[instrument(skip(self, options))]
    pub fn fetch(&self, image: &str, options: &RegistryOptions) -> Result<ImageData> {
        let reference = ImageReference::parse(image)?;
        let auth = self.resolver.resolve(options, &reference.registry)?;

        let (raw_manifest, content_type) = self.client.get_manifest(
            &reference.registry,
            &reference.repository,
            &reference.identifier,
            &auth,
        )?;
        let manifest: Manifest =
            serde_json::from_slice(&raw_manifest).map_err(|e| RegistryError::InvalidManifest {
                image: image.to_string(),
                message: e.to_string(),
            })?;

        let media_type = manifest
            .media_type
            .clone()
            .unwrap_or_else(|| content_type.clone());

        // Multi-platform image: decode the raw bytes again as a typed index
        // so per-platform entries are available to expressions.
        let index: Option<ImageIndex> = if oci::is_index_media_type(&media_type) {
            Some(serde_json::from_slice(&raw_manifest).map_err(|e| {
                RegistryError::InvalidManifest {
                    image: image.to_string(),
                    message: e.to_string(),
                }
            })?)
        } else {
            None
        };

        let config_file: Option<ConfigFile> = match &manifest.config {
            Some(config) => {
                let blob = self.client.get_blob(
                    &reference.registry,
                    &reference.repository,
                    &config.digest,
                    &auth,
                )?;
                Some(
                    serde_json::from_slice(&blob).map_err(|e| RegistryError::InvalidManifest {
                        image: image.to_string(),
                        message: format!("config blob: {e}"),
                    })?,
                )
            }
            None => None,
        };

        // Use the digest already present in the reference when the user
        // pinned one; otherwise resolve the canonical digest via HEAD.
        let digest = if reference.has_digest() {
            reference.digest.clone()
        } else {
            self.client
                .head_manifest(
                    &reference.registry,
                    &reference.repository,
                    &reference.identifier,
                    &auth,
                )?
                .digest
        };

        debug!(image, %digest, "Fetched image metadata");

        Ok(ImageData::new(
            reference,
            raw_manifest,
            manifest,
            config_file,
            index,
            digest,
            Arc::clone(&self.client),
            auth,
            self.limits,
        ))
    }
}
