//! Cached data for a single fetched image.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::debug;

use dike_core::ImageReference;

use crate::client::RegistryApi;
use crate::config::{CacheLimits, RegistryAuth};
use crate::error::{RegistryError, Result};
use crate::oci::{ConfigFile, Descriptor, ImageIndex, Manifest};

/// Everything known about one image after its initial fetch.
///
/// Constructed by the fetcher and shared read-only across verifier calls.
/// Referrer and blob retrieval is lazy and memoized; verification results
/// are recorded here so later payload extraction never re-fetches.
pub struct ImageData {
    /// The reference this data was fetched for.
    pub reference: ImageReference,

    /// Raw manifest bytes as returned by the registry.
    pub raw_manifest: Vec<u8>,

    /// Decoded manifest. For a multi-platform image this holds the index
    /// decoded into manifest shape; `index` carries the typed entries.
    pub manifest: Manifest,

    /// Decoded image configuration, when the manifest carries a config
    /// descriptor.
    pub config_file: Option<ConfigFile>,

    /// Typed index entries for a multi-platform image.
    pub index: Option<ImageIndex>,

    /// Canonical digest of the fetched manifest.
    pub digest: String,

    /// The reference pinned to the resolved digest.
    pub resolved_image: String,

    client: Arc<dyn RegistryApi>,
    auth: RegistryAuth,
    limits: CacheLimits,

    referrers: OnceCell<ImageIndex>,
    blob_cache: Mutex<HashMap<String, Arc<Vec<u8>>>>,
    verified_referrers: RwLock<HashMap<String, Descriptor>>,
    verified_payloads: RwLock<HashMap<String, Value>>,
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageData")
            .field("reference", &self.reference)
            .field("digest", &self.digest)
            .field("resolved_image", &self.resolved_image)
            .finish_non_exhaustive()
    }
}

impl ImageData {
    /// Assembles image data from fetch results.
    #[must_use]
    pub fn new(
        reference: ImageReference,
        raw_manifest: Vec<u8>,
        manifest: Manifest,
        config_file: Option<ConfigFile>,
        index: Option<ImageIndex>,
        digest: String,
        client: Arc<dyn RegistryApi>,
        auth: RegistryAuth,
        limits: CacheLimits,
    ) -> Self {
        let resolved_image = reference.with_digest(&digest).canonical();
        Self {
            reference,
            raw_manifest,
            manifest,
            config_file,
            index,
            digest,
            resolved_image,
            client,
            auth,
            limits,
            referrers: OnceCell::new(),
            blob_cache: Mutex::new(HashMap::new()),
            verified_referrers: RwLock::new(HashMap::new()),
            verified_payloads: RwLock::new(HashMap::new()),
        }
    }

    /// Fetches the referrers of this image, filtered by artifact type.
    ///
    /// The index is fetched once and memoized; each call filters the cached
    /// index.
    ///
    /// # Errors
    ///
    /// Fails when the registry call fails or the index exceeds the entry cap.
    pub fn fetch_referrers(&self, artifact_type: &str) -> Result<Vec<Descriptor>> {
        let index = self.referrers.get_or_try_init(|| {
            let index = self.client.get_referrers(
                &self.reference.registry,
                &self.reference.repository,
                &self.digest,
                &self.auth,
            )?;
            if index.manifests.len() > self.limits.max_referrers {
                return Err(RegistryError::TooManyReferrers {
                    image: self.resolved_image.clone(),
                    count: index.manifests.len(),
                    limit: self.limits.max_referrers,
                });
            }
            debug!(
                image = %self.resolved_image,
                count = index.manifests.len(),
                "Fetched referrers index"
            );
            Ok(index)
        })?;

        Ok(index.filter_artifact_type(artifact_type))
    }

    /// Fetches the referrers of an arbitrary digest in this image's
    /// repository. Used for nested artifacts (e.g. signatures attached to an
    /// attestation); results are not memoized.
    ///
    /// # Errors
    ///
    /// Fails when the registry call fails.
    pub fn fetch_referrers_for_digest(
        &self,
        digest: &str,
        artifact_type: &str,
    ) -> Result<Vec<Descriptor>> {
        let index = self.client.get_referrers(
            &self.reference.registry,
            &self.reference.repository,
            digest,
            &self.auth,
        )?;
        Ok(index.filter_artifact_type(artifact_type))
    }

    /// Fetches the payload of a referrer artifact: its manifest's single
    /// layer blob, capped at the configured size.
    ///
    /// # Errors
    ///
    /// Fails when the referrer manifest has no layers, the blob exceeds the
    /// size cap, or a registry call fails.
    pub fn fetch_referrer_data(&self, referrer: &Descriptor) -> Result<Arc<Vec<u8>>> {
        if let Some(cached) = self.blob_cache.lock().get(&referrer.digest) {
            return Ok(Arc::clone(cached));
        }

        let (manifest_bytes, _) = self.client.get_manifest(
            &self.reference.registry,
            &self.reference.repository,
            &referrer.digest,
            &self.auth,
        )?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;

        let layer = manifest
            .layers
            .first()
            .ok_or_else(|| RegistryError::InvalidManifest {
                image: self.resolved_image.clone(),
                message: format!("referrer {} has no layers", referrer.digest),
            })?;

        if layer.size > self.limits.max_referrer_payload {
            return Err(RegistryError::ReferrerTooLarge {
                digest: layer.digest.clone(),
                size: layer.size,
                limit: self.limits.max_referrer_payload,
            });
        }

        let blob = self.client.get_blob(
            &self.reference.registry,
            &self.reference.repository,
            &layer.digest,
            &self.auth,
        )?;
        if blob.len() as u64 > self.limits.max_referrer_payload {
            return Err(RegistryError::ReferrerTooLarge {
                digest: layer.digest.clone(),
                size: blob.len() as u64,
                limit: self.limits.max_referrer_payload,
            });
        }

        let blob = Arc::new(blob);
        self.blob_cache
            .lock()
            .insert(referrer.digest.clone(), Arc::clone(&blob));
        Ok(blob)
    }

    /// Records that a referrer passed verification for the given attestor
    /// and attestation pair.
    pub fn record_verified_referrer(&self, key: impl Into<String>, referrer: &Descriptor) {
        self.verified_referrers
            .write()
            .insert(key.into(), referrer.clone());
    }

    /// Records the decoded statement payload of a verified attestation.
    pub fn record_verified_payload(&self, key: impl Into<String>, payload: Value) {
        self.verified_payloads.write().insert(key.into(), payload);
    }

    /// Returns the recorded payload for a verified attestor/attestation
    /// pair, if that pair was verified earlier in this evaluation.
    #[must_use]
    pub fn verified_payload(&self, key: &str) -> Option<Value> {
        self.verified_payloads.read().get(key).cloned()
    }

    /// Returns the recorded referrer descriptor for a verified pair.
    #[must_use]
    pub fn verified_referrer(&self, key: &str) -> Option<Descriptor> {
        self.verified_referrers.read().get(key).cloned()
    }

    /// Renders the descriptor-level view exposed to expressions.
    #[must_use]
    pub fn descriptor_json(&self) -> Value {
        json!({
            "image": self.reference.image,
            "resolvedImage": self.resolved_image,
            "registry": self.reference.registry,
            "repository": self.reference.repository,
            "tag": self.reference.tag,
            "digest": self.digest,
            "imageIndex": self.index,
            "manifest": self.manifest,
            "configData": self.config_file,
        })
    }
}
