//! OCI Distribution Specification types.
//!
//! Serde models for the registry payloads the fetcher handles: content
//! descriptors, image manifests, image indexes (also the shape of a
//! referrers index response), and the image configuration blob.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OCI image manifest media type.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index media type.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Docker schema-2 manifest media type.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Docker manifest list media type.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Returns whether a media type denotes a multi-platform index.
#[must_use]
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST
}

/// OCI content descriptor.
///
/// Describes the disposition of targeted content: its type, content
/// identifier (digest), and byte size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,

    /// Digest of the targeted content (`algorithm:hex`).
    pub digest: String,

    /// Size in bytes of the content.
    pub size: u64,

    /// Artifact type, set on referrer entries (OCI 1.1+).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// Target platform, set on index entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    /// Optional annotations (key-value metadata).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

impl Descriptor {
    /// Creates a new descriptor.
    #[must_use]
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            artifact_type: None,
            platform: None,
            annotations: None,
        }
    }

    /// Returns the digest algorithm (e.g. `sha256`).
    #[must_use]
    pub fn digest_algorithm(&self) -> &str {
        self.digest.split(':').next().unwrap_or("sha256")
    }
}

/// Target platform of an index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture (e.g. `amd64`).
    pub architecture: String,

    /// Operating system (e.g. `linux`).
    pub os: String,

    /// Architecture variant (e.g. `v8`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// OCI image manifest.
///
/// `layers` and `config` default to empty/absent so an image index decodes
/// into this shape too; callers inspect the media type to tell them apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version (always 2).
    pub schema_version: u32,

    /// Media type of this manifest.
    #[serde(default)]
    pub media_type: Option<String>,

    /// Configuration descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,

    /// Layers that make up the artifact.
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// Artifact type (OCI 1.1+ referrer artifacts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// Subject descriptor linking a referrer to its image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    /// Optional annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// OCI image index: a list of platform-specific manifests. The registry
/// referrers API returns the same shape with `artifact_type` set on each
/// entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version (always 2).
    pub schema_version: u32,

    /// Media type of this index.
    #[serde(default)]
    pub media_type: Option<String>,

    /// Referenced manifests.
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Returns the entries matching the given artifact type.
    #[must_use]
    pub fn filter_artifact_type(&self, artifact_type: &str) -> Vec<Descriptor> {
        self.manifests
            .iter()
            .filter(|d| d.artifact_type.as_deref() == Some(artifact_type))
            .cloned()
            .collect()
    }
}

/// Image configuration blob.
///
/// Only the commonly queried fields are typed; the full container config is
/// carried as raw JSON for expression access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    /// CPU architecture.
    pub architecture: Option<String>,

    /// Operating system.
    pub os: Option<String>,

    /// Creation timestamp.
    pub created: Option<String>,

    /// Container runtime configuration.
    pub config: Option<Value>,

    /// Build history entries.
    pub history: Option<Value>,

    /// Root filesystem description.
    pub rootfs: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_deserialization() {
        let json = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": "sha256:cfg",
                "size": 100
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": "sha256:layer",
                "size": 2048
            }]
        }"#;

        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.config.unwrap().digest, "sha256:cfg");
    }

    #[test]
    fn test_index_deserializes_as_manifest() {
        // The fetcher decodes everything as Manifest first and inspects the
        // media type to detect indexes.
        let json = r#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:amd64",
                "size": 500,
                "platform": {"architecture": "amd64", "os": "linux"}
            }]
        }"#;

        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert!(is_index_media_type(manifest.media_type.as_deref().unwrap()));
        assert!(manifest.layers.is_empty());

        let index: ImageIndex = serde_json::from_str(json).unwrap();
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(
            index.manifests[0].platform.as_ref().unwrap().architecture,
            "amd64"
        );
    }

    #[test]
    fn test_referrers_index_filtering() {
        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(OCI_INDEX.to_string()),
            manifests: vec![
                Descriptor {
                    artifact_type: Some("application/vnd.cyclonedx+json".to_string()),
                    ..Descriptor::new(OCI_MANIFEST, "sha256:sbom", 10)
                },
                Descriptor {
                    artifact_type: Some("application/vnd.dev.cosign.artifact.sig.v1+json".to_string()),
                    ..Descriptor::new(OCI_MANIFEST, "sha256:sig", 10)
                },
            ],
        };

        let sboms = index.filter_artifact_type("application/vnd.cyclonedx+json");
        assert_eq!(sboms.len(), 1);
        assert_eq!(sboms[0].digest, "sha256:sbom");

        assert!(index.filter_artifact_type("application/missing").is_empty());
    }
}
