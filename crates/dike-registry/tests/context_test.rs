//! Integration tests for the per-evaluation image cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dike_registry::oci::{OCI_INDEX, OCI_MANIFEST};
use dike_registry::{
    CacheLimits, CredentialResolver, Descriptor, ImageContext, ImageFetcher, ImageIndex,
    RegistryApi, RegistryAuth, RegistryError, RegistryOptions,
};

/// Registry fake that counts manifest fetches per reference and can be told
/// to fail or stall for specific references.
#[derive(Default)]
struct FakeRegistry {
    fetch_counts: parking_lot::Mutex<HashMap<String, usize>>,
    failing: Vec<String>,
    slow: Vec<String>,
    total_fetches: AtomicUsize,
}

impl FakeRegistry {
    fn count_for(&self, reference: &str) -> usize {
        self.fetch_counts
            .lock()
            .get(reference)
            .copied()
            .unwrap_or(0)
    }
}

fn manifest_bytes() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "layers": []
    }))
    .unwrap()
}

impl RegistryApi for FakeRegistry {
    fn get_manifest(
        &self,
        _registry: &str,
        _repository: &str,
        reference: &str,
        _auth: &RegistryAuth,
    ) -> dike_registry::Result<(Vec<u8>, String)> {
        if self.slow.iter().any(|s| s == reference) {
            std::thread::sleep(Duration::from_millis(50));
        }
        *self
            .fetch_counts
            .lock()
            .entry(reference.to_string())
            .or_insert(0) += 1;
        self.total_fetches.fetch_add(1, Ordering::SeqCst);

        if self.failing.iter().any(|f| f == reference) {
            return Err(RegistryError::NotFound {
                image: reference.to_string(),
            });
        }
        Ok((manifest_bytes(), OCI_MANIFEST.to_string()))
    }

    fn head_manifest(
        &self,
        _registry: &str,
        _repository: &str,
        reference: &str,
        _auth: &RegistryAuth,
    ) -> dike_registry::Result<Descriptor> {
        Ok(Descriptor::new(
            OCI_MANIFEST,
            format!("sha256:{reference}"),
            100,
        ))
    }

    fn get_blob(
        &self,
        _registry: &str,
        _repository: &str,
        digest: &str,
        _auth: &RegistryAuth,
    ) -> dike_registry::Result<Vec<u8>> {
        Err(RegistryError::NotFound {
            image: digest.to_string(),
        })
    }

    fn get_referrers(
        &self,
        _registry: &str,
        _repository: &str,
        _digest: &str,
        _auth: &RegistryAuth,
    ) -> dike_registry::Result<ImageIndex> {
        Ok(ImageIndex {
            schema_version: 2,
            media_type: Some(OCI_INDEX.to_string()),
            manifests: Vec::new(),
        })
    }
}

fn context(registry: Arc<FakeRegistry>) -> ImageContext {
    let fetcher = ImageFetcher::new(registry, CredentialResolver::new(), CacheLimits::default());
    ImageContext::new(fetcher, RegistryOptions::default(), CacheLimits::default())
}

#[test]
fn test_repeated_get_fetches_once() {
    let registry = Arc::new(FakeRegistry::default());
    let ctx = context(Arc::clone(&registry));

    let first = ctx.get("ghcr.io/org/app:v1").unwrap();
    let second = ctx.get("ghcr.io/org/app:v1").unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.count_for("v1"), 1);
}

#[test]
fn test_concurrent_gets_coalesce_onto_one_fetch() {
    let registry = Arc::new(FakeRegistry {
        slow: vec!["v1".to_string()],
        ..FakeRegistry::default()
    });
    let ctx = context(Arc::clone(&registry));

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                ctx.get("ghcr.io/org/app:v1").unwrap();
            });
        }
    });

    assert_eq!(registry.count_for("v1"), 1);
}

#[test]
fn test_failed_fetch_is_not_cached() {
    let registry = Arc::new(FakeRegistry {
        failing: vec!["missing".to_string()],
        ..FakeRegistry::default()
    });
    let ctx = context(Arc::clone(&registry));

    assert!(ctx.get("ghcr.io/org/app:missing").is_err());
    assert!(ctx.get("ghcr.io/org/app:missing").is_err());

    // The second call retried instead of replaying a cached failure.
    assert_eq!(registry.count_for("missing"), 2);
}

#[test]
fn test_batch_prefetch_dedupes_and_caches() {
    let registry = Arc::new(FakeRegistry::default());
    let ctx = context(Arc::clone(&registry));

    let images: Vec<String> = vec![
        "ghcr.io/org/a:v1".to_string(),
        "ghcr.io/org/b:v1".to_string(),
        "ghcr.io/org/a:v1".to_string(),
    ];
    ctx.add_images(&images).unwrap();

    assert_eq!(registry.total_fetches.load(Ordering::SeqCst), 2);

    // Later gets are cache hits.
    ctx.get("ghcr.io/org/a:v1").unwrap();
    assert_eq!(registry.total_fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn test_batch_prefetch_fails_fast() {
    let failing: Vec<String> = vec!["bad".to_string()];
    let registry = Arc::new(FakeRegistry {
        failing,
        ..FakeRegistry::default()
    });
    let ctx = context(Arc::clone(&registry));

    // More images than workers, with the failure early in the queue. The
    // error must surface and not every queued image need be fetched.
    let mut images = vec!["ghcr.io/org/app:bad".to_string()];
    for i in 0..100 {
        images.push(format!("ghcr.io/org/app:v{i}"));
    }

    let err = ctx.add_images(&images).unwrap_err();
    assert!(matches!(err, RegistryError::NotFound { .. }));
    assert!(registry.total_fetches.load(Ordering::SeqCst) < 101);
}

#[test]
fn test_batch_prefetch_empty_is_noop() {
    let registry = Arc::new(FakeRegistry::default());
    let ctx = context(Arc::clone(&registry));

    ctx.add_images(&[]).unwrap();
    assert_eq!(registry.total_fetches.load(Ordering::SeqCst), 0);
    assert!(ctx.cached_images().is_empty());
}
