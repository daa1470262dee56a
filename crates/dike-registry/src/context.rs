//! Per-evaluation image cache.
//!
//! One [`ImageContext`] lives for the duration of a single admission
//! evaluation. Every image is fetched at most once; concurrent requests for
//! the same image coalesce onto one in-flight fetch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{CacheLimits, RegistryOptions};
use crate::error::{RegistryError, Result};
use crate::fetch::ImageFetcher;
use crate::image::ImageData;

/// Caches fetched image data for one evaluation.
///
/// Entries are keyed by the raw image string; a cell per key makes fetches
/// single-flight without holding the map lock during network I/O.
pub struct ImageContext {
    fetcher: ImageFetcher,
    options: RegistryOptions,
    limits: CacheLimits,
    entries: Mutex<HashMap<String, Arc<OnceCell<Arc<ImageData>>>>>,
}

impl std::fmt::Debug for ImageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageContext")
            .field("cached", &self.entries.lock().len())
            .finish_non_exhaustive()
    }
}

impl ImageContext {
    /// Creates a cache around a fetcher and the options for this evaluation.
    #[must_use]
    pub fn new(fetcher: ImageFetcher, options: RegistryOptions, limits: CacheLimits) -> Self {
        Self {
            fetcher,
            options,
            limits,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached data for an image, fetching it on first use.
    ///
    /// Concurrent callers for the same image block on one fetch. A failed
    /// fetch is not cached; the next caller retries.
    ///
    /// # Errors
    ///
    /// Propagates the fetch error.
    pub fn get(&self, image: &str) -> Result<Arc<ImageData>> {
        let cell = {
            let mut entries = self.entries.lock();
            Arc::clone(entries.entry(image.to_string()).or_default())
        };

        cell.get_or_try_init(|| {
            debug!(image, "Fetching image for evaluation cache");
            self.fetcher.fetch(image, &self.options).map(Arc::new)
        })
        .map(Arc::clone)
    }

    /// Prefetches a batch of images with a bounded worker pool.
    ///
    /// Duplicates are fetched once. The pool aborts on the first failure:
    /// workers finish their current fetch and pick up no further work, and
    /// the first error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first fetch error encountered.
    pub fn add_images(&self, images: &[String]) -> Result<()> {
        let unique: Vec<&String> = {
            let mut seen = HashSet::new();
            images.iter().filter(|i| seen.insert(i.as_str())).collect()
        };
        if unique.is_empty() {
            return Ok(());
        }

        let queue: Mutex<VecDeque<&String>> = Mutex::new(unique.iter().copied().collect());
        let abort = AtomicBool::new(false);
        let first_error: Mutex<Option<RegistryError>> = Mutex::new(None);

        let workers = self.limits.max_concurrent_fetches.min(unique.len());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if abort.load(Ordering::SeqCst) {
                        return;
                    }
                    let Some(image) = queue.lock().pop_front() else {
                        return;
                    };
                    if let Err(e) = self.get(image) {
                        warn!(image = image.as_str(), error = %e, "Image prefetch failed");
                        abort.store(true, Ordering::SeqCst);
                        let mut slot = first_error.lock();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        return;
                    }
                });
            }
        });

        match first_error.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the images currently cached, in no particular order.
    #[must_use]
    pub fn cached_images(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}
