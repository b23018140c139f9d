//! Addressable handles over job bytes for previews and downloads.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::job::SharedBytes;

const URL_PREFIX: &str = "blob:ghostpress/";

#[derive(Default)]
struct RegistryInner {
    blobs: Mutex<HashMap<String, SharedBytes>>,
    created: AtomicUsize,
    released: AtomicUsize,
    double_releases: AtomicUsize,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, SharedBytes>> {
        match self.blobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Blob registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn release(&self, url: &str) {
        if self.lock().remove(url).is_some() {
            self.released.fetch_add(1, Ordering::AcqRel);
        } else {
            self.double_releases.fetch_add(1, Ordering::AcqRel);
            log::error!("Blob {} released twice", url);
        }
    }
}

/// Issues blob handles and resolves their URLs.
#[derive(Clone, Default)]
pub struct BlobRegistry {
    inner: Arc<RegistryInner>,
}

impl BlobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `bytes` and returns the handle that owns the registration.
    pub fn create(&self, bytes: SharedBytes) -> BlobHandle {
        let url = format!("{}{}", URL_PREFIX, uuid::Uuid::new_v4());
        self.inner.lock().insert(url.clone(), bytes);
        self.inner.created.fetch_add(1, Ordering::AcqRel);
        BlobHandle {
            url,
            registry: Arc::clone(&self.inner),
        }
    }

    pub fn resolve(&self, url: &str) -> Option<SharedBytes> {
        self.inner.lock().get(url).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn created_count(&self) -> usize {
        self.inner.created.load(Ordering::Acquire)
    }

    pub fn released_count(&self) -> usize {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Releases of handles that were already gone. Stays zero.
    pub fn double_release_count(&self) -> usize {
        self.inner.double_releases.load(Ordering::Acquire)
    }
}

/// Owned registration of a blob URL. Released exactly once, on drop.
pub struct BlobHandle {
    url: String,
    registry: Arc<RegistryInner>,
}

impl BlobHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Releases the URL now.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for BlobHandle {
    fn drop(&mut self) {
        self.registry.release(&self.url);
    }
}

impl fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BlobHandle").field(&self.url).finish()
    }
}
