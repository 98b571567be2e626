//! Temporary preview URLs for locally staged media.
//!
//! A [`PreviewUrl`] is revoked exactly once: either explicitly via
//! [`PreviewUrl::revoke`] or when it is dropped.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use tracing::warn;
use uuid::Uuid;

pub trait BlobUrlRegistry: Send + Sync {
    fn create(&self, data: &[u8], mime_type: &str) -> String;
    fn revoke(&self, url: &str);
}

pub struct PreviewUrl {
    url: String,
    registry: Option<Arc<dyn BlobUrlRegistry>>,
}

impl PreviewUrl {
    pub fn create(registry: &Arc<dyn BlobUrlRegistry>, data: &[u8], mime_type: &str) -> Self {
        Self {
            url: registry.create(data, mime_type),
            registry: Some(Arc::clone(registry)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn revoke(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(registry) = self.registry.take() {
            registry.revoke(&self.url);
        }
    }
}

impl Drop for PreviewUrl {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PreviewUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PreviewUrl").field(&self.url).finish()
    }
}

#[derive(Default)]
struct RegistryState {
    live: HashMap<String, (usize, String)>,
    revocations: HashMap<String, u32>,
    created: u64,
}

/// Process-local registry handing out `blob:<uuid>` URLs.
#[derive(Default)]
pub struct InMemoryBlobUrls {
    state: Mutex<RegistryState>,
}

impl InMemoryBlobUrls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    pub fn created_count(&self) -> u64 {
        self.lock().created
    }

    pub fn revocation_count(&self, url: &str) -> u32 {
        self.lock().revocations.get(url).copied().unwrap_or(0)
    }

    /// Size and mime type of a live URL's payload.
    pub fn describe(&self, url: &str) -> Option<(usize, String)> {
        self.lock().live.get(url).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BlobUrlRegistry for InMemoryBlobUrls {
    fn create(&self, data: &[u8], mime_type: &str) -> String {
        let url = format!("blob:{}", Uuid::new_v4());
        let mut state = self.lock();
        state
            .live
            .insert(url.clone(), (data.len(), mime_type.to_string()));
        state.created += 1;
        url
    }

    fn revoke(&self, url: &str) {
        let mut state = self.lock();
        *state.revocations.entry(url.to_string()).or_default() += 1;
        if state.live.remove(url).is_none() {
            warn!(url, "blob: revoke of unknown or already revoked url");
        }
    }
}

#[cfg(test)]
#[path = "tests/blob_tests.rs"]
mod tests;
