//! Session identity persistence.
//!
//! A session identity is a string minted once per target URL and sent with
//! every dial (`<endpoint>?sessionId=<id>`), letting the server correlate a
//! reconnecting client to prior session state. Persistence goes through an
//! injected [`KeyValueStore`] so tests (and non-browser embeddings) can
//! substitute their own storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Minimal key-value persistence seam.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// In-memory store; the default when the embedder supplies nothing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().expect("kvs poisoned").get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.inner
            .lock()
            .expect("kvs poisoned")
            .insert(key.to_string(), value.to_string());
    }
}

/// Per-URL session identity, cached in memory and mirrored to the store.
pub struct SessionIdentity {
    store: Arc<dyn KeyValueStore>,
    key: String,
    cached: Mutex<Option<String>>,
}

impl SessionIdentity {
    pub fn new(store: Arc<dyn KeyValueStore>, url: &str) -> Self {
        Self {
            store,
            key: format!("session.id.{url}"),
            cached: Mutex::new(None),
        }
    }

    /// The current identity: cached, else persisted, else freshly minted.
    pub fn ensure(&self) -> String {
        let mut cached = self.cached.lock().expect("session poisoned");
        if let Some(id) = cached.as_ref() {
            return id.clone();
        }
        let id = self
            .store
            .get(&self.key)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.store.set(&self.key, &id);
        *cached = Some(id.clone());
        id
    }

    /// Mint and persist a fresh identity.
    ///
    /// Used when the server reports the current id as still attached to a
    /// live connection; two sockets must never race under one session id.
    pub fn regenerate(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.store.set(&self.key, &id);
        *self.cached.lock().expect("session poisoned") = Some(id.clone());
        id
    }
}
