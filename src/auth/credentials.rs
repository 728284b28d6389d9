// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Client credential lookup and caching.
//!
//! Secrets are provisioned and rotated outside this service. The
//! [`CredentialStore`] trait is the seam to that external store;
//! [`StaticCredentialStore`] is the bundled adapter that reads a JSON file
//! of `client_id → secret` pairs.
//!
//! [`CachedCredentialStore`] bounds repeated lookups with a small LRU and a
//! TTL. Rotation signals call [`CachedCredentialStore::invalidate`] or
//! [`CachedCredentialStore::invalidate_all`].
//!
//! ## Secrets file format
//!
//! ```json
//! { "acme": "plain utf-8 secret", "globex": "hex:00ff10ab" }
//! ```
//!
//! Values prefixed with `hex:` are decoded as raw bytes.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;

/// Default TTL for cached credentials (1 minute).
pub const DEFAULT_CREDENTIAL_CACHE_TTL: Duration = Duration::from_secs(60);

/// Default number of cached credentials.
pub const DEFAULT_CREDENTIAL_CACHE_CAPACITY: usize = 1024;

const HEX_SECRET_PREFIX: &str = "hex:";

/// Opaque shared secret. Never printed.
#[derive(Clone)]
pub struct SharedSecret(Arc<[u8]>);

impl SharedSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self(Arc::from(bytes))
    }

    /// Raw key material for HMAC computation.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// A client's identity and its signing secret.
#[derive(Debug, Clone)]
pub struct ClientCredential {
    pub client_id: String,
    pub secret: SharedSecret,
}

/// Errors raised while loading or looking up credentials.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to read credentials file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("credentials file {path} is not a JSON object of client secrets: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("credentials file {path} has an invalid secret for client {client_id}")]
    InvalidSecret { path: String, client_id: String },
}

/// Keyed, read-only lookup of client secrets.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Returns `Ok(None)` for unknown clients.
    async fn lookup(&self, client_id: &str) -> Result<Option<ClientCredential>, CredentialError>;
}

/// In-memory credential map, optionally loaded from a JSON file.
#[derive(Default)]
pub struct StaticCredentialStore {
    clients: RwLock<HashMap<String, SharedSecret>>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client (builder style, mostly for tests and bootstrapping).
    pub fn with_client(self, client_id: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        if let Ok(mut clients) = self.clients.write() {
            clients.insert(client_id.into(), SharedSecret::new(secret));
        }
        self
    }

    /// Load a store from a secrets file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let store = Self::new();
        store.reload_from_file(path)?;
        Ok(store)
    }

    /// Replace every credential with the contents of a secrets file.
    ///
    /// Returns the number of clients loaded. The previous set stays in place
    /// if the file cannot be read or parsed.
    pub fn reload_from_file(&self, path: impl AsRef<Path>) -> Result<usize, CredentialError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| CredentialError::Io {
            path: display.clone(),
            source,
        })?;
        let entries: HashMap<String, String> =
            serde_json::from_str(&raw).map_err(|source| CredentialError::Parse {
                path: display.clone(),
                source,
            })?;

        let mut parsed = HashMap::with_capacity(entries.len());
        for (client_id, value) in entries {
            let secret = parse_secret(&value).ok_or_else(|| CredentialError::InvalidSecret {
                path: display.clone(),
                client_id: client_id.clone(),
            })?;
            parsed.insert(client_id, secret);
        }

        let count = parsed.len();
        let mut clients = self
            .clients
            .write()
            .map_err(|_| CredentialError::Unavailable("credential map poisoned".to_string()))?;
        *clients = parsed;
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.clients.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_secret(value: &str) -> Option<SharedSecret> {
    let bytes = match value.strip_prefix(HEX_SECRET_PREFIX) {
        Some(encoded) => hex::decode(encoded.trim()).ok()?,
        None => value.as_bytes().to_vec(),
    };
    if bytes.is_empty() {
        return None;
    }
    Some(SharedSecret::new(bytes))
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn lookup(&self, client_id: &str) -> Result<Option<ClientCredential>, CredentialError> {
        let clients = self
            .clients
            .read()
            .map_err(|_| CredentialError::Unavailable("credential map poisoned".to_string()))?;
        Ok(clients.get(client_id).map(|secret| ClientCredential {
            client_id: client_id.to_string(),
            secret: secret.clone(),
        }))
    }
}

/// Cached entry: credential + insertion timestamp.
struct CacheEntry {
    credential: ClientCredential,
    inserted_at: Instant,
}

/// Size- and TTL-bounded cache in front of another [`CredentialStore`].
///
/// Unknown clients are not cached, so a newly provisioned client is usable
/// on its first request.
pub struct CachedCredentialStore {
    inner: Arc<dyn CredentialStore>,
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    /// Bumped by every invalidation, always while `cache` is locked.
    generation: AtomicU64,
}

impl CachedCredentialStore {
    pub fn new(inner: Arc<dyn CredentialStore>, capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
            generation: AtomicU64::new(0),
        }
    }

    fn cached(&self, client_id: &str) -> Option<ClientCredential> {
        let mut cache = self.cache.lock().ok()?;
        if let Some(entry) = cache.get(client_id) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.credential.clone());
            }
            cache.pop(client_id);
        }
        None
    }

    /// Insert a fetched credential unless an invalidation ran since
    /// `fetched_at` was read. A secret fetched before a rotation must not
    /// outlive it in the cache.
    fn store(&self, credential: &ClientCredential, fetched_at: u64) {
        if let Ok(mut cache) = self.cache.lock() {
            if self.generation.load(Ordering::SeqCst) != fetched_at {
                return;
            }
            cache.put(
                credential.client_id.clone(),
                CacheEntry {
                    credential: credential.clone(),
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    /// Drop one client's cached secret (rotation of a single client).
    pub fn invalidate(&self, client_id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.pop(client_id);
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drop every cached secret (bulk rotation or reload).
    pub fn invalidate_all(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CredentialStore for CachedCredentialStore {
    async fn lookup(&self, client_id: &str) -> Result<Option<ClientCredential>, CredentialError> {
        if let Some(credential) = self.cached(client_id) {
            return Ok(Some(credential));
        }

        let fetched_at = self.generation.load(Ordering::SeqCst);
        let found = self.inner.lookup(client_id).await?;
        if let Some(credential) = &found {
            self.store(credential, fetched_at);
        }
        Ok(found)
    }
}
