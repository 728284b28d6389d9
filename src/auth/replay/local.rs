// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Process-local replay guard
//!
//! A mutex-guarded map of `key → expires_at`. Claims are atomic within this
//! process only; separate workers each hold their own map, so running on
//! this backend alone is a monitored degradation, never a substitute for the
//! distributed store.
//!
//! Expired entries are treated as absent by [`LocalReplayStore::try_claim_at`]
//! and physically removed by [`LocalReplaySweeper`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ReplayBackendKind, ReplayStore, ReplayStoreError};

/// Default interval between sweeps of expired entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// In-process replay store.
#[derive(Debug, Default)]
pub struct LocalReplayStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl LocalReplayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `key` if it is absent or expired as of `now`.
    ///
    /// Returns `true` when the key was claimed by this call.
    pub fn try_claim_at(&self, key: &str, ttl: Duration, now: Instant) -> bool {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(expires_at) = entries.get(key) {
            if *expires_at > now {
                return false;
            }
        }
        entries.insert(key.to_string(), now + ttl);
        true
    }

    pub fn try_claim_now(&self, key: &str, ttl: Duration) -> bool {
        self.try_claim_at(key, ttl, Instant::now())
    }

    /// Remove entries expired as of `now`. Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReplayStore for LocalReplayStore {
    fn backend(&self) -> ReplayBackendKind {
        ReplayBackendKind::Local
    }

    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, ReplayStoreError> {
        Ok(self.try_claim_now(key, ttl))
    }

    async fn ping(&self) -> Result<(), ReplayStoreError> {
        Ok(())
    }
}

/// Background task that evicts expired entries from a [`LocalReplayStore`].
pub struct LocalReplaySweeper {
    store: Arc<LocalReplayStore>,
    interval: Duration,
}

impl LocalReplaySweeper {
    pub fn new(store: Arc<LocalReplayStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Run the sweep loop until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(sweeper.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Local replay sweeper starting"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Local replay sweeper shutting down");
                    return;
                }
            }

            let removed = self.store.sweep();
            if removed > 0 {
                debug!(
                    removed,
                    remaining = self.store.len(),
                    "Swept expired replay records"
                );
            }
        }
    }
}
