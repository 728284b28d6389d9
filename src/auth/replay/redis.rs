// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Distributed replay store (Redis)
//!
//! Claims use a single `SET key 1 NX PX ttl` command. Redis executes it
//! atomically, so two workers racing on the same key cannot both receive
//! `OK`; the loser gets a nil reply.
//!
//! The connection is established lazily on first use and then shared
//! through a [`ConnectionManager`], which reconnects on its own after
//! transient failures. Callers bound every call with a timeout; this type
//! adds none of its own.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use tokio::sync::OnceCell;

use super::{ReplayBackendKind, ReplayStore, ReplayStoreError};

/// Replay store backed by a Redis-compatible server.
pub struct RedisReplayStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
}

impl RedisReplayStore {
    /// Create a store for `url`. No connection is attempted yet.
    pub fn open(url: &str) -> Result<Self, ReplayStoreError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, ReplayStoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .map_err(map_redis_error)?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl ReplayStore for RedisReplayStore {
    fn backend(&self) -> ReplayBackendKind {
        ReplayBackendKind::Distributed
    }

    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, ReplayStoreError> {
        let mut conn = self.connection().await?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(reply.is_some())
    }

    async fn ping(&self) -> Result<(), ReplayStoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

fn map_redis_error(err: RedisError) -> ReplayStoreError {
    if err.is_timeout() {
        ReplayStoreError::Timeout
    } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        ReplayStoreError::Connection(err.to_string())
    } else {
        ReplayStoreError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_urls() {
        assert!(RedisReplayStore::open("not a url").is_err());
    }

    #[test]
    fn open_does_not_connect() {
        // Nothing listens on port 1; opening must still succeed.
        let store = RedisReplayStore::open("redis://127.0.0.1:1").unwrap();
        assert_eq!(store.backend(), ReplayBackendKind::Distributed);
    }

    #[tokio::test]
    async fn unreachable_server_is_an_error_not_a_replay() {
        let store = RedisReplayStore::open("redis://127.0.0.1:1").unwrap();
        let result =
            tokio::time::timeout(Duration::from_secs(5), store.try_claim("k", Duration::from_secs(1)))
                .await;
        // Either the bounded wait elapsed or the store reported a failure;
        // it must never answer `Ok(false)`.
        if let Ok(inner) = result {
            assert!(inner.is_err());
        }
    }

    /// Runs only when `AUTH_TEST_REDIS_URL` points at a live server.
    #[tokio::test]
    async fn live_server_claims_each_key_once() {
        let Ok(url) = std::env::var("AUTH_TEST_REDIS_URL") else {
            return;
        };
        let store = std::sync::Arc::new(RedisReplayStore::open(&url).unwrap());
        let key = format!("auth:replay:test:{}", crate::auth::skew::now_ms());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = std::sync::Arc::clone(&store);
                let key = key.clone();
                tokio::spawn(async move {
                    store.try_claim(&key, Duration::from_secs(5)).await.unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        store.ping().await.unwrap();
    }
}
