// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Replay Guard
//!
//! Every authenticated request claims a replay key exactly once. Keys are
//! `prefix + client_id + ":" + (nonce | timestamp_ms)` and are written only
//! through an atomic insert-if-absent; nothing here updates or deletes a
//! record before its TTL runs out.
//!
//! ## Backends
//!
//! | Backend | Type | Scope |
//! |---------|------|-------|
//! | Distributed | [`RedisReplayStore`] | all worker processes |
//! | Local | [`LocalReplayStore`] | this process only |
//!
//! Both implement [`ReplayStore`]. [`ReplayGuard::from_config`] picks the
//! primary once at startup.
//!
//! ## Store failures
//!
//! A store error is never read as "key already exists". Each distributed
//! call is bounded by [`ReplayGuardConfig::store_timeout`]; on failure the
//! [`FailurePolicy`] decides:
//!
//! - `fail_closed` (default): the request is rejected with
//!   `cache_unavailable`.
//! - `fail_open`: the claim is served by the local guard and
//!   `auth_cache_fallback_total` is incremented.
//!
//! Successful distributed claims are mirrored into the local guard, so keys
//! taken locally during an earlier fail-open outage still count as seen.

pub mod local;
pub mod redis;

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::metrics::AuthMetrics;

pub use self::local::{LocalReplayStore, LocalReplaySweeper, DEFAULT_SWEEP_INTERVAL};
pub use self::redis::RedisReplayStore;

/// Default replay key namespace.
pub const DEFAULT_KEY_PREFIX: &str = "auth:replay:";

/// Extra lifetime added on top of the skew window for every record.
pub const REPLAY_TTL_MARGIN: Duration = Duration::from_secs(60);

/// Default bound on a single distributed store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// Failures of a replay store backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplayStoreError {
    #[error("replay store did not answer in time")]
    Timeout,

    #[error("replay store connection failed: {0}")]
    Connection(String),

    #[error("replay store protocol error: {0}")]
    Protocol(String),
}

impl ReplayStoreError {
    /// Metric label for `auth_replay_store_errors_total`.
    pub fn kind(&self) -> &'static str {
        match self {
            ReplayStoreError::Timeout => "timeout",
            ReplayStoreError::Connection(_) => "connection",
            ReplayStoreError::Protocol(_) => "protocol",
        }
    }
}

/// Which backend a store is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayBackendKind {
    Distributed,
    Local,
}

impl ReplayBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplayBackendKind::Distributed => "distributed",
            ReplayBackendKind::Local => "local",
        }
    }
}

/// Atomic, TTL-bounded "seen" set.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    fn backend(&self) -> ReplayBackendKind;

    /// Insert `key` if absent.
    ///
    /// `Ok(true)` means this call claimed the key, `Ok(false)` means it was
    /// already present. Connectivity problems are `Err`, never `Ok(false)`.
    async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, ReplayStoreError>;

    /// Cheap reachability probe for readiness checks.
    async fn ping(&self) -> Result<(), ReplayStoreError>;
}

/// Behaviour when the distributed store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    #[default]
    FailClosed,
    FailOpen,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::FailClosed => "fail_closed",
            FailurePolicy::FailOpen => "fail_open",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_closed" | "closed" => Ok(FailurePolicy::FailClosed),
            "fail_open" | "open" => Ok(FailurePolicy::FailOpen),
            other => Err(format!("unknown replay failure policy '{other}'")),
        }
    }
}

/// Result of claiming one replay key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The key was unseen and is now claimed. `degraded` is set when the
    /// claim was served by the local guard after a store failure.
    Claimed { degraded: bool },
    /// The key had already been claimed.
    Replayed { degraded: bool },
    /// The distributed store failed and the policy is fail-closed.
    Unavailable,
}

/// Replay store state as reported by readiness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStoreHealth {
    /// Distributed store answered.
    Ok,
    /// Distributed store configured but unreachable.
    Unavailable,
    /// No distributed store configured; local guard only.
    Local,
}

/// Tunables for [`ReplayGuard`].
#[derive(Debug, Clone)]
pub struct ReplayGuardConfig {
    pub key_prefix: String,
    /// Skew window `W`.
    pub max_clock_skew: Duration,
    /// Minimum record lifetime; never below `max_clock_skew`.
    pub record_ttl: Duration,
    pub store_timeout: Duration,
    pub failure_policy: FailurePolicy,
}

impl ReplayGuardConfig {
    pub fn new(max_clock_skew: Duration) -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_clock_skew,
            record_ttl: max_clock_skew + REPLAY_TTL_MARGIN,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Replay protection over a primary store plus the local guard.
#[derive(Clone)]
pub struct ReplayGuard {
    primary: Option<Arc<dyn ReplayStore>>,
    local: Arc<LocalReplayStore>,
    config: ReplayGuardConfig,
    metrics: AuthMetrics,
}

impl ReplayGuard {
    /// Guard with an explicit distributed primary.
    pub fn new(
        primary: Arc<dyn ReplayStore>,
        config: ReplayGuardConfig,
        metrics: AuthMetrics,
    ) -> Self {
        Self {
            primary: Some(primary),
            local: Arc::new(LocalReplayStore::new()),
            config,
            metrics,
        }
    }

    /// Guard backed by the local store only.
    pub fn local_only(config: ReplayGuardConfig, metrics: AuthMetrics) -> Self {
        Self {
            primary: None,
            local: Arc::new(LocalReplayStore::new()),
            config,
            metrics,
        }
    }

    /// Select the backend from configuration: Redis when `store_url` is set,
    /// otherwise local only.
    pub fn from_config(
        store_url: Option<&str>,
        config: ReplayGuardConfig,
        metrics: AuthMetrics,
    ) -> Result<Self, ReplayStoreError> {
        match store_url {
            Some(url) => {
                let store = RedisReplayStore::open(url)?;
                Ok(Self::new(Arc::new(store), config, metrics))
            }
            None => Ok(Self::local_only(config, metrics)),
        }
    }

    pub fn config(&self) -> &ReplayGuardConfig {
        &self.config
    }

    /// The local guard, for the sweeper task.
    pub fn local_store(&self) -> Arc<LocalReplayStore> {
        Arc::clone(&self.local)
    }

    pub fn primary_backend(&self) -> ReplayBackendKind {
        self.primary
            .as_ref()
            .map_or(ReplayBackendKind::Local, |p| p.backend())
    }

    /// Replay key for a request: the nonce when supplied, else the timestamp.
    ///
    /// Nonce and timestamp keys carry distinct tags so an all-digit nonce
    /// never lands on a timestamp key.
    pub fn replay_key(&self, client_id: &str, timestamp_ms: i64, nonce: Option<&str>) -> String {
        match nonce {
            Some(nonce) => format!("{}{client_id}:n:{nonce}", self.config.key_prefix),
            None => format!("{}{client_id}:t:{timestamp_ms}", self.config.key_prefix),
        }
    }

    /// Record lifetime for a request stamped `timestamp_ms`, seen at `now_ms`.
    ///
    /// A future-dated request stays inside the window until
    /// `timestamp_ms + W`, so its record must outlive that point.
    pub fn ttl_for(&self, timestamp_ms: i64, now_ms: i64) -> Duration {
        let window_ms = i64::try_from(self.config.max_clock_skew.as_millis()).unwrap_or(i64::MAX);
        let remaining_ms = timestamp_ms
            .saturating_add(window_ms)
            .saturating_sub(now_ms)
            .max(0);
        let remaining = Duration::from_millis(remaining_ms as u64) + REPLAY_TTL_MARGIN;
        remaining.max(self.config.record_ttl)
    }

    /// Claim the replay key for one request.
    pub async fn claim(
        &self,
        client_id: &str,
        timestamp_ms: i64,
        nonce: Option<&str>,
        now_ms: i64,
    ) -> ClaimOutcome {
        let key = self.replay_key(client_id, timestamp_ms, nonce);
        let ttl = self.ttl_for(timestamp_ms, now_ms);

        let Some(primary) = &self.primary else {
            return self.claim_locally(&key, ttl, false);
        };

        let backend = primary.backend().as_str();
        let started = Instant::now();
        let result =
            match tokio::time::timeout(self.config.store_timeout, primary.try_claim(&key, ttl))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ReplayStoreError::Timeout),
            };
        self.metrics
            .observe_claim_duration(backend, started.elapsed().as_secs_f64());

        match result {
            Ok(true) => {
                // Mirror; a local hit means the key was taken during an outage.
                if self.local.try_claim_now(&key, ttl) {
                    ClaimOutcome::Claimed { degraded: false }
                } else {
                    ClaimOutcome::Replayed { degraded: false }
                }
            }
            Ok(false) => ClaimOutcome::Replayed { degraded: false },
            Err(e) => {
                self.metrics.record_store_error(e.kind());
                match self.config.failure_policy {
                    FailurePolicy::FailClosed => {
                        warn!(
                            error = %e,
                            backend,
                            policy = FailurePolicy::FailClosed.as_str(),
                            "Replay store unavailable; rejecting request"
                        );
                        ClaimOutcome::Unavailable
                    }
                    FailurePolicy::FailOpen => {
                        warn!(
                            error = %e,
                            backend,
                            policy = FailurePolicy::FailOpen.as_str(),
                            "Replay store unavailable; falling back to local guard"
                        );
                        self.metrics.record_cache_fallback();
                        self.claim_locally(&key, ttl, true)
                    }
                }
            }
        }
    }

    fn claim_locally(&self, key: &str, ttl: Duration, degraded: bool) -> ClaimOutcome {
        let started = Instant::now();
        let claimed = self.local.try_claim_now(key, ttl);
        self.metrics.observe_claim_duration(
            ReplayBackendKind::Local.as_str(),
            started.elapsed().as_secs_f64(),
        );
        if claimed {
            ClaimOutcome::Claimed { degraded }
        } else {
            ClaimOutcome::Replayed { degraded }
        }
    }

    /// Probe the primary store within the configured timeout.
    pub async fn store_health(&self) -> ReplayStoreHealth {
        let Some(primary) = &self.primary else {
            return ReplayStoreHealth::Local;
        };
        match tokio::time::timeout(self.config.store_timeout, primary.ping()).await {
            Ok(Ok(())) => ReplayStoreHealth::Ok,
            Ok(Err(_)) | Err(_) => ReplayStoreHealth::Unavailable,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;

    const NOW: i64 = 1_700_000_000_000;
    const W: Duration = Duration::from_secs(300);

    /// Always-failing store for outage tests.
    pub(crate) struct UnreachableStore;

    #[async_trait]
    impl ReplayStore for UnreachableStore {
        fn backend(&self) -> ReplayBackendKind {
            ReplayBackendKind::Distributed
        }

        async fn try_claim(&self, _: &str, _: Duration) -> Result<bool, ReplayStoreError> {
            Err(ReplayStoreError::Connection("connection refused".into()))
        }

        async fn ping(&self) -> Result<(), ReplayStoreError> {
            Err(ReplayStoreError::Connection("connection refused".into()))
        }
    }

    /// Store that never answers.
    pub(crate) struct HangingStore;

    #[async_trait]
    impl ReplayStore for HangingStore {
        fn backend(&self) -> ReplayBackendKind {
            ReplayBackendKind::Distributed
        }

        async fn try_claim(&self, _: &str, _: Duration) -> Result<bool, ReplayStoreError> {
            std::future::pending().await
        }

        async fn ping(&self) -> Result<(), ReplayStoreError> {
            std::future::pending().await
        }
    }

    /// Shared in-memory stand-in for the distributed store.
    #[derive(Default)]
    pub(crate) struct SharedMemoryStore {
        inner: LocalReplayStore,
    }

    #[async_trait]
    impl ReplayStore for SharedMemoryStore {
        fn backend(&self) -> ReplayBackendKind {
            ReplayBackendKind::Distributed
        }

        async fn try_claim(&self, key: &str, ttl: Duration) -> Result<bool, ReplayStoreError> {
            Ok(self.inner.try_claim_now(key, ttl))
        }

        async fn ping(&self) -> Result<(), ReplayStoreError> {
            Ok(())
        }
    }

    fn metrics() -> AuthMetrics {
        MetricsRegistry::new().unwrap().auth_metrics().clone()
    }

    fn config(policy: FailurePolicy) -> ReplayGuardConfig {
        ReplayGuardConfig {
            failure_policy: policy,
            store_timeout: Duration::from_millis(50),
            ..ReplayGuardConfig::new(W)
        }
    }

    #[test]
    fn keys_use_nonce_when_present() {
        let guard = ReplayGuard::local_only(ReplayGuardConfig::new(W), metrics());
        assert_eq!(guard.replay_key("acme", NOW, None), "auth:replay:acme:t:1700000000000");
        assert_eq!(guard.replay_key("acme", NOW, Some("n-1")), "auth:replay:acme:n:n-1");
    }

    #[test]
    fn digit_nonces_do_not_collide_with_timestamp_keys() {
        let guard = ReplayGuard::local_only(ReplayGuardConfig::new(W), metrics());
        let stamped = guard.replay_key("acme", NOW, None);
        let nonced = guard.replay_key("acme", NOW + 1, Some(&NOW.to_string()));
        assert_ne!(stamped, nonced);
    }

    #[test]
    fn default_record_ttl_exceeds_window_by_margin() {
        let config = ReplayGuardConfig::new(W);
        assert_eq!(config.record_ttl, W + REPLAY_TTL_MARGIN);
        assert_eq!(config.failure_policy, FailurePolicy::FailClosed);
    }

    #[test]
    fn ttl_covers_future_dated_requests() {
        let guard = ReplayGuard::local_only(ReplayGuardConfig::new(W), metrics());

        // Current request: the configured minimum applies.
        assert_eq!(guard.ttl_for(NOW, NOW), W + REPLAY_TTL_MARGIN);
        // Old request: still the configured minimum.
        assert_eq!(guard.ttl_for(NOW - 200_000, NOW), W + REPLAY_TTL_MARGIN);
        // Request stamped at the far edge of the window.
        assert_eq!(
            guard.ttl_for(NOW + 300_000, NOW),
            Duration::from_millis(600_000) + REPLAY_TTL_MARGIN
        );
    }

    #[test]
    fn parses_failure_policies() {
        assert_eq!("fail_open".parse(), Ok(FailurePolicy::FailOpen));
        assert_eq!("FAIL-CLOSED".parse(), Ok(FailurePolicy::FailClosed));
        assert!("sometimes".parse::<FailurePolicy>().is_err());
    }

    #[tokio::test]
    async fn local_only_guard_rejects_second_claim() {
        let guard = ReplayGuard::local_only(ReplayGuardConfig::new(W), metrics());
        assert_eq!(
            guard.claim("acme", NOW, None, NOW).await,
            ClaimOutcome::Claimed { degraded: false }
        );
        assert_eq!(
            guard.claim("acme", NOW, None, NOW).await,
            ClaimOutcome::Replayed { degraded: false }
        );
        assert_eq!(guard.store_health().await, ReplayStoreHealth::Local);
    }

    #[tokio::test]
    async fn fail_closed_reports_unavailable() {
        let metrics = metrics();
        let guard = ReplayGuard::new(
            Arc::new(UnreachableStore),
            config(FailurePolicy::FailClosed),
            metrics.clone(),
        );

        assert_eq!(guard.claim("acme", NOW, None, NOW).await, ClaimOutcome::Unavailable);
        assert_eq!(guard.claim("acme", NOW, None, NOW).await, ClaimOutcome::Unavailable);
        assert_eq!(metrics.store_error_count("connection"), 2);
        assert_eq!(metrics.cache_fallback_count(), 0);
        assert_eq!(guard.store_health().await, ReplayStoreHealth::Unavailable);
    }

    #[tokio::test]
    async fn fail_open_falls_back_and_still_detects_replays() {
        let metrics = metrics();
        let guard = ReplayGuard::new(
            Arc::new(UnreachableStore),
            config(FailurePolicy::FailOpen),
            metrics.clone(),
        );

        assert_eq!(
            guard.claim("acme", NOW, None, NOW).await,
            ClaimOutcome::Claimed { degraded: true }
        );
        assert_eq!(
            guard.claim("acme", NOW, None, NOW).await,
            ClaimOutcome::Replayed { degraded: true }
        );
        assert_eq!(metrics.cache_fallback_count(), 2);
    }

    #[tokio::test]
    async fn hanging_store_times_out() {
        let metrics = metrics();
        let guard = ReplayGuard::new(
            Arc::new(HangingStore),
            config(FailurePolicy::FailClosed),
            metrics.clone(),
        );

        assert_eq!(guard.claim("acme", NOW, None, NOW).await, ClaimOutcome::Unavailable);
        assert_eq!(metrics.store_error_count("timeout"), 1);
    }

    #[tokio::test]
    async fn distributed_claims_are_mirrored_locally() {
        let guard = ReplayGuard::new(
            Arc::new(SharedMemoryStore::default()),
            config(FailurePolicy::FailOpen),
            metrics(),
        );

        // Key taken locally during an outage, unknown to the primary.
        guard.local_store().try_claim_now(
            &guard.replay_key("acme", NOW, None),
            Duration::from_secs(60),
        );
        assert_eq!(
            guard.claim("acme", NOW, None, NOW).await,
            ClaimOutcome::Replayed { degraded: false }
        );

        assert_eq!(
            guard.claim("acme", NOW + 1, None, NOW).await,
            ClaimOutcome::Claimed { degraded: false }
        );
        assert_eq!(guard.local_store().len(), 2);
    }

    #[tokio::test]
    async fn workers_sharing_a_store_admit_one_claim() {
        let shared: Arc<dyn ReplayStore> = Arc::new(SharedMemoryStore::default());
        // Separate guards model separate worker processes.
        let guards: Vec<_> = (0..8)
            .map(|_| ReplayGuard::new(Arc::clone(&shared), config(FailurePolicy::FailClosed), metrics()))
            .collect();

        let handles: Vec<_> = guards
            .into_iter()
            .map(|guard| tokio::spawn(async move { guard.claim("acme", NOW, None, NOW).await }))
            .collect();

        let mut claimed = 0;
        let mut replayed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ClaimOutcome::Claimed { .. } => claimed += 1,
                ClaimOutcome::Replayed { .. } => replayed += 1,
                ClaimOutcome::Unavailable => panic!("store is reachable"),
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(replayed, 7);
    }

    #[test]
    fn factory_selects_backend_from_url() {
        let local = ReplayGuard::from_config(None, ReplayGuardConfig::new(W), metrics()).unwrap();
        assert_eq!(local.primary_backend(), ReplayBackendKind::Local);

        let redis = ReplayGuard::from_config(
            Some("redis://127.0.0.1:6379"),
            ReplayGuardConfig::new(W),
            metrics(),
        )
        .unwrap();
        assert_eq!(redis.primary_backend(), ReplayBackendKind::Distributed);
    }
}
