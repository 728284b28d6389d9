// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Prometheus metrics for request authentication.
//!
//! # Metrics Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `auth_attempts_total` | Counter | `outcome`, `reason`, `mode` |
//! | `auth_replay_attempts_total` | Counter | `mode` |
//! | `auth_cache_fallback_total` | Counter | |
//! | `auth_replay_store_errors_total` | Counter | `kind` |
//! | `auth_clock_skew_ms` | Histogram | `direction` |
//! | `auth_replay_claim_duration_seconds` | Histogram | `backend` |
//!
//! Every label value comes from a closed set of `&'static str`, so series
//! cardinality is fixed. Client ids are never used as label values.
//!
//! # Registries
//!
//! [`MetricsRegistry::new`] builds an isolated registry, which is what tests
//! use; there is no shared default registry to collide on.
//! [`MetricsRegistry::global`] is the single process-wide instance served
//! at `/metrics`, initialised on first use.

use std::sync::OnceLock;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Skew histogram buckets, in milliseconds.
pub const SKEW_BUCKETS_MS: &[f64] = &[
    10.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 5_000.0, 15_000.0, 30_000.0, 60_000.0, 120_000.0,
    300_000.0, 600_000.0,
];

/// Replay store latency buckets, in seconds.
pub const CLAIM_DURATION_BUCKETS: &[f64] =
    &[0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Authentication metrics. Cheap to clone; clones share the same series.
#[derive(Clone)]
pub struct AuthMetrics {
    attempts_total: IntCounterVec,
    replay_attempts_total: IntCounterVec,
    cache_fallback_total: IntCounter,
    replay_store_errors_total: IntCounterVec,
    clock_skew_ms: HistogramVec,
    replay_claim_duration: HistogramVec,
}

impl AuthMetrics {
    /// Create the metrics and register them with `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register (e.g., duplicate name).
    pub fn new(registry: &Registry) -> MetricsResult<Self> {
        let attempts_total = IntCounterVec::new(
            Opts::new("auth_attempts_total", "Authentication attempts by terminal state"),
            &["outcome", "reason", "mode"],
        )?;
        registry.register(Box::new(attempts_total.clone()))?;

        let replay_attempts_total = IntCounterVec::new(
            Opts::new(
                "auth_replay_attempts_total",
                "Requests rejected because their replay key was already claimed",
            ),
            &["mode"],
        )?;
        registry.register(Box::new(replay_attempts_total.clone()))?;

        let cache_fallback_total = IntCounter::new(
            "auth_cache_fallback_total",
            "Replay claims served by the process-local guard after a store failure",
        )?;
        registry.register(Box::new(cache_fallback_total.clone()))?;

        let replay_store_errors_total = IntCounterVec::new(
            Opts::new(
                "auth_replay_store_errors_total",
                "Distributed replay store failures by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(replay_store_errors_total.clone()))?;

        let clock_skew_ms = HistogramVec::new(
            HistogramOpts::new(
                "auth_clock_skew_ms",
                "Absolute distance between request timestamp and server time",
            )
            .buckets(SKEW_BUCKETS_MS.to_vec()),
            &["direction"],
        )?;
        registry.register(Box::new(clock_skew_ms.clone()))?;

        let replay_claim_duration = HistogramVec::new(
            HistogramOpts::new(
                "auth_replay_claim_duration_seconds",
                "Latency of replay key claims",
            )
            .buckets(CLAIM_DURATION_BUCKETS.to_vec()),
            &["backend"],
        )?;
        registry.register(Box::new(replay_claim_duration.clone()))?;

        Ok(Self {
            attempts_total,
            replay_attempts_total,
            cache_fallback_total,
            replay_store_errors_total,
            clock_skew_ms,
            replay_claim_duration,
        })
    }

    // ========================================================================
    // Recording
    // ========================================================================

    /// Record one terminal authentication state.
    pub fn record_attempt(&self, outcome: &str, reason: &str, mode: &str) {
        self.attempts_total
            .with_label_values(&[outcome, reason, mode])
            .inc();
    }

    pub fn record_replay(&self, mode: &str) {
        self.replay_attempts_total.with_label_values(&[mode]).inc();
    }

    pub fn record_cache_fallback(&self) {
        self.cache_fallback_total.inc();
    }

    pub fn record_store_error(&self, kind: &str) {
        self.replay_store_errors_total
            .with_label_values(&[kind])
            .inc();
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn observe_skew(&self, direction: &str, delta_ms: u64) {
        self.clock_skew_ms
            .with_label_values(&[direction])
            .observe(delta_ms as f64);
    }

    pub fn observe_claim_duration(&self, backend: &str, seconds: f64) {
        self.replay_claim_duration
            .with_label_values(&[backend])
            .observe(seconds);
    }

    // ========================================================================
    // Inspection (tests and health reporting)
    // ========================================================================

    pub fn attempt_count(&self, outcome: &str, reason: &str, mode: &str) -> u64 {
        self.attempts_total
            .with_label_values(&[outcome, reason, mode])
            .get()
    }

    pub fn replay_count(&self, mode: &str) -> u64 {
        self.replay_attempts_total.with_label_values(&[mode]).get()
    }

    pub fn cache_fallback_count(&self) -> u64 {
        self.cache_fallback_total.get()
    }

    pub fn store_error_count(&self, kind: &str) -> u64 {
        self.replay_store_errors_total
            .with_label_values(&[kind])
            .get()
    }

    pub fn skew_sample_count(&self, direction: &str) -> u64 {
        self.clock_skew_ms
            .with_label_values(&[direction])
            .get_sample_count()
    }

    /// Zero every series. Intended for test harnesses sharing one registry.
    pub fn reset(&self) {
        self.attempts_total.reset();
        self.replay_attempts_total.reset();
        self.cache_fallback_total.reset();
        self.replay_store_errors_total.reset();
        self.clock_skew_ms.reset();
        self.replay_claim_duration.reset();
    }
}

/// Prometheus registry plus the authentication metrics registered in it.
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    auth_metrics: AuthMetrics,
}

static GLOBAL_REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

impl MetricsRegistry {
    /// Creates a new, isolated registry with all metrics registered.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails.
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let auth_metrics = AuthMetrics::new(&registry)?;
        Ok(Self {
            registry,
            auth_metrics,
        })
    }

    /// The process-wide registry, created on first call.
    ///
    /// Repeated calls return the same instance, so initialisation can never
    /// register a metric twice.
    pub fn global() -> MetricsResult<&'static MetricsRegistry> {
        if let Some(existing) = GLOBAL_REGISTRY.get() {
            return Ok(existing);
        }
        let fresh = Self::new()?;
        Ok(GLOBAL_REGISTRY.get_or_init(|| fresh))
    }

    pub fn auth_metrics(&self) -> &AuthMetrics {
        &self.auth_metrics
    }

    /// Encodes all metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }
}
