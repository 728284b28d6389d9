// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Auth Pipeline
//!
//! One ordered accept/reject decision per request:
//!
//! ```text
//! Received → HeaderParsed → SignatureChecked → SkewChecked → ReplayChecked → Authorized
//!     │            │               │                │              │
//!     └────────────┴───────────────┴────────────────┴──────────────┴──→ Rejected(reason)
//! ```
//!
//! Each stage short-circuits on its own failure. The replay key is claimed
//! last, after signature and skew pass, so a forged or stale request never
//! consumes a key that a legitimate retry might need.
//!
//! [`AuthPipeline::authenticate`] records the terminal state in
//! [`AuthMetrics`] exactly once, whatever branch was taken.
//!
//! ## Bypass
//!
//! When a bypass token is configured, a request carrying a matching
//! `x-auth-bypass` header is authorized without verification and counted
//! under `mode="bypass"`. A non-matching marker is ignored and the request
//! goes through normal verification.

use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Serialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};
use utoipa::ToSchema;

use super::canonical::{validate_client_id, BodyDigest, CanonicalError, CanonicalRequest};
use super::replay::{ClaimOutcome, ReplayGuard};
use super::signature::{decode_signature, SignatureVerifier};
use super::skew::{parse_timestamp_ms, ClockSkewValidator};
use crate::metrics::AuthMetrics;

/// Client identifier header.
pub const CLIENT_ID_HEADER: &str = "x-client-id";
/// Millisecond epoch timestamp header.
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
/// Hex or base64 HMAC-SHA256 signature header.
pub const SIGNATURE_HEADER: &str = "x-signature";
/// Optional explicit nonce header.
pub const NONCE_HEADER: &str = "x-nonce";
/// Non-production bypass marker header.
pub const BYPASS_HEADER: &str = "x-auth-bypass";

/// Why a request was authorized or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthReason {
    Ok,
    MissingHeader,
    BadSignature,
    ClockSkew,
    Replay,
    CacheUnavailable,
}

impl AuthReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthReason::Ok => "ok",
            AuthReason::MissingHeader => "missing_header",
            AuthReason::BadSignature => "bad_signature",
            AuthReason::ClockSkew => "clock_skew",
            AuthReason::Replay => "replay",
            AuthReason::CacheUnavailable => "cache_unavailable",
        }
    }
}

/// How a request was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Fully verified against the configured replay store.
    Signed,
    /// Verified, but the replay claim was served by the local guard after a
    /// distributed store failure.
    Degraded,
    /// Authorized by the non-production bypass marker.
    Bypass,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::Signed => "signed",
            AuthMode::Degraded => "degraded",
            AuthMode::Bypass => "bypass",
        }
    }
}

/// Last stage a request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthStage {
    Received,
    HeaderParsed,
    SignatureChecked,
    SkewChecked,
    ReplayChecked,
}

/// Terminal state of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub reason: AuthReason,
    pub mode: AuthMode,
    /// Measured skew; `None` when the request never reached the skew stage.
    pub skew_ms: Option<u64>,
    pub client_id: Option<String>,
    pub reached: AuthStage,
}

impl AuthOutcome {
    fn at_stage(reason: AuthReason, reached: AuthStage) -> Self {
        Self {
            reason,
            mode: AuthMode::Signed,
            skew_ms: None,
            client_id: None,
            reached,
        }
    }

    fn with_client(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    fn with_skew(mut self, skew_ms: u64) -> Self {
        self.skew_ms = Some(skew_ms);
        self
    }

    pub fn is_authorized(&self) -> bool {
        self.reason == AuthReason::Ok
    }

    pub fn outcome_label(&self) -> &'static str {
        if self.is_authorized() {
            "authorized"
        } else {
            "rejected"
        }
    }
}

/// A request as seen by the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct IncomingRequest<'a> {
    pub method: &'a str,
    /// Path plus query string, exactly as signed.
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub body_digest: BodyDigest,
}

/// Reasons the auth headers could not be parsed.
#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("missing {0} header")]
    Missing(&'static str),

    #[error("{0} header is not valid ASCII")]
    NotAscii(&'static str),

    #[error("{0} header is malformed")]
    Malformed(&'static str),

    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// Parsed auth headers plus the canonical bytes they sign.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub client_id: String,
    pub timestamp_ms: i64,
    pub signature: Vec<u8>,
    pub nonce: Option<String>,
    pub canonical: Vec<u8>,
}

impl SignedRequest {
    pub fn from_request(request: &IncomingRequest<'_>) -> Result<Self, HeaderError> {
        let client_id = required_header(request.headers, CLIENT_ID_HEADER)?;
        validate_client_id(client_id)?;

        let timestamp_ms = parse_timestamp_ms(required_header(request.headers, TIMESTAMP_HEADER)?)
            .ok_or(HeaderError::Malformed(TIMESTAMP_HEADER))?;

        let signature = decode_signature(required_header(request.headers, SIGNATURE_HEADER)?)
            .map_err(|_| HeaderError::Malformed(SIGNATURE_HEADER))?;

        let nonce = optional_header(request.headers, NONCE_HEADER)?;

        let canonical = CanonicalRequest {
            method: request.method,
            path: request.path,
            timestamp_ms,
            body_digest: &request.body_digest,
            client_id,
            nonce,
        }
        .encode()?;

        Ok(Self {
            client_id: client_id.to_string(),
            timestamp_ms,
            signature,
            nonce: nonce.map(str::to_string),
            canonical,
        })
    }
}

fn required_header<'h>(headers: &'h HeaderMap, name: &'static str) -> Result<&'h str, HeaderError> {
    optional_header(headers, name)?.ok_or(HeaderError::Missing(name))
}

fn optional_header<'h>(
    headers: &'h HeaderMap,
    name: &'static str,
) -> Result<Option<&'h str>, HeaderError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(Some)
            .map_err(|_| HeaderError::NotAscii(name)),
    }
}

/// Orchestrates signature, skew and replay checks.
#[derive(Clone)]
pub struct AuthPipeline {
    verifier: SignatureVerifier,
    skew: ClockSkewValidator,
    replay: ReplayGuard,
    metrics: AuthMetrics,
    bypass_token: Option<Arc<[u8]>>,
}

impl AuthPipeline {
    pub fn new(
        verifier: SignatureVerifier,
        skew: ClockSkewValidator,
        replay: ReplayGuard,
        metrics: AuthMetrics,
    ) -> Self {
        Self {
            verifier,
            skew,
            replay,
            metrics,
            bypass_token: None,
        }
    }

    /// Enable the bypass marker. Empty tokens leave bypass disabled.
    pub fn with_bypass(mut self, token: Option<&str>) -> Self {
        self.bypass_token = token
            .filter(|t| !t.is_empty())
            .map(|t| Arc::from(t.as_bytes()));
        self
    }

    pub fn bypass_enabled(&self) -> bool {
        self.bypass_token.is_some()
    }

    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay
    }

    /// Run the full pipeline for one request received at `received_at_ms`.
    pub async fn authenticate(
        &self,
        request: &IncomingRequest<'_>,
        received_at_ms: i64,
    ) -> AuthOutcome {
        let outcome = self.evaluate(request, received_at_ms).await;
        self.record(&outcome);
        outcome
    }

    async fn evaluate(&self, request: &IncomingRequest<'_>, received_at_ms: i64) -> AuthOutcome {
        if let Some(outcome) = self.check_bypass(request.headers) {
            return outcome;
        }

        let signed = match SignedRequest::from_request(request) {
            Ok(signed) => signed,
            Err(e) => {
                debug!(error = %e, "Rejecting request with unusable auth headers");
                return AuthOutcome::at_stage(AuthReason::MissingHeader, AuthStage::Received);
            }
        };
        let client_id = signed.client_id.as_str();

        let check = self
            .verifier
            .verify(client_id, &signed.canonical, &signed.signature)
            .await;
        if !check.is_valid() {
            debug!(client_id = %client_id, check = check.as_str(), "Signature rejected");
            return AuthOutcome::at_stage(AuthReason::BadSignature, AuthStage::HeaderParsed)
                .with_client(client_id);
        }

        let measurement = self.skew.measure(signed.timestamp_ms, received_at_ms);
        self.metrics
            .observe_skew(measurement.direction.as_str(), measurement.delta_ms);
        if !self.skew.is_within_window(&measurement) {
            return AuthOutcome::at_stage(AuthReason::ClockSkew, AuthStage::SignatureChecked)
                .with_client(client_id)
                .with_skew(measurement.delta_ms);
        }

        let claim = self
            .replay
            .claim(
                client_id,
                signed.timestamp_ms,
                signed.nonce.as_deref(),
                received_at_ms,
            )
            .await;

        let (reason, reached, degraded) = match claim {
            ClaimOutcome::Claimed { degraded } => (AuthReason::Ok, AuthStage::ReplayChecked, degraded),
            ClaimOutcome::Replayed { degraded } => (AuthReason::Replay, AuthStage::SkewChecked, degraded),
            ClaimOutcome::Unavailable => (AuthReason::CacheUnavailable, AuthStage::SkewChecked, false),
        };

        let mut outcome = AuthOutcome::at_stage(reason, reached)
            .with_client(client_id)
            .with_skew(measurement.delta_ms);
        if degraded {
            outcome.mode = AuthMode::Degraded;
        }
        outcome
    }

    fn check_bypass(&self, headers: &HeaderMap) -> Option<AuthOutcome> {
        let expected = self.bypass_token.as_ref()?;
        let supplied = headers.get(BYPASS_HEADER)?;
        if !bool::from(expected.as_ref().ct_eq(supplied.as_bytes())) {
            debug!("Ignoring bypass marker that does not match the configured token");
            return None;
        }

        let client_id = headers
            .get(CLIENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|id| validate_client_id(id).is_ok());
        debug!(client_id = ?client_id, "Request authorized by bypass marker");

        Some(AuthOutcome {
            reason: AuthReason::Ok,
            mode: AuthMode::Bypass,
            skew_ms: None,
            client_id: client_id.map(str::to_string),
            reached: AuthStage::Received,
        })
    }

    fn record(&self, outcome: &AuthOutcome) {
        self.metrics.record_attempt(
            outcome.outcome_label(),
            outcome.reason.as_str(),
            outcome.mode.as_str(),
        );

        match outcome.reason {
            AuthReason::Ok => {}
            AuthReason::Replay => {
                self.metrics.record_replay(outcome.mode.as_str());
                warn!(
                    client_id = ?outcome.client_id,
                    mode = outcome.mode.as_str(),
                    "Replayed request rejected"
                );
            }
            reason => {
                debug!(
                    client_id = ?outcome.client_id,
                    reason = reason.as_str(),
                    skew_ms = ?outcome.skew_ms,
                    "Request rejected"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::canonical::body_digest;
    use crate::auth::replay::tests::{SharedMemoryStore, UnreachableStore};
    use crate::auth::replay::{FailurePolicy, ReplayGuardConfig, ReplayStore};
    use crate::auth::skew::now_ms;
    use crate::auth::testutil::{self, TestRequest, SECRET, WINDOW};

    const NOW: i64 = 1_700_000_000_000;

    async fn run(pipeline: &AuthPipeline, req: &TestRequest, headers: &HeaderMap, now: i64) -> AuthOutcome {
        let incoming = IncomingRequest {
            method: req.method,
            path: &req.path,
            headers,
            body_digest: body_digest(&req.body),
        };
        pipeline.authenticate(&incoming, now).await
    }

    async fn send(pipeline: &AuthPipeline, req: &TestRequest, now: i64) -> AuthOutcome {
        run(pipeline, req, &req.headers(SECRET), now).await
    }

    #[tokio::test]
    async fn valid_request_is_authorized_then_replayed() {
        let metrics = testutil::metrics();
        let pipeline = testutil::local_pipeline(metrics.clone());
        let req = TestRequest::post("/v1/whoami", NOW, br#"{"a":1}"#);

        let first = send(&pipeline, &req, NOW).await;
        assert!(first.is_authorized());
        assert_eq!(first.mode, AuthMode::Signed);
        assert_eq!(first.reached, AuthStage::ReplayChecked);
        assert_eq!(first.client_id.as_deref(), Some("acme"));

        for _ in 0..3 {
            let again = send(&pipeline, &req, NOW + 5).await;
            assert_eq!(again.reason, AuthReason::Replay);
        }

        assert_eq!(metrics.attempt_count("authorized", "ok", "signed"), 1);
        assert_eq!(metrics.attempt_count("rejected", "replay", "signed"), 3);
        assert_eq!(metrics.replay_count("signed"), 3);
    }

    #[tokio::test]
    async fn stale_timestamp_is_clock_skew() {
        let metrics = testutil::metrics();
        let pipeline = testutil::local_pipeline(metrics.clone());
        let req = TestRequest::post("/v1/whoami", NOW - 400_000, b"");

        let outcome = send(&pipeline, &req, NOW).await;
        assert_eq!(outcome.reason, AuthReason::ClockSkew);
        assert_eq!(outcome.skew_ms, Some(400_000));
        assert_eq!(metrics.skew_sample_count("past"), 1);
        assert_eq!(metrics.attempt_count("rejected", "clock_skew", "signed"), 1);
    }

    #[tokio::test]
    async fn future_timestamp_outside_window_is_clock_skew() {
        let pipeline = testutil::local_pipeline(testutil::metrics());
        let req = TestRequest::get("/v1/whoami", NOW + 300_001);
        assert_eq!(send(&pipeline, &req, NOW).await.reason, AuthReason::ClockSkew);

        let edge = TestRequest::get("/v1/whoami", NOW + 300_000);
        assert!(send(&pipeline, &edge, NOW).await.is_authorized());
    }

    #[tokio::test]
    async fn missing_signature_is_missing_header() {
        let metrics = testutil::metrics();
        let pipeline = testutil::local_pipeline(metrics.clone());
        let req = TestRequest::post("/v1/whoami", NOW, b"");
        let mut headers = req.headers(SECRET);
        headers.remove(SIGNATURE_HEADER);

        let outcome = run(&pipeline, &req, &headers, NOW).await;
        assert_eq!(outcome.reason, AuthReason::MissingHeader);
        assert_eq!(outcome.skew_ms, None);
        assert_eq!(outcome.reached, AuthStage::Received);
        assert_eq!(metrics.attempt_count("rejected", "missing_header", "signed"), 1);
        assert_eq!(metrics.skew_sample_count("past"), 0);
    }

    #[tokio::test]
    async fn malformed_headers_are_missing_header() {
        let pipeline = testutil::local_pipeline(testutil::metrics());
        let req = TestRequest::post("/v1/whoami", NOW, b"");

        for (name, value) in [
            (TIMESTAMP_HEADER, "-1"),
            (TIMESTAMP_HEADER, "17e11"),
            (TIMESTAMP_HEADER, "soon"),
            (SIGNATURE_HEADER, "%%%"),
            (CLIENT_ID_HEADER, "acme:evil"),
            (NONCE_HEADER, "has space"),
        ] {
            let mut headers = req.headers(SECRET);
            headers.insert(name, value.parse().unwrap());
            let outcome = run(&pipeline, &req, &headers, NOW).await;
            assert_eq!(outcome.reason, AuthReason::MissingHeader, "{name}={value}");
        }
    }

    #[tokio::test]
    async fn tampering_invalidates_signature() {
        let pipeline = testutil::local_pipeline(testutil::metrics());
        let original = TestRequest::post("/v1/whoami?x=1", NOW, b"body");
        let headers = original.headers(SECRET);

        let mut tampered = original.clone();
        tampered.method = "PUT";
        assert_eq!(run(&pipeline, &tampered, &headers, NOW).await.reason, AuthReason::BadSignature);

        let mut tampered = original.clone();
        tampered.path = "/v1/whoami?x=2".into();
        assert_eq!(run(&pipeline, &tampered, &headers, NOW).await.reason, AuthReason::BadSignature);

        let mut tampered = original.clone();
        tampered.body = b"bodY".to_vec();
        assert_eq!(run(&pipeline, &tampered, &headers, NOW).await.reason, AuthReason::BadSignature);

        // Client id header swapped for another registered-looking client.
        let mut headers_other = headers.clone();
        headers_other.insert(CLIENT_ID_HEADER, "acmf".parse().unwrap());
        assert_eq!(
            run(&pipeline, &original, &headers_other, NOW).await.reason,
            AuthReason::BadSignature
        );

        // The untouched request still goes through.
        assert!(run(&pipeline, &original, &headers, NOW).await.is_authorized());
    }

    #[tokio::test]
    async fn wrong_secret_and_unknown_client_are_bad_signature() {
        let pipeline = testutil::local_pipeline(testutil::metrics());
        let req = TestRequest::post("/v1/whoami", NOW, b"");
        let outcome = run(&pipeline, &req, &req.headers("not-the-secret"), NOW).await;
        assert_eq!(outcome.reason, AuthReason::BadSignature);
        assert_eq!(outcome.skew_ms, None);

        let mut stranger = req.clone();
        stranger.client_id = "globex".into();
        assert_eq!(send(&pipeline, &stranger, NOW).await.reason, AuthReason::BadSignature);
    }

    #[tokio::test]
    async fn bad_signature_does_not_consume_replay_key() {
        let pipeline = testutil::local_pipeline(testutil::metrics());
        let req = TestRequest::post("/v1/whoami", NOW, b"");

        let forged = run(&pipeline, &req, &req.headers("forged"), NOW).await;
        assert_eq!(forged.reason, AuthReason::BadSignature);
        assert!(send(&pipeline, &req, NOW).await.is_authorized());
    }

    #[tokio::test]
    async fn nonce_replaces_timestamp_in_replay_key() {
        let pipeline = testutil::local_pipeline(testutil::metrics());
        let mut first = TestRequest::post("/v1/whoami", NOW, b"");
        first.nonce = Some("n-1".into());
        let mut second = first.clone();
        second.nonce = Some("n-2".into());

        assert!(send(&pipeline, &first, NOW).await.is_authorized());
        assert!(send(&pipeline, &second, NOW).await.is_authorized());
        assert_eq!(send(&pipeline, &first, NOW).await.reason, AuthReason::Replay);
    }

    #[tokio::test]
    async fn digit_nonce_matching_an_earlier_timestamp_is_fresh() {
        let pipeline = testutil::local_pipeline(testutil::metrics());
        let stamped = TestRequest::post("/v1/whoami", NOW, b"");
        let mut nonced = TestRequest::post("/v1/whoami", NOW + 1, b"");
        nonced.nonce = Some(NOW.to_string());

        assert!(send(&pipeline, &stamped, NOW).await.is_authorized());
        let outcome = send(&pipeline, &nonced, NOW + 1).await;
        assert_eq!(outcome.reason, AuthReason::Ok);
    }

    #[tokio::test]
    async fn base64_signatures_are_accepted() {
        use base64ct::{Base64, Encoding};

        let pipeline = testutil::local_pipeline(testutil::metrics());
        let req = TestRequest::post("/v1/whoami", NOW, b"");
        let raw = hex::decode(req.signature(SECRET)).unwrap();
        let mut headers = req.headers(SECRET);
        headers.insert(SIGNATURE_HEADER, Base64::encode_string(&raw).parse().unwrap());

        assert!(run(&pipeline, &req, &headers, NOW).await.is_authorized());
    }

    #[tokio::test]
    async fn fail_closed_outage_is_cache_unavailable() {
        let metrics = testutil::metrics();
        let config = ReplayGuardConfig {
            failure_policy: FailurePolicy::FailClosed,
            ..ReplayGuardConfig::new(WINDOW)
        };
        let guard = ReplayGuard::new(Arc::new(UnreachableStore), config, metrics.clone());
        let pipeline = testutil::pipeline_with(guard, metrics.clone());
        let req = TestRequest::post("/v1/whoami", NOW, b"");

        let outcome = send(&pipeline, &req, NOW).await;
        assert_eq!(outcome.reason, AuthReason::CacheUnavailable);
        assert_eq!(metrics.attempt_count("rejected", "cache_unavailable", "signed"), 1);
        assert_eq!(metrics.cache_fallback_count(), 0);
    }

    #[tokio::test]
    async fn fail_open_outage_falls_back_and_keeps_replay_protection() {
        let metrics = testutil::metrics();
        let config = ReplayGuardConfig {
            failure_policy: FailurePolicy::FailOpen,
            ..ReplayGuardConfig::new(WINDOW)
        };
        let guard = ReplayGuard::new(Arc::new(UnreachableStore), config, metrics.clone());
        let pipeline = testutil::pipeline_with(guard, metrics.clone());
        let req = TestRequest::post("/v1/whoami", NOW, b"");

        let first = send(&pipeline, &req, NOW).await;
        assert!(first.is_authorized());
        assert_eq!(first.mode, AuthMode::Degraded);
        assert_eq!(metrics.cache_fallback_count(), 1);

        let second = send(&pipeline, &req, NOW).await;
        assert_eq!(second.reason, AuthReason::Replay);
        assert_eq!(metrics.attempt_count("authorized", "ok", "degraded"), 1);
        assert_eq!(metrics.replay_count("degraded"), 1);
        assert_eq!(metrics.store_error_count("connection"), 2);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_admit_exactly_one() {
        const N: usize = 32;
        let metrics = testutil::metrics();
        let shared: Arc<dyn ReplayStore> = Arc::new(SharedMemoryStore::default());
        let now = now_ms();
        let req = TestRequest::post("/v1/whoami", now, b"{}");

        let handles: Vec<_> = (0..N)
            .map(|_| {
                // One pipeline per task models independent worker processes.
                let guard = ReplayGuard::new(
                    Arc::clone(&shared),
                    ReplayGuardConfig::new(WINDOW),
                    metrics.clone(),
                );
                let pipeline = testutil::pipeline_with(guard, metrics.clone());
                let req = req.clone();
                tokio::spawn(async move { send(&pipeline, &req, now).await.reason })
            })
            .collect();

        let mut authorized = 0;
        let mut replayed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                AuthReason::Ok => authorized += 1,
                AuthReason::Replay => replayed += 1,
                other => panic!("unexpected reason {other:?}"),
            }
        }
        assert_eq!(authorized, 1);
        assert_eq!(replayed, N - 1);
        assert_eq!(metrics.replay_count("signed"), (N - 1) as u64);
    }

    #[tokio::test]
    async fn bypass_is_off_by_default() {
        let pipeline = testutil::local_pipeline(testutil::metrics());
        let mut headers = HeaderMap::new();
        headers.insert(BYPASS_HEADER, "anything".parse().unwrap());
        let req = TestRequest::get("/v1/whoami", NOW);

        assert!(!pipeline.bypass_enabled());
        assert_eq!(run(&pipeline, &req, &headers, NOW).await.reason, AuthReason::MissingHeader);
    }

    #[tokio::test]
    async fn bypass_marker_is_labelled_separately() {
        let metrics = testutil::metrics();
        let pipeline = testutil::local_pipeline(metrics.clone()).with_bypass(Some("stub-token"));
        let req = TestRequest::get("/v1/whoami", NOW);

        let mut headers = HeaderMap::new();
        headers.insert(BYPASS_HEADER, "stub-token".parse().unwrap());
        let outcome = run(&pipeline, &req, &headers, NOW).await;
        assert!(outcome.is_authorized());
        assert_eq!(outcome.mode, AuthMode::Bypass);
        assert_eq!(metrics.attempt_count("authorized", "ok", "bypass"), 1);
        assert_eq!(metrics.attempt_count("authorized", "ok", "signed"), 0);

        headers.insert(BYPASS_HEADER, "wrong-token".parse().unwrap());
        let outcome = run(&pipeline, &req, &headers, NOW).await;
        assert_eq!(outcome.reason, AuthReason::MissingHeader);
    }

    #[tokio::test]
    async fn empty_bypass_token_stays_disabled() {
        let pipeline = testutil::local_pipeline(testutil::metrics()).with_bypass(Some(""));
        assert!(!pipeline.bypass_enabled());
    }

    #[tokio::test]
    async fn every_request_is_recorded_once() {
        let metrics = testutil::metrics();
        let pipeline = testutil::local_pipeline(metrics.clone());
        let ok = TestRequest::post("/v1/whoami", NOW, b"");
        let stale = TestRequest::post("/v1/whoami", NOW - 1_000_000, b"");

        send(&pipeline, &ok, NOW).await;
        send(&pipeline, &ok, NOW).await;
        send(&pipeline, &stale, NOW).await;
        run(&pipeline, &ok, &HeaderMap::new(), NOW).await;

        let total: u64 = [
            ("authorized", "ok"),
            ("rejected", "replay"),
            ("rejected", "clock_skew"),
            ("rejected", "missing_header"),
        ]
        .iter()
        .map(|(o, r)| metrics.attempt_count(o, r, "signed"))
        .sum();
        assert_eq!(total, 4);
        // Skew observed for the three signed requests that reached that stage.
        assert_eq!(metrics.skew_sample_count("past"), 3);
    }
}
