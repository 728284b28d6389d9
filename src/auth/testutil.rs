// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Helpers for building signed requests in tests.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};

use super::canonical::{body_digest, CanonicalRequest};
use super::credentials::{SharedSecret, StaticCredentialStore};
use super::pipeline::{
    AuthPipeline, CLIENT_ID_HEADER, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use super::replay::{ReplayGuard, ReplayGuardConfig};
use super::signature::{sign_hex, SignatureVerifier};
use super::skew::ClockSkewValidator;
use crate::metrics::{AuthMetrics, MetricsRegistry};

pub const CLIENT: &str = "acme";
pub const SECRET: &str = "s";
pub const WINDOW: Duration = Duration::from_secs(300);

/// A request to sign, with the fields the caller controls.
#[derive(Debug, Clone)]
pub struct TestRequest {
    pub method: &'static str,
    pub path: String,
    pub timestamp_ms: i64,
    pub body: Vec<u8>,
    pub client_id: String,
    pub nonce: Option<String>,
}

impl TestRequest {
    pub fn post(path: &str, timestamp_ms: i64, body: &[u8]) -> Self {
        Self {
            method: "POST",
            path: path.to_string(),
            timestamp_ms,
            body: body.to_vec(),
            client_id: CLIENT.to_string(),
            nonce: None,
        }
    }

    pub fn get(path: &str, timestamp_ms: i64) -> Self {
        Self {
            method: "GET",
            ..Self::post(path, timestamp_ms, b"")
        }
    }

    pub fn signature(&self, secret: &str) -> String {
        let digest = body_digest(&self.body);
        let canonical = CanonicalRequest {
            method: self.method,
            path: &self.path,
            timestamp_ms: self.timestamp_ms,
            body_digest: &digest,
            client_id: &self.client_id,
            nonce: self.nonce.as_deref(),
        }
        .encode()
        .unwrap();
        sign_hex(&SharedSecret::new(secret), &canonical).unwrap()
    }

    /// Auth headers signed with `secret`.
    pub fn headers(&self, secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_ID_HEADER, HeaderValue::from_str(&self.client_id).unwrap());
        headers.insert(
            TIMESTAMP_HEADER,
            HeaderValue::from_str(&self.timestamp_ms.to_string()).unwrap(),
        );
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&self.signature(secret)).unwrap(),
        );
        if let Some(nonce) = &self.nonce {
            headers.insert(NONCE_HEADER, HeaderValue::from_str(nonce).unwrap());
        }
        headers
    }
}

pub fn credentials() -> Arc<StaticCredentialStore> {
    Arc::new(StaticCredentialStore::new().with_client(CLIENT, SECRET))
}

pub fn metrics() -> AuthMetrics {
    MetricsRegistry::new().unwrap().auth_metrics().clone()
}

/// Pipeline over `acme`/`s` with the given replay guard.
pub fn pipeline_with(replay: ReplayGuard, metrics: AuthMetrics) -> AuthPipeline {
    AuthPipeline::new(
        SignatureVerifier::new(credentials()),
        ClockSkewValidator::new(WINDOW),
        replay,
        metrics,
    )
}

/// Pipeline with a local-only replay guard.
pub fn local_pipeline(metrics: AuthMetrics) -> AuthPipeline {
    let replay = ReplayGuard::local_only(ReplayGuardConfig::new(WINDOW), metrics.clone());
    pipeline_with(replay, metrics)
}
