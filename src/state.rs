// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::path::Path;
use std::sync::Arc;

use crate::auth::credentials::{
    CachedCredentialStore, CredentialError, CredentialStore, StaticCredentialStore,
};
use crate::auth::pipeline::AuthPipeline;
use crate::auth::replay::{FailurePolicy, ReplayGuard, ReplayStoreError};
use crate::auth::signature::SignatureVerifier;
use crate::auth::skew::ClockSkewValidator;
use crate::config::AuthSettings;
use crate::metrics::MetricsRegistry;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: AuthPipeline,
    pub metrics: MetricsRegistry,
    /// Secrets source, reloaded on rotation.
    pub secrets: Arc<StaticCredentialStore>,
    /// Cache in front of `secrets`, flushed on rotation.
    pub credentials: Arc<CachedCredentialStore>,
    pub failure_policy: FailurePolicy,
    pub max_body_bytes: usize,
}

impl AppState {
    /// Wire the auth pipeline from settings.
    ///
    /// Selects the replay backend once: Redis when a store URL is configured,
    /// the local guard otherwise.
    pub fn from_settings(
        settings: &AuthSettings,
        secrets: Arc<StaticCredentialStore>,
        metrics: MetricsRegistry,
    ) -> Result<Self, ReplayStoreError> {
        let source: Arc<dyn CredentialStore> = secrets.clone();
        let credentials = Arc::new(CachedCredentialStore::new(
            source,
            settings.credential_cache_capacity,
            settings.credential_cache_ttl,
        ));

        let auth_metrics = metrics.auth_metrics().clone();
        let replay = ReplayGuard::from_config(
            settings.replay_store_url.as_ref().map(|url| url.as_str()),
            settings.replay_guard_config(),
            auth_metrics.clone(),
        )?;

        let verifier_store: Arc<dyn CredentialStore> = credentials.clone();
        let pipeline = AuthPipeline::new(
            SignatureVerifier::new(verifier_store),
            ClockSkewValidator::new(settings.max_clock_skew),
            replay,
            auth_metrics,
        )
        .with_bypass(settings.bypass_token.as_deref());

        Ok(Self {
            pipeline,
            metrics,
            secrets,
            credentials,
            failure_policy: settings.failure_policy,
            max_body_bytes: settings.max_body_bytes,
        })
    }

    /// Reload the secrets file and flush the credential cache.
    ///
    /// On error the previous secrets stay active and the cache is untouched.
    pub fn reload_secrets(&self, path: impl AsRef<Path>) -> Result<usize, CredentialError> {
        let count = self.secrets.reload_from_file(path)?;
        self.credentials.invalidate_all();
        Ok(count)
    }
}
