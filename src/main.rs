// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::{net::SocketAddr, sync::Arc};

use relational_request_auth::{
    api::router,
    auth::{credentials::StaticCredentialStore, replay::LocalReplaySweeper},
    config::{LogFormat, Settings, DEFAULT_LOG_FILTER},
    metrics::MetricsRegistry,
    state::AppState,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(settings.server.log_format);

    info!(
        replay_store = ?settings.auth.redacted_store_url(),
        failure_policy = settings.auth.failure_policy.as_str(),
        max_clock_skew_ms = settings.auth.max_clock_skew.as_millis() as u64,
        replay_ttl_ms = settings.auth.replay_ttl.as_millis() as u64,
        store_timeout_ms = settings.auth.store_timeout.as_millis() as u64,
        "Loaded auth configuration"
    );

    let secrets = match &settings.auth.client_secrets_file {
        Some(path) => {
            let store = StaticCredentialStore::from_json_file(path)
                .expect("Failed to load client secrets file");
            info!(clients = store.len(), path = %path.display(), "Loaded client secrets");
            store
        }
        None => {
            warn!("AUTH_CLIENT_SECRETS_FILE not set; every signed request will be rejected");
            StaticCredentialStore::new()
        }
    };

    let metrics = MetricsRegistry::global()
        .expect("Failed to register metrics")
        .clone();
    let state = AppState::from_settings(&settings.auth, Arc::new(secrets), metrics)
        .expect("Failed to configure replay store");

    if state.pipeline.bypass_enabled() {
        warn!("AUTH_BYPASS_TOKEN is set; requests carrying it skip verification. Never enable in production.");
    }
    if settings.auth.replay_store_url.is_none() {
        warn!("AUTH_REPLAY_STORE_URL not set; replay protection is local to this process");
    }

    let shutdown = CancellationToken::new();

    tokio::spawn(
        LocalReplaySweeper::new(
            state.pipeline.replay_guard().local_store(),
            settings.auth.sweep_interval,
        )
        .run(shutdown.clone()),
    );

    #[cfg(unix)]
    if let Some(path) = settings.auth.client_secrets_file.clone() {
        tokio::spawn(reload_secrets_on_hangup(state.clone(), path, shutdown.clone()));
    }

    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .expect("Failed to parse bind address");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listener");

    info!(%addr, "Request auth server listening (docs at /docs)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .expect("HTTP server failed");

    info!("Server stopped");
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
    shutdown.cancel();
}

/// Reload client secrets and flush the credential cache on SIGHUP.
#[cfg(unix)]
async fn reload_secrets_on_hangup(
    state: AppState,
    path: std::path::PathBuf,
    shutdown: CancellationToken,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler; secrets reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {},
            _ = shutdown.cancelled() => return,
        }

        match state.reload_secrets(&path) {
            Ok(clients) => info!(clients, "Reloaded client secrets"),
            Err(e) => warn!(error = %e, "Failed to reload client secrets; keeping previous set"),
        }
    }
}
