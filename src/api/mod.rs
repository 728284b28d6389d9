// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{http::HeaderName, middleware, routing::get, Router};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    auth::{error::AuthRejectionBody, require_signed_request, AuthMode, AuthReason},
    auth::replay::ReplayStoreHealth,
    error::ErrorBody,
    state::AppState,
};

pub mod health;
pub mod metrics;
pub mod whoami;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/whoami", get(whoami::whoami).post(whoami::whoami_post))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_signed_request,
        ))
        .with_state(state.clone());

    let ops_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/metrics", get(metrics::metrics))
        .with_state(state);

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .nest("/v1", v1_routes)
        .merge(ops_routes)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        whoami::whoami,
        whoami::whoami_post,
        health::health,
        health::liveness,
        health::readiness,
        metrics::metrics
    ),
    components(
        schemas(
            whoami::WhoAmIResponse,
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse,
            AuthRejectionBody,
            ErrorBody,
            AuthMode,
            AuthReason,
            ReplayStoreHealth
        )
    ),
    tags(
        (name = "Auth", description = "Signed request verification"),
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Metrics", description = "Prometheus exposition")
    )
)]
struct ApiDoc;
