// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Signed-request middleware for Axum.
//!
//! Buffers the body (bounded by `AUTH_MAX_BODY_BYTES`), runs the
//! [`AuthPipeline`](super::pipeline::AuthPipeline) and either short-circuits
//! with an [`AuthRejection`] or forwards the untouched request with an
//! [`AuthenticatedClient`] in its extensions.
//!
//! ```rust,ignore
//! let protected = Router::new()
//!     .route("/whoami", get(whoami))
//!     .route_layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         require_signed_request,
//!     ));
//! ```

use axum::{
    body::{to_bytes, Body},
    extract::{OriginalUri, Request, State},
    http::Uri,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::canonical::body_digest;
use super::extractor::AuthenticatedClient;
use super::pipeline::IncomingRequest;
use super::skew::now_ms;
use super::AuthRejection;
use crate::error::ApiError;
use crate::state::AppState;

/// Path plus query string, as the caller signed it.
fn signed_path(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

/// Authentication middleware function.
pub async fn require_signed_request(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let received_at_ms = now_ms();

    // Nested routers strip their prefix from `uri()`; clients sign the full path.
    let path = match request.extensions().get::<OriginalUri>() {
        Some(OriginalUri(original)) => signed_path(original),
        None => signed_path(request.uri()),
    };

    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => return ApiError::payload_too_large(state.max_body_bytes).into_response(),
    };

    let incoming = IncomingRequest {
        method: parts.method.as_str(),
        path: &path,
        headers: &parts.headers,
        body_digest: body_digest(&bytes),
    };
    let outcome = state.pipeline.authenticate(&incoming, received_at_ms).await;

    if let Some(rejection) = AuthRejection::from_reason(outcome.reason) {
        return rejection.into_response();
    }

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request
        .extensions_mut()
        .insert(AuthenticatedClient::from(outcome));
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_path_keeps_query_string() {
        let uri: Uri = "/v1/whoami?limit=10&cursor=abc".parse().unwrap();
        assert_eq!(signed_path(&uri), "/v1/whoami?limit=10&cursor=abc");

        let uri: Uri = "/v1/whoami".parse().unwrap();
        assert_eq!(signed_path(&uri), "/v1/whoami");
    }

    #[test]
    fn signed_path_ignores_scheme_and_authority() {
        let uri: Uri = "http://api.example.com/v1/whoami?x=1".parse().unwrap();
        assert_eq!(signed_path(&uri), "/v1/whoami?x=1");
    }
}
