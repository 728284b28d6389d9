// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::{AuthMode, SignedClient};

/// The caller as seen after authentication.
#[derive(Debug, Serialize, ToSchema)]
pub struct WhoAmIResponse {
    /// Authenticated client id; absent only for bypass traffic.
    pub client_id: Option<String>,
    pub mode: AuthMode,
    /// Absolute clock skew of the request in milliseconds.
    pub skew_ms: Option<u64>,
}

/// Echo the authenticated caller.
#[utoipa::path(
    get,
    path = "/v1/whoami",
    tag = "Auth",
    params(
        ("x-client-id" = String, Header, description = "Client identifier"),
        ("x-timestamp" = String, Header, description = "Milliseconds since the Unix epoch"),
        ("x-signature" = String, Header, description = "Hex or base64 HMAC-SHA256 of the canonical request"),
        ("x-nonce" = Option<String>, Header, description = "Optional request nonce, covered by the signature")
    ),
    responses(
        (status = 200, description = "Authenticated", body = WhoAmIResponse),
        (status = 401, description = "Missing header, bad signature or clock skew", body = crate::auth::error::AuthRejectionBody),
        (status = 409, description = "Replayed request", body = crate::auth::error::AuthRejectionBody),
        (status = 503, description = "Replay store unavailable (fail-closed)", body = crate::auth::error::AuthRejectionBody)
    )
)]
pub async fn whoami(SignedClient(client): SignedClient) -> Json<WhoAmIResponse> {
    Json(WhoAmIResponse {
        client_id: client.client_id,
        mode: client.mode,
        skew_ms: client.skew_ms,
    })
}

/// Echo the authenticated caller for a signed request with a body.
#[utoipa::path(
    post,
    path = "/v1/whoami",
    tag = "Auth",
    request_body(content = String, description = "Any payload; its SHA-256 is part of the signature"),
    responses(
        (status = 200, description = "Authenticated", body = WhoAmIResponse),
        (status = 401, description = "Missing header, bad signature or clock skew", body = crate::auth::error::AuthRejectionBody),
        (status = 409, description = "Replayed request", body = crate::auth::error::AuthRejectionBody),
        (status = 413, description = "Body too large", body = crate::error::ErrorBody),
        (status = 503, description = "Replay store unavailable (fail-closed)", body = crate::auth::error::AuthRejectionBody)
    )
)]
pub async fn whoami_post(client: SignedClient) -> Json<WhoAmIResponse> {
    whoami(client).await
}
