// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Axum extractor for authenticated clients.
//!
//! Handlers behind [`require_signed_request`](super::middleware::require_signed_request)
//! take the verified caller as an argument:
//!
//! ```rust,ignore
//! async fn my_handler(SignedClient(client): SignedClient) -> impl IntoResponse {
//!     // client.client_id, client.mode
//! }
//! ```

use axum::{extract::FromRequestParts, http::request::Parts};
use serde::Serialize;
use utoipa::ToSchema;

use super::pipeline::{AuthMode, AuthOutcome};
use super::AuthRejection;

/// Verified caller, inserted into request extensions by the middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct AuthenticatedClient {
    /// `None` only for bypass traffic without a client id header.
    pub client_id: Option<String>,
    pub mode: AuthMode,
    /// Absolute clock skew of the request in milliseconds.
    pub skew_ms: Option<u64>,
}

impl From<AuthOutcome> for AuthenticatedClient {
    fn from(outcome: AuthOutcome) -> Self {
        Self {
            client_id: outcome.client_id,
            mode: outcome.mode,
            skew_ms: outcome.skew_ms,
        }
    }
}

/// Extractor for the authenticated client.
///
/// Rejects with `missing_header` if the route is not behind the auth
/// middleware, so a wiring mistake fails closed.
pub struct SignedClient(pub AuthenticatedClient);

impl<S> FromRequestParts<S> for SignedClient
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedClient>()
            .cloned()
            .map(SignedClient)
            .ok_or(AuthRejection::MissingHeader)
    }
}
