// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication rejections.
//!
//! Response bodies carry only a fixed message and the reason code. They
//! never include signatures, secrets or any other derived material.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use utoipa::ToSchema;

use super::pipeline::AuthReason;

/// A request the auth pipeline refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    /// A required auth header is absent or malformed
    MissingHeader,
    /// Digest mismatch or unknown client
    BadSignature,
    /// Timestamp outside the allowed skew window
    ClockSkew,
    /// Timestamp or nonce already claimed
    Replay,
    /// Replay store unreachable under the fail-closed policy
    CacheUnavailable,
}

/// JSON body of a rejection.
#[derive(Serialize, ToSchema)]
pub struct AuthRejectionBody {
    pub error: String,
    pub error_code: String,
}

impl AuthRejection {
    /// Map a pipeline reason to a rejection. `Ok` is not a rejection.
    pub fn from_reason(reason: AuthReason) -> Option<Self> {
        match reason {
            AuthReason::Ok => None,
            AuthReason::MissingHeader => Some(AuthRejection::MissingHeader),
            AuthReason::BadSignature => Some(AuthRejection::BadSignature),
            AuthReason::ClockSkew => Some(AuthRejection::ClockSkew),
            AuthReason::Replay => Some(AuthRejection::Replay),
            AuthReason::CacheUnavailable => Some(AuthRejection::CacheUnavailable),
        }
    }

    /// Get the error code for this rejection.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthRejection::MissingHeader => AuthReason::MissingHeader.as_str(),
            AuthRejection::BadSignature => AuthReason::BadSignature.as_str(),
            AuthRejection::ClockSkew => AuthReason::ClockSkew.as_str(),
            AuthRejection::Replay => AuthReason::Replay.as_str(),
            AuthRejection::CacheUnavailable => AuthReason::CacheUnavailable.as_str(),
        }
    }

    /// Get the HTTP status code for this rejection.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthRejection::MissingHeader
            | AuthRejection::BadSignature
            | AuthRejection::ClockSkew => StatusCode::UNAUTHORIZED,
            AuthRejection::Replay => StatusCode::CONFLICT,
            AuthRejection::CacheUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl std::fmt::Display for AuthRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthRejection::MissingHeader => {
                write!(f, "Signed request headers are missing or malformed")
            }
            AuthRejection::BadSignature => write!(f, "Request signature is invalid"),
            AuthRejection::ClockSkew => write!(f, "Request timestamp is outside the allowed window"),
            AuthRejection::Replay => write!(f, "Request has already been processed"),
            AuthRejection::CacheUnavailable => {
                write!(f, "Replay protection is temporarily unavailable")
            }
        }
    }
}

impl std::error::Error for AuthRejection {}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(AuthRejectionBody {
            error: self.to_string(),
            error_code: self.error_code().to_string(),
        });
        (status, body).into_response()
    }
}
