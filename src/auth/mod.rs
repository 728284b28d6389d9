// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Module
//!
//! HMAC-signed request authentication for service-to-service calls.
//!
//! ## Auth Flow
//!
//! 1. Caller builds the canonical string (see [`canonical`]) and signs it
//!    with its shared secret: `HMAC-SHA256(secret, canonical)`.
//! 2. Caller sends `x-client-id`, `x-timestamp`, `x-signature` and
//!    optionally `x-nonce`.
//! 3. Server:
//!    - Verifies the signature in constant time
//!    - Bounds the timestamp to the clock-skew window
//!    - Claims the replay key atomically in the shared replay store
//!
//! ## Security
//!
//! - Secrets, expected digests and supplied signatures are never logged
//! - Replay records are only written through insert-if-absent and expire by TTL
//! - A replay store outage is never treated as "already seen"
//! - Bypass is off unless `AUTH_BYPASS_TOKEN` is set, and is labelled
//!   `mode="bypass"` in metrics

pub mod canonical;
pub mod credentials;
pub mod error;
pub mod extractor;
pub mod middleware;
pub mod pipeline;
pub mod replay;
pub mod signature;
pub mod skew;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::AuthRejection;
pub use extractor::{AuthenticatedClient, SignedClient};
pub use middleware::require_signed_request;
pub use pipeline::{AuthMode, AuthOutcome, AuthPipeline, AuthReason};
