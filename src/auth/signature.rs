// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! HMAC-SHA256 signature verification.
//!
//! The expected digest is `HMAC-SHA256(secret, canonical)`. Comparison with
//! the supplied signature goes through [`subtle::ConstantTimeEq`] so the
//! time taken does not depend on where the first differing byte is.
//!
//! ## Security
//!
//! - The secret, the expected digest and the supplied signature are never
//!   logged or returned in errors.
//! - Unknown clients, lookup failures and mismatches all surface to the
//!   caller as the same `bad_signature` reason.

use std::sync::Arc;

use base64ct::{Base64, Encoding};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::credentials::{CredentialStore, SharedSecret};

type HmacSha256 = Hmac<Sha256>;

/// Length of an HMAC-SHA256 digest in bytes.
pub const SIGNATURE_LEN: usize = 32;

/// Hex-encoded signature length.
const HEX_SIGNATURE_LEN: usize = SIGNATURE_LEN * 2;

/// The signature header could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("signature is neither hex nor base64 encoded")]
pub struct SignatureEncodingError;

/// Decode a signature header value.
///
/// Accepts 64 hex characters or standard (padded) base64.
pub fn decode_signature(value: &str) -> Result<Vec<u8>, SignatureEncodingError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SignatureEncodingError);
    }
    if value.len() == HEX_SIGNATURE_LEN && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return hex::decode(value).map_err(|_| SignatureEncodingError);
    }
    Base64::decode_vec(value).map_err(|_| SignatureEncodingError)
}

/// Compute `HMAC-SHA256(secret, canonical)`.
///
/// `None` when the key is rejected by the MAC.
pub fn compute_signature(secret: &SharedSecret, canonical: &[u8]) -> Option<[u8; SIGNATURE_LEN]> {
    let mut mac = HmacSha256::new_from_slice(secret.expose()).ok()?;
    mac.update(canonical);
    let mut digest = [0u8; SIGNATURE_LEN];
    digest.copy_from_slice(&mac.finalize().into_bytes());
    Some(digest)
}

/// Hex signature for a canonical string. Used by callers and tests.
pub fn sign_hex(secret: &SharedSecret, canonical: &[u8]) -> Option<String> {
    compute_signature(secret, canonical).map(hex::encode)
}

/// Base64 signature for a canonical string.
pub fn sign_base64(secret: &SharedSecret, canonical: &[u8]) -> Option<String> {
    compute_signature(secret, canonical).map(|raw| Base64::encode_string(&raw))
}

/// Compare a supplied signature with the expected one. A missing expected
/// signature never validates.
fn check_signature(expected: Option<[u8; SIGNATURE_LEN]>, supplied: &[u8]) -> SignatureCheck {
    match expected {
        Some(expected) if signatures_match(&expected, supplied) => SignatureCheck::Valid,
        Some(_) => SignatureCheck::Mismatch,
        None => SignatureCheck::LookupFailed,
    }
}

/// Constant-time comparison of the expected digest with a supplied one.
pub fn signatures_match(expected: &[u8], supplied: &[u8]) -> bool {
    expected.ct_eq(supplied).into()
}

/// Result of checking one request's signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    UnknownClient,
    LookupFailed,
    Mismatch,
}

impl SignatureCheck {
    pub fn is_valid(self) -> bool {
        matches!(self, SignatureCheck::Valid)
    }

    /// Label for logs. Never includes key material.
    pub fn as_str(self) -> &'static str {
        match self {
            SignatureCheck::Valid => "valid",
            SignatureCheck::UnknownClient => "unknown_client",
            SignatureCheck::LookupFailed => "lookup_failed",
            SignatureCheck::Mismatch => "mismatch",
        }
    }
}

/// Verifies request signatures against secrets from a [`CredentialStore`].
#[derive(Clone)]
pub struct SignatureVerifier {
    credentials: Arc<dyn CredentialStore>,
}

impl SignatureVerifier {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self { credentials }
    }

    /// Check `supplied` against the HMAC of `canonical` under the client's secret.
    pub async fn verify(&self, client_id: &str, canonical: &[u8], supplied: &[u8]) -> SignatureCheck {
        let credential = match self.credentials.lookup(client_id).await {
            Ok(Some(credential)) => credential,
            Ok(None) => return SignatureCheck::UnknownClient,
            Err(e) => {
                tracing::warn!(client_id = %client_id, error = %e, "Credential lookup failed");
                return SignatureCheck::LookupFailed;
            }
        };

        let expected = compute_signature(&credential.secret, canonical);
        if expected.is_none() {
            tracing::warn!(client_id = %client_id, "Stored secret rejected as an HMAC key");
        }
        check_signature(expected, supplied)
    }
}
