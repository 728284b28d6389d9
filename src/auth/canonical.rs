// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Canonical request encoding.
//!
//! The canonical string is the exact byte sequence a caller signs. Fields
//! are joined with a single `\n`:
//!
//! ```text
//! METHOD
//! PATH[?QUERY]
//! TIMESTAMP_MS
//! hex(sha256(body))
//! CLIENT_ID
//! NONCE            (only when the caller sent `x-nonce`)
//! ```
//!
//! No field may contain the delimiter, so two different requests can never
//! produce the same canonical bytes.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Field delimiter inside the canonical string.
pub const DELIMITER: u8 = b'\n';

/// Maximum accepted client identifier length in bytes.
pub const MAX_CLIENT_ID_LEN: usize = 128;

/// Maximum accepted nonce length in bytes.
pub const MAX_NONCE_LEN: usize = 128;

/// Separator used when building replay keys; forbidden in client ids.
pub const REPLAY_KEY_SEPARATOR: char = ':';

/// SHA-256 digest of a request body.
pub type BodyDigest = [u8; 32];

/// Reasons a request cannot be canonicalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalError {
    #[error("{field} is empty")]
    Empty { field: &'static str },

    #[error("{field} exceeds {max} bytes")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} contains a reserved delimiter")]
    ReservedDelimiter { field: &'static str },

    #[error("{field} contains control or non-printable characters")]
    InvalidCharacter { field: &'static str },
}

/// Hash a request body for inclusion in the canonical string.
pub fn body_digest(body: &[u8]) -> BodyDigest {
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(body));
    digest
}

/// The protected parts of a request, borrowed for encoding.
#[derive(Debug, Clone, Copy)]
pub struct CanonicalRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub timestamp_ms: i64,
    pub body_digest: &'a BodyDigest,
    pub client_id: &'a str,
    pub nonce: Option<&'a str>,
}

impl CanonicalRequest<'_> {
    /// Produce the canonical byte string, rejecting malformed fields.
    pub fn encode(&self) -> Result<Vec<u8>, CanonicalError> {
        validate_method(self.method)?;
        validate_path(self.path)?;
        validate_client_id(self.client_id)?;
        if let Some(nonce) = self.nonce {
            validate_nonce(nonce)?;
        }

        let timestamp = self.timestamp_ms.to_string();
        let digest_hex = hex::encode(self.body_digest);

        let mut fields: Vec<&[u8]> = vec![
            self.method.as_bytes(),
            self.path.as_bytes(),
            timestamp.as_bytes(),
            digest_hex.as_bytes(),
            self.client_id.as_bytes(),
        ];
        if let Some(nonce) = self.nonce {
            fields.push(nonce.as_bytes());
        }

        let capacity = fields.iter().map(|f| f.len() + 1).sum();
        let mut out = Vec::with_capacity(capacity);
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(DELIMITER);
            }
            out.extend_from_slice(field);
        }
        Ok(out)
    }
}

fn validate_method(method: &str) -> Result<(), CanonicalError> {
    const FIELD: &str = "method";
    if method.is_empty() {
        return Err(CanonicalError::Empty { field: FIELD });
    }
    if !method.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(CanonicalError::InvalidCharacter { field: FIELD });
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<(), CanonicalError> {
    const FIELD: &str = "path";
    if path.is_empty() {
        return Err(CanonicalError::Empty { field: FIELD });
    }
    reject_delimiter(FIELD, path)?;
    if path.chars().any(char::is_control) {
        return Err(CanonicalError::InvalidCharacter { field: FIELD });
    }
    Ok(())
}

/// Validate a client identifier as it appears in headers and replay keys.
pub fn validate_client_id(client_id: &str) -> Result<(), CanonicalError> {
    const FIELD: &str = "client id";
    if client_id.is_empty() {
        return Err(CanonicalError::Empty { field: FIELD });
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(CanonicalError::TooLong {
            field: FIELD,
            max: MAX_CLIENT_ID_LEN,
        });
    }
    reject_delimiter(FIELD, client_id)?;
    if client_id.contains(REPLAY_KEY_SEPARATOR) {
        return Err(CanonicalError::ReservedDelimiter { field: FIELD });
    }
    if client_id.chars().any(char::is_control) {
        return Err(CanonicalError::InvalidCharacter { field: FIELD });
    }
    Ok(())
}

/// Validate an explicit request nonce.
pub fn validate_nonce(nonce: &str) -> Result<(), CanonicalError> {
    const FIELD: &str = "nonce";
    if nonce.is_empty() {
        return Err(CanonicalError::Empty { field: FIELD });
    }
    if nonce.len() > MAX_NONCE_LEN {
        return Err(CanonicalError::TooLong {
            field: FIELD,
            max: MAX_NONCE_LEN,
        });
    }
    reject_delimiter(FIELD, nonce)?;
    if !nonce.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(CanonicalError::InvalidCharacter { field: FIELD });
    }
    Ok(())
}

fn reject_delimiter(field: &'static str, value: &str) -> Result<(), CanonicalError> {
    if value.as_bytes().contains(&DELIMITER) {
        return Err(CanonicalError::ReservedDelimiter { field });
    }
    Ok(())
}
