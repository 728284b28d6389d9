// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relational Request Auth - Signed API Request Authentication
//!
//! Validates HMAC-signed calls between trusted callers and backend
//! workers, rejecting forged, replayed and clock-skewed requests.
//!
//! ## Modules
//!
//! - `auth` - Canonical encoding, signature verification, skew and replay checks
//! - `metrics` - Prometheus counters and histograms for auth outcomes
//! - `api` - HTTP surface (Axum): protected routes, health, metrics, docs
//! - `config` - Environment-driven settings

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod state;
