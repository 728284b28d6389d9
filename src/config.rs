// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Configuration is loaded from the environment at startup. Every value is
//! validated before the server binds; a bad value is a startup error, never
//! a silent default.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |
//! | `AUTH_REPLAY_STORE_URL` | Distributed replay store (`redis://` / `rediss://`) | unset (local guard only) |
//! | `AUTH_REPLAY_KEY_PREFIX` | Replay key namespace | `auth:replay:` |
//! | `AUTH_MAX_CLOCK_SKEW_MS` | Allowed clock skew `W` | `300000` |
//! | `AUTH_REPLAY_TTL_MS` | Minimum replay record lifetime | `W + 60000` |
//! | `AUTH_REPLAY_STORE_TIMEOUT_MS` | Bound on each replay store call | `250` |
//! | `AUTH_REPLAY_FAILURE_POLICY` | `fail_closed` or `fail_open` | `fail_closed` |
//! | `AUTH_LOCAL_SWEEP_INTERVAL_MS` | Local replay guard sweep period | `30000` |
//! | `AUTH_BYPASS_TOKEN` | Non-production bypass marker | unset (bypass off) |
//! | `AUTH_CLIENT_SECRETS_FILE` | JSON map of `client_id` to secret | unset (no clients) |
//! | `AUTH_CREDENTIAL_CACHE_TTL_MS` | Credential cache TTL | `60000` |
//! | `AUTH_CREDENTIAL_CACHE_CAPACITY` | Credential cache size | `1024` |
//! | `AUTH_MAX_BODY_BYTES` | Largest request body accepted | `1048576` |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::auth::credentials::{DEFAULT_CREDENTIAL_CACHE_CAPACITY, DEFAULT_CREDENTIAL_CACHE_TTL};
use crate::auth::replay::{
    FailurePolicy, ReplayGuardConfig, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT,
    DEFAULT_SWEEP_INTERVAL, REPLAY_TTL_MARGIN,
};
use crate::auth::skew::DEFAULT_MAX_CLOCK_SKEW;

pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Default `RUST_LOG` filter when the variable is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

pub const REPLAY_STORE_URL_ENV: &str = "AUTH_REPLAY_STORE_URL";
pub const REPLAY_KEY_PREFIX_ENV: &str = "AUTH_REPLAY_KEY_PREFIX";
pub const MAX_CLOCK_SKEW_ENV: &str = "AUTH_MAX_CLOCK_SKEW_MS";
pub const REPLAY_TTL_ENV: &str = "AUTH_REPLAY_TTL_MS";
pub const REPLAY_STORE_TIMEOUT_ENV: &str = "AUTH_REPLAY_STORE_TIMEOUT_MS";
pub const REPLAY_FAILURE_POLICY_ENV: &str = "AUTH_REPLAY_FAILURE_POLICY";
pub const LOCAL_SWEEP_INTERVAL_ENV: &str = "AUTH_LOCAL_SWEEP_INTERVAL_MS";
pub const BYPASS_TOKEN_ENV: &str = "AUTH_BYPASS_TOKEN";
pub const CLIENT_SECRETS_FILE_ENV: &str = "AUTH_CLIENT_SECRETS_FILE";
pub const CREDENTIAL_CACHE_TTL_ENV: &str = "AUTH_CREDENTIAL_CACHE_TTL_MS";
pub const CREDENTIAL_CACHE_CAPACITY_ENV: &str = "AUTH_CREDENTIAL_CACHE_CAPACITY";
pub const MAX_BODY_BYTES_ENV: &str = "AUTH_MAX_BODY_BYTES";

/// Default request body limit (1 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Configuration errors. Values of secret variables are never included.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got '{value}'")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("AUTH_REPLAY_TTL_MS ({ttl_ms} ms) must not be shorter than AUTH_MAX_CLOCK_SKEW_MS ({window_ms} ms)")]
    TtlBelowWindow { ttl_ms: u64, window_ms: u64 },

    #[error("AUTH_REPLAY_STORE_URL is not a valid URL: {0}")]
    InvalidStoreUrl(String),

    #[error("AUTH_REPLAY_STORE_URL scheme '{0}' is not supported (expected redis or rediss)")]
    UnsupportedScheme(String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
}

/// Authentication settings.
#[derive(Clone)]
pub struct AuthSettings {
    pub replay_store_url: Option<Url>,
    pub key_prefix: String,
    pub max_clock_skew: Duration,
    pub replay_ttl: Duration,
    pub store_timeout: Duration,
    pub failure_policy: FailurePolicy,
    pub sweep_interval: Duration,
    pub bypass_token: Option<String>,
    pub client_secrets_file: Option<PathBuf>,
    pub credential_cache_ttl: Duration,
    pub credential_cache_capacity: usize,
    pub max_body_bytes: usize,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            replay_store_url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            replay_ttl: DEFAULT_MAX_CLOCK_SKEW + REPLAY_TTL_MARGIN,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            failure_policy: FailurePolicy::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            bypass_token: None,
            client_secrets_file: None,
            credential_cache_ttl: DEFAULT_CREDENTIAL_CACHE_TTL,
            credential_cache_capacity: DEFAULT_CREDENTIAL_CACHE_CAPACITY,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("replay_store_url", &self.redacted_store_url())
            .field("key_prefix", &self.key_prefix)
            .field("max_clock_skew", &self.max_clock_skew)
            .field("replay_ttl", &self.replay_ttl)
            .field("store_timeout", &self.store_timeout)
            .field("failure_policy", &self.failure_policy)
            .field("sweep_interval", &self.sweep_interval)
            .field("bypass_enabled", &self.bypass_token.is_some())
            .field("client_secrets_file", &self.client_secrets_file)
            .field("credential_cache_ttl", &self.credential_cache_ttl)
            .field("credential_cache_capacity", &self.credential_cache_capacity)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

impl AuthSettings {
    /// Store URL with any password removed, for logs.
    pub fn redacted_store_url(&self) -> Option<String> {
        self.replay_store_url.as_ref().map(|url| {
            let mut url = url.clone();
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        })
    }

    pub fn replay_guard_config(&self) -> ReplayGuardConfig {
        ReplayGuardConfig {
            key_prefix: self.key_prefix.clone(),
            max_clock_skew: self.max_clock_skew,
            record_ttl: self.replay_ttl,
            store_timeout: self.store_timeout,
            failure_policy: self.failure_policy,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let server = ServerSettings {
            host: env.or_default(HOST_ENV, "0.0.0.0"),
            port: env.parse(PORT_ENV, "a port number", 8080)?,
            log_format: match env.optional(LOG_FORMAT_ENV) {
                None => LogFormat::default(),
                Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                    name: LOG_FORMAT_ENV,
                    expected: "'json' or 'pretty'",
                    value: raw,
                })?,
            },
        };

        let replay_store_url = env
            .optional(REPLAY_STORE_URL_ENV)
            .map(|raw| parse_store_url(&raw))
            .transpose()?;

        let max_clock_skew = env.millis(MAX_CLOCK_SKEW_ENV, DEFAULT_MAX_CLOCK_SKEW)?;
        let replay_ttl = env.millis(REPLAY_TTL_ENV, max_clock_skew + REPLAY_TTL_MARGIN)?;
        if replay_ttl < max_clock_skew {
            return Err(ConfigError::TtlBelowWindow {
                ttl_ms: replay_ttl.as_millis() as u64,
                window_ms: max_clock_skew.as_millis() as u64,
            });
        }

        let failure_policy = match env.optional(REPLAY_FAILURE_POLICY_ENV) {
            None => FailurePolicy::default(),
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: REPLAY_FAILURE_POLICY_ENV,
                expected: "'fail_closed' or 'fail_open'",
                value: raw,
            })?,
        };

        let credential_cache_capacity = env.parse(
            CREDENTIAL_CACHE_CAPACITY_ENV,
            "a positive integer",
            DEFAULT_CREDENTIAL_CACHE_CAPACITY,
        )?;
        if credential_cache_capacity == 0 {
            return Err(ConfigError::Zero(CREDENTIAL_CACHE_CAPACITY_ENV));
        }

        let max_body_bytes = env.parse(MAX_BODY_BYTES_ENV, "a byte count", DEFAULT_MAX_BODY_BYTES)?;
        if max_body_bytes == 0 {
            return Err(ConfigError::Zero(MAX_BODY_BYTES_ENV));
        }

        let auth = AuthSettings {
            replay_store_url,
            key_prefix: env.or_default(REPLAY_KEY_PREFIX_ENV, DEFAULT_KEY_PREFIX),
            max_clock_skew,
            replay_ttl,
            store_timeout: env.millis(REPLAY_STORE_TIMEOUT_ENV, DEFAULT_STORE_TIMEOUT)?,
            failure_policy,
            sweep_interval: env.millis(LOCAL_SWEEP_INTERVAL_ENV, DEFAULT_SWEEP_INTERVAL)?,
            bypass_token: env.optional(BYPASS_TOKEN_ENV),
            client_secrets_file: env.optional(CLIENT_SECRETS_FILE_ENV).map(PathBuf::from),
            credential_cache_ttl: env.millis(CREDENTIAL_CACHE_TTL_ENV, DEFAULT_CREDENTIAL_CACHE_TTL)?,
            credential_cache_capacity,
            max_body_bytes,
        };

        Ok(Self { server, auth })
    }
}

fn parse_store_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidStoreUrl(e.to_string()))?;
    match url.scheme() {
        "redis" | "rediss" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

/// Trimmed, non-empty variable lookup.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or_default(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(
        &self,
        name: &'static str,
        expected: &'static str,
        default: T,
    ) -> Result<T, ConfigError> {
        match self.optional(name) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name,
                expected,
                value: raw,
            }),
        }
    }

    /// A strictly positive millisecond duration.
    fn millis(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let ms: u64 = self.parse(
            name,
            "a whole number of milliseconds",
            default.as_millis() as u64,
        )?;
        if ms == 0 {
            return Err(ConfigError::Zero(name));
        }
        Ok(Duration::from_millis(ms))
    }
}
