// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Clock-skew validation for request timestamps.

use std::time::Duration;

use chrono::Utc;

/// Default maximum allowed skew (5 minutes).
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Current server time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Parse a millisecond timestamp header.
///
/// Only plain ASCII digits are accepted: no sign, whitespace, decimal point
/// or exponent. Values that overflow `i64` are rejected.
pub fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<i64>().ok()
}

/// Which side of server time a request timestamp falls on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkewDirection {
    Past,
    Future,
}

impl SkewDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SkewDirection::Past => "past",
            SkewDirection::Future => "future",
        }
    }
}

/// Absolute distance between a request timestamp and server time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkewMeasurement {
    pub delta_ms: u64,
    pub direction: SkewDirection,
}

/// Bounds request timestamps to `[now - W, now + W]`.
#[derive(Debug, Clone, Copy)]
pub struct ClockSkewValidator {
    window_ms: u64,
}

impl ClockSkewValidator {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn measure(&self, timestamp_ms: i64, server_now_ms: i64) -> SkewMeasurement {
        let direction = if timestamp_ms > server_now_ms {
            SkewDirection::Future
        } else {
            SkewDirection::Past
        };
        SkewMeasurement {
            delta_ms: server_now_ms.abs_diff(timestamp_ms),
            direction,
        }
    }

    /// Both window edges are inclusive.
    pub fn is_within_window(&self, measurement: &SkewMeasurement) -> bool {
        measurement.delta_ms <= self.window_ms
    }
}

impl Default for ClockSkewValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLOCK_SKEW)
    }
}
