//! Pure entitlement math: countdown, severity tier and the display string.
//!
//! Nothing in this module performs I/O. Callers supply `now` so the same
//! functions drive the live tracker, the admin listing and the tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod state;

pub use state::EntitlementState;

/// Remaining time above which the countdown is shown as healthy (10 minutes).
pub const HEALTHY_THRESHOLD_MS: u64 = 10 * 60 * 1000;
/// Remaining time above which the countdown is shown as a warning (2 minutes).
pub const WARNING_THRESHOLD_MS: u64 = 2 * 60 * 1000;

/// Proof that a user held an active, unexpired subscription at refresh time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub expiry: DateTime<Utc>,
    pub subscription_id: Option<String>,
    pub plan_type: Option<String>,
}

impl Entitlement {
    pub fn new(expiry: DateTime<Utc>) -> Self {
        Self {
            expiry,
            subscription_id: None,
            plan_type: None,
        }
    }

    /// Milliseconds left at `now`, clamped at zero.
    pub fn remaining_ms(&self, now: DateTime<Utc>) -> u64 {
        let remaining = (self.expiry - now).num_milliseconds();
        if remaining > 0 { remaining as u64 } else { 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Healthy,
    Warning,
    Critical,
}

impl Tier {
    pub fn from_remaining_ms(remaining_ms: u64) -> Self {
        if remaining_ms > HEALTHY_THRESHOLD_MS {
            Tier::Healthy
        } else if remaining_ms > WARNING_THRESHOLD_MS {
            Tier::Warning
        } else {
            Tier::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Healthy => "healthy",
            Tier::Warning => "warning",
            Tier::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    /// The entitlement must be discarded and every gate re-locked.
    Expired,
    Active { remaining_ms: u64, tier: Tier },
}

impl TickResult {
    pub fn is_expired(&self) -> bool {
        matches!(self, TickResult::Expired)
    }
}

/// One countdown step.
pub fn tick(entitlement: &Entitlement, now: DateTime<Utc>) -> TickResult {
    let remaining_ms = entitlement.remaining_ms(now);
    if remaining_ms == 0 {
        return TickResult::Expired;
    }
    TickResult::Active {
        remaining_ms,
        tier: Tier::from_remaining_ms(remaining_ms),
    }
}

/// Renders a countdown as `"{minutes}m {seconds}s"`, flooring both parts.
pub fn format_remaining(remaining_ms: u64) -> String {
    let minutes = remaining_ms / 60_000;
    let seconds = (remaining_ms % 60_000) / 1000;
    format!("{minutes}m {seconds}s")
}
