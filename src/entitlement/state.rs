use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{Entitlement, TickResult, Tier, format_remaining, tick};

/// What every UI surface sees. `NoEntitlement` is both the initial state and the
/// state reached again whenever an active period ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum EntitlementState {
    #[default]
    NoEntitlement,
    #[serde(rename_all = "camelCase")]
    Active {
        entitlement: Entitlement,
        remaining_ms: u64,
        tier: Tier,
    },
}

impl EntitlementState {
    /// Builds the state from a refresh result. An entitlement that is already
    /// past its expiry at `now` resolves to `NoEntitlement`.
    pub fn resolve(entitlement: Option<Entitlement>, now: DateTime<Utc>) -> Self {
        match entitlement {
            Some(entitlement) => match tick(&entitlement, now) {
                TickResult::Expired => EntitlementState::NoEntitlement,
                TickResult::Active { remaining_ms, tier } => EntitlementState::Active {
                    entitlement,
                    remaining_ms,
                    tier,
                },
            },
            None => EntitlementState::NoEntitlement,
        }
    }

    /// Recomputes the countdown. Returns `NoEntitlement` the moment the
    /// remaining time reaches zero.
    pub fn ticked(&self, now: DateTime<Utc>) -> Self {
        match self {
            EntitlementState::NoEntitlement => EntitlementState::NoEntitlement,
            EntitlementState::Active { entitlement, .. } => {
                Self::resolve(Some(entitlement.clone()), now)
            }
        }
    }

    /// Feature gate for VIP-only actions.
    pub fn is_unlocked(&self) -> bool {
        matches!(self, EntitlementState::Active { .. })
    }

    pub fn entitlement(&self) -> Option<&Entitlement> {
        match self {
            EntitlementState::Active { entitlement, .. } => Some(entitlement),
            EntitlementState::NoEntitlement => None,
        }
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.entitlement().map(|e| e.expiry)
    }

    pub fn remaining_ms(&self) -> u64 {
        match self {
            EntitlementState::Active { remaining_ms, .. } => *remaining_ms,
            EntitlementState::NoEntitlement => 0,
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        match self {
            EntitlementState::Active { tier, .. } => Some(*tier),
            EntitlementState::NoEntitlement => None,
        }
    }

    /// Countdown text, or `None` when there is nothing to count down.
    pub fn countdown(&self) -> Option<String> {
        match self {
            EntitlementState::Active { remaining_ms, .. } => Some(format_remaining(*remaining_ms)),
            EntitlementState::NoEntitlement => None,
        }
    }
}
