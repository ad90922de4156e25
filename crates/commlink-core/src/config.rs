//! Injected policy values
//!
//! All tunables (retry counts, delays, thresholds, per-item budgets) are
//! plain values passed in at construction. Nothing here reads the
//! environment, so every policy is testable with a zero-delay variant.

use std::time::Duration;

use crate::types::CommPermissions;

/// Retry behavior for the channel create-or-join loop.
///
/// Correctness comes from the idempotent join-or-create protocol, not
/// from these numbers; they only bound how long a losing racer waits for
/// the winner's channel to become visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Rejoin attempts after a creation conflict
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    /// Policy with the given attempts and delay
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Zero-delay policy for tests
    pub const fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_secs(2),
        }
    }
}

/// Fixed trust thresholds gating communication permissions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrustThresholds {
    /// Minimum exclusive level for messaging
    pub message: f64,
    /// Minimum exclusive level for content sync
    pub sync: f64,
}

impl TrustThresholds {
    /// Derive boolean permissions from an evaluated trust level in [0, 1]
    pub fn permissions_for(&self, level: f64) -> CommPermissions {
        CommPermissions {
            can_message: level > self.message,
            can_sync: level > self.sync,
        }
    }
}

impl Default for TrustThresholds {
    fn default() -> Self {
        Self {
            message: 0.3,
            sync: 0.7,
        }
    }
}

/// Baseline channel permissions used when acceptance options leave a
/// field unset.
///
/// Messaging and presence default open (they are the point of accepting
/// a contact); calls and file sharing stay opt-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionDefaults {
    /// Baseline for `can_message`
    pub can_message: bool,
    /// Baseline for `can_call`
    pub can_call: bool,
    /// Baseline for `can_share_files`
    pub can_share_files: bool,
    /// Baseline for `can_see_presence`
    pub can_see_presence: bool,
}

impl Default for PermissionDefaults {
    fn default() -> Self {
        Self {
            can_message: true,
            can_call: false,
            can_share_files: false,
            can_see_presence: true,
        }
    }
}

/// Aggregate policy handed to the engine at construction
#[derive(Debug, Clone, Copy, Default)]
pub struct CorePolicy {
    /// Channel establishment retry behavior
    pub retry: RetryPolicy,
    /// Trust thresholds for the permission gate
    pub thresholds: TrustThresholds,
    /// Baseline permissions for issued credentials
    pub defaults: PermissionDefaults,
    /// Per-item budget for aggregate listings
    pub item_budget: ItemBudget,
}

/// Per-item time budget for aggregate operations.
///
/// A single slow or corrupt item is skipped after this budget; it never
/// aborts the whole listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemBudget(pub Duration);

impl Default for ItemBudget {
    fn default() -> Self {
        Self(Duration::from_secs(3))
    }
}
