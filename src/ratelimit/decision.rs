//! Admission decision and the quota metadata that travels with it.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Result of an admission check.
///
/// All fields are computed under the same ledger lock as the admission
/// itself, so `remaining` already accounts for this request when it was
/// admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request was admitted
    pub allowed: bool,
    /// The policy limit
    pub limit: u64,
    /// Requests still admissible in the current window
    pub remaining: u64,
    /// When the oldest counted request leaves the window
    pub reset_at: Instant,
    /// Time from the decision until `reset_at`
    pub reset_after: Duration,
}

impl Decision {
    /// How long a denied caller should wait before trying again.
    pub fn retry_after(&self) -> Option<Duration> {
        if self.allowed {
            None
        } else {
            Some(self.reset_after)
        }
    }

    /// Wall-clock reset time, anchored at `now`.
    pub fn reset_at_utc(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.reset_after)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(now)
    }
}
