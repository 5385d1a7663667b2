//! Rate limit policy: how many requests, over how long.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::{Result, TurnstileError};

/// Ledgers idle for this many windows are reclaimed.
const EVICTION_WINDOWS: u32 = 2;
/// Reclamation ticks per eviction horizon.
const TICKS_PER_HORIZON: u32 = 5;
/// Floor for the derived reclamation tick.
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(1);

/// Whether `span` can be added to the current instant without overflowing.
pub(crate) fn fits_after_now(span: Duration) -> bool {
    Instant::now().checked_add(span).is_some()
}

/// Named time unit for configuring windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// An immutable admission policy: at most `limit` requests in any `window`.
///
/// Construction is the only place the parameters are validated; a `Policy`
/// value is always usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    limit: u64,
    window: Duration,
}

impl Policy {
    /// Create a policy, rejecting a zero limit, an empty window, or a window
    /// whose eviction horizon cannot be represented as an `Instant`.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(TurnstileError::InvalidLimit);
        }
        if window.is_zero() || !fits_after_now(window.saturating_mul(EVICTION_WINDOWS)) {
            return Err(TurnstileError::InvalidWindow(window));
        }
        Ok(Self { limit, window })
    }

    /// Create a policy of `limit` requests per `unit`.
    pub fn per_unit(limit: u64, unit: TimeUnit) -> Result<Self> {
        Self::new(limit, unit.duration())
    }

    /// Maximum admitted requests per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Length of the sliding window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether a request stamped at `stamp` has left the window at `now`.
    ///
    /// The live interval is `(now - window, now]`: a stamp exactly one
    /// window old is expired.
    pub fn is_expired(&self, stamp: Instant, now: Instant) -> bool {
        now.saturating_duration_since(stamp) >= self.window
    }

    /// How long a ledger may sit idle before it is reclaimed.
    pub fn eviction_horizon(&self) -> Duration {
        self.window.saturating_mul(EVICTION_WINDOWS)
    }

    /// Reclamation tick used when none is configured.
    pub fn default_cleanup_interval(&self) -> Duration {
        (self.eviction_horizon() / TICKS_PER_HORIZON).max(MIN_CLEANUP_INTERVAL)
    }
}
