//! Per-caller request history.

use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::decision::Decision;
use super::policy::Policy;

/// The sliding-window log for one caller identity.
///
/// Holds the timestamps of admitted requests that may still fall inside the
/// window, oldest first. Every operation prunes expired stamps and evaluates
/// under the ledger's own lock, so concurrent requests from the same caller
/// are serialized while different callers never contend.
pub struct VisitorLedger {
    /// Policy shared with the owning registry
    policy: Policy,
    /// Admitted request timestamps, non-decreasing front to back
    requests: Mutex<VecDeque<Instant>>,
}

impl VisitorLedger {
    /// Create an empty ledger.
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    /// Admit one request at `now` if the window has room.
    ///
    /// A denied request leaves the ledger untouched.
    pub fn try_admit(&self, now: Instant) -> bool {
        self.admit(now).allowed
    }

    /// Admit one request at `now` if the window has room and report the
    /// resulting quota state.
    pub fn admit(&self, now: Instant) -> Decision {
        let mut requests = self.pruned(now);

        let allowed = (requests.len() as u64) < self.policy.limit();
        if allowed {
            // Callers read the clock before taking the lock, so a later
            // caller can arrive with an older reading.
            let stamp = requests.back().map_or(now, |&last| last.max(now));
            requests.push_back(stamp);
        }

        self.decision(&requests, now, allowed)
    }

    /// Requests still admissible at `now`.
    pub fn remaining(&self, now: Instant) -> u64 {
        let requests = self.pruned(now);
        self.policy.limit().saturating_sub(requests.len() as u64)
    }

    /// When the oldest counted request leaves the window, or `now` if none
    /// are counted.
    pub fn earliest_reset(&self, now: Instant) -> Instant {
        let requests = self.pruned(now);
        self.reset_at(&requests, now)
    }

    /// Quota state at `now` without admitting anything.
    pub fn peek(&self, now: Instant) -> Decision {
        let requests = self.pruned(now);
        let allowed = (requests.len() as u64) < self.policy.limit();
        self.decision(&requests, now, allowed)
    }

    /// Timestamp of the most recent admitted request, if any are stored.
    pub fn last_request(&self) -> Option<Instant> {
        self.requests.lock().back().copied()
    }

    /// Number of stored timestamps, including any not yet pruned.
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    /// Whether the ledger holds no timestamps.
    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    /// Whether this ledger can be dropped from its registry: empty, or last
    /// used more than `horizon` before `now`.
    ///
    /// Never blocks. A ledger whose lock is held has a request in flight and
    /// is kept.
    pub(crate) fn is_reclaimable(&self, now: Instant, horizon: Duration) -> bool {
        let Some(requests) = self.requests.try_lock() else {
            return false;
        };
        match requests.back() {
            None => true,
            Some(&last) => now.saturating_duration_since(last) > horizon,
        }
    }

    fn pruned(&self, now: Instant) -> MutexGuard<'_, VecDeque<Instant>> {
        let mut requests = self.requests.lock();
        while let Some(&oldest) = requests.front() {
            if !self.policy.is_expired(oldest, now) {
                break;
            }
            requests.pop_front();
        }
        requests
    }

    fn reset_at(&self, requests: &VecDeque<Instant>, now: Instant) -> Instant {
        requests.front().map_or(now, |&oldest| {
            oldest
                .checked_add(self.policy.window())
                .unwrap_or_else(|| oldest.max(now))
        })
    }

    fn decision(&self, requests: &VecDeque<Instant>, now: Instant, allowed: bool) -> Decision {
        let reset_at = self.reset_at(requests, now);
        Decision {
            allowed,
            limit: self.policy.limit(),
            remaining: self.policy.limit().saturating_sub(requests.len() as u64),
            reset_at,
            reset_after: reset_at.saturating_duration_since(now),
        }
    }
}

impl std::fmt::Debug for VisitorLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisitorLedger")
            .field("policy", &self.policy)
            .field("requests", &self.requests.lock().len())
            .finish()
    }
}
