//! Registry mapping caller identities to their ledgers.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::ledger::VisitorLedger;
use super::policy::Policy;

/// Concurrent map from caller identity to [`VisitorLedger`].
///
/// Two levels of locking: the map's shard locks guard membership only
/// (lookup, lazy creation, eviction), and each ledger's own lock guards its
/// timestamps. Unrelated callers therefore never wait on each other's
/// window arithmetic.
///
/// A ledger that a request is still holding is never evicted, so every
/// admission lands on the ledger later requests will see. Once evicted, an
/// identity starts over with full quota.
pub struct Registry<C: Clock = SystemClock> {
    /// Ledgers indexed by caller identity
    visitors: DashMap<String, Arc<VisitorLedger>>,
    /// Immutable admission policy
    policy: Policy,
    /// Time source
    clock: C,
}

impl Registry<SystemClock> {
    /// Create a registry on the system clock.
    pub fn new(policy: Policy) -> Self {
        Self::with_clock(policy, SystemClock)
    }
}

impl<C: Clock> Registry<C> {
    /// Create a registry with an explicit clock.
    pub fn with_clock(policy: Policy, clock: C) -> Self {
        Self {
            visitors: DashMap::new(),
            policy,
            clock,
        }
    }

    /// Admit one request from `identity` if its window has room.
    pub fn is_allowed(&self, identity: &str) -> bool {
        self.check(identity).allowed
    }

    /// Admit one request from `identity` if its window has room, and report
    /// the quota state in the same critical section.
    pub fn check(&self, identity: &str) -> Decision {
        let ledger = self.get_or_create(identity);
        let decision = ledger.admit(self.clock.now());

        trace!(
            identity = %identity,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Checked rate limit"
        );

        if !decision.allowed {
            debug!(
                identity = %identity,
                limit = decision.limit,
                retry_after_ms = decision.reset_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Requests `identity` may still make in the current window.
    ///
    /// An identity that was never seen has the full limit. Does not create
    /// a ledger.
    pub fn remaining_quota(&self, identity: &str) -> u64 {
        match self.lookup(identity) {
            Some(ledger) => ledger.remaining(self.clock.now()),
            None => self.policy.limit(),
        }
    }

    /// When the oldest counted request of `identity` leaves the window, or
    /// now if nothing is counted.
    pub fn reset_time(&self, identity: &str) -> Instant {
        let now = self.clock.now();
        match self.lookup(identity) {
            Some(ledger) => ledger.earliest_reset(now),
            None => now,
        }
    }

    /// Quota state of `identity` without admitting a request.
    pub fn quota(&self, identity: &str) -> Decision {
        let now = self.clock.now();
        match self.lookup(identity) {
            Some(ledger) => ledger.peek(now),
            None => Decision {
                allowed: true,
                limit: self.policy.limit(),
                remaining: self.policy.limit(),
                reset_at: now,
                reset_after: Duration::ZERO,
            },
        }
    }

    /// Drop every ledger that is empty or has been idle past the eviction
    /// horizon, skipping any a request currently holds. Returns the number
    /// of ledgers removed.
    pub fn reclaim_idle(&self) -> usize {
        let now = self.clock.now();
        let horizon = self.policy.eviction_horizon();
        let mut removed = 0;

        self.visitors.retain(|_, ledger| {
            // The shard lock is held, so any other strong reference belongs
            // to a request already in flight.
            let in_use = Arc::strong_count(ledger) > 1;
            let reclaimable = !in_use && ledger.is_reclaimable(now, horizon);
            if reclaimable {
                removed += 1;
            }
            !reclaimable
        });

        debug!(
            removed = removed,
            remaining = self.visitors.len(),
            "Reclaimed idle visitors"
        );

        removed
    }

    /// The admission policy.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// The clock this registry reads.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Number of identities currently tracked.
    pub fn visitor_count(&self) -> usize {
        self.visitors.len()
    }

    /// Whether `identity` currently has a ledger.
    pub fn contains(&self, identity: &str) -> bool {
        self.visitors.contains_key(identity)
    }

    /// Forget every identity.
    pub fn clear(&self) {
        self.visitors.clear();
    }

    fn lookup(&self, identity: &str) -> Option<Arc<VisitorLedger>> {
        self.visitors
            .get(identity)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Look up the ledger, creating it atomically under the shard lock if
    /// this is the first request from `identity`.
    fn get_or_create(&self, identity: &str) -> Arc<VisitorLedger> {
        if let Some(ledger) = self.lookup(identity) {
            return ledger;
        }

        let entry = self
            .visitors
            .entry(identity.to_owned())
            .or_insert_with(|| {
                debug!(
                    identity = %identity,
                    limit = self.policy.limit(),
                    window_ms = self.policy.window().as_millis() as u64,
                    "Tracking new visitor"
                );
                Arc::new(VisitorLedger::new(self.policy))
            });
        Arc::clone(entry.value())
    }
}

impl<C: Clock> std::fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("policy", &self.policy)
            .field("visitors", &self.visitors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;

    fn registry(limit: u64, window: Duration) -> (Registry<ManualClock>, ManualClock) {
        let clock = ManualClock::new();
        let policy = Policy::new(limit, window).unwrap();
        (Registry::with_clock(policy, clock.clone()), clock)
    }

    #[test]
    fn test_registry_creation() {
        let (registry, _) = registry(3, Duration::from_secs(60));
        assert_eq!(registry.visitor_count(), 0);
        assert_eq!(registry.policy().limit(), 3);
    }

    #[test]
    fn test_end_to_end_scenario() {
        let (registry, clock) = registry(3, Duration::from_secs(60));

        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(registry.is_allowed("A"));
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(results, vec![true, true, true]);

        assert!(!registry.is_allowed("A"));
        assert!(registry.is_allowed("B"));
    }

    #[test]
    fn test_identities_are_independent() {
        let (registry, _) = registry(5, Duration::from_secs(60));

        while registry.is_allowed("192.168.1.1") {}
        assert_eq!(registry.remaining_quota("192.168.1.1"), 0);

        assert_eq!(registry.remaining_quota("192.168.1.2"), 5);
        for _ in 0..5 {
            assert!(registry.is_allowed("192.168.1.2"));
        }
        assert!(!registry.is_allowed("192.168.1.2"));
    }

    #[test]
    fn test_window_expiry() {
        let (registry, clock) = registry(2, Duration::from_millis(100));

        assert!(registry.is_allowed("client"));
        assert!(registry.is_allowed("client"));
        assert!(!registry.is_allowed("client"));

        clock.advance(Duration::from_millis(150));
        assert!(registry.is_allowed("client"));
    }

    #[test]
    fn test_window_boundary() {
        let (registry, clock) = registry(1, Duration::from_millis(100));

        assert!(registry.is_allowed("client"));
        clock.advance(Duration::from_millis(100) - Duration::from_nanos(1));
        assert!(!registry.is_allowed("client"));
        clock.advance(Duration::from_nanos(1));
        assert!(registry.is_allowed("client"));
    }

    #[test]
    fn test_remaining_quota_accuracy() {
        let (registry, _) = registry(5, Duration::from_secs(60));

        assert_eq!(registry.remaining_quota("client"), 5);
        for k in 1..=5 {
            assert!(registry.is_allowed("client"));
            assert_eq!(registry.remaining_quota("client"), 5 - k);
        }

        assert!(!registry.is_allowed("client"));
        assert_eq!(registry.remaining_quota("client"), 0);
    }

    #[test]
    fn test_remaining_quota_does_not_create_ledger() {
        let (registry, _) = registry(5, Duration::from_secs(60));
        assert_eq!(registry.remaining_quota("ghost"), 5);
        assert_eq!(registry.reset_time("ghost"), registry.clock().now());
        assert!(registry.quota("ghost").allowed);
        assert!(!registry.contains("ghost"));
    }

    #[test]
    fn test_reset_time_within_window() {
        let window = Duration::from_secs(10);
        let (registry, clock) = registry(100, window);

        for _ in 0..20 {
            registry.is_allowed("client");
            clock.advance(Duration::from_millis(700));

            let now = clock.now();
            let reset = registry.reset_time("client");
            assert!(reset >= now);
            assert!(reset <= now + window);
        }
    }

    #[test]
    fn test_reset_time_tracks_oldest_request() {
        let (registry, clock) = registry(3, Duration::from_secs(60));
        let start = clock.now();

        registry.is_allowed("client");
        clock.advance(Duration::from_secs(10));
        registry.is_allowed("client");

        assert_eq!(registry.reset_time("client"), start + Duration::from_secs(60));

        clock.advance(Duration::from_secs(50));
        assert_eq!(registry.reset_time("client"), start + Duration::from_secs(70));

        clock.advance(Duration::from_secs(100));
        assert_eq!(registry.reset_time("client"), clock.now());
    }

    #[test]
    fn test_check_returns_metadata() {
        let (registry, clock) = registry(2, Duration::from_secs(60));

        let first = registry.check("client");
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert_eq!(first.reset_after, Duration::from_secs(60));

        clock.advance(Duration::from_secs(15));
        registry.check("client");
        let denied = registry.check("client");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after(), Some(Duration::from_secs(45)));
    }

    #[test]
    fn test_reclaim_removes_idle_visitors() {
        let (registry, clock) = registry(5, Duration::from_secs(10));

        registry.is_allowed("old");
        clock.advance(Duration::from_secs(15));
        registry.is_allowed("recent");
        assert_eq!(registry.visitor_count(), 2);

        // "old" is 20s idle: exactly the horizon, still kept
        clock.advance(Duration::from_secs(5));
        assert_eq!(registry.reclaim_idle(), 0);

        clock.advance(Duration::from_millis(1));
        assert_eq!(registry.reclaim_idle(), 1);
        assert!(!registry.contains("old"));
        assert!(registry.contains("recent"));

        clock.advance(Duration::from_secs(30));
        assert_eq!(registry.reclaim_idle(), 1);
        assert_eq!(registry.visitor_count(), 0);
    }

    #[test]
    fn test_reclaim_handles_empty_registry() {
        let (registry, _) = registry(5, Duration::from_secs(10));
        assert_eq!(registry.reclaim_idle(), 0);
        assert_eq!(registry.visitor_count(), 0);
    }

    #[test]
    fn test_reclaim_preserves_active_visitors() {
        let (registry, clock) = registry(100, Duration::from_secs(1));

        for i in 0..10 {
            registry.is_allowed(&format!("client{}", i));
            clock.advance(Duration::from_millis(10));
        }

        assert_eq!(registry.reclaim_idle(), 0);
        assert_eq!(registry.visitor_count(), 10);
    }

    #[test]
    fn test_quota_resets_after_reclamation() {
        let (registry, clock) = registry(2, Duration::from_secs(10));

        assert!(registry.is_allowed("client"));
        assert!(registry.is_allowed("client"));
        assert!(!registry.is_allowed("client"));

        clock.advance(Duration::from_secs(21));
        registry.reclaim_idle();
        assert!(!registry.contains("client"));
        assert_eq!(registry.remaining_quota("client"), 2);
        assert!(registry.is_allowed("client"));
    }

    #[test]
    fn test_held_ledger_is_not_evicted() {
        let (registry, clock) = registry(2, Duration::from_secs(10));

        registry.is_allowed("client");
        let held = registry.lookup("client").unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(registry.reclaim_idle(), 0);
        assert!(registry.contains("client"));

        drop(held);
        assert_eq!(registry.reclaim_idle(), 1);
        assert!(!registry.contains("client"));
    }

    #[test]
    fn test_fresh_ledger_survives_reclaim_before_first_admission() {
        let (registry, clock) = registry(1, Duration::from_secs(10));

        // A request has created the ledger but not yet admitted
        let pending = registry.get_or_create("a");
        assert_eq!(registry.reclaim_idle(), 0);

        assert!(pending.try_admit(clock.now()));
        drop(pending);

        // The admission counted against the ledger the registry still owns
        assert!(!registry.is_allowed("a"));
        assert_eq!(registry.remaining_quota("a"), 0);
    }

    #[test]
    fn test_clear() {
        let (registry, _) = registry(2, Duration::from_secs(10));
        registry.is_allowed("a");
        registry.is_allowed("b");
        assert_eq!(registry.visitor_count(), 2);

        registry.clear();
        assert_eq!(registry.visitor_count(), 0);
    }

    #[test]
    fn test_concurrent_first_requests_share_one_ledger() {
        const LIMIT: u64 = 10;
        const EXTRA: u64 = 22;
        const THREADS: usize = (LIMIT + EXTRA) as usize;

        let registry = Registry::new(Policy::new(LIMIT, Duration::from_secs(60)).unwrap());
        let barrier = Barrier::new(THREADS);
        let admitted = AtomicU64::new(0);
        let denied = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    barrier.wait();
                    if registry.is_allowed("10.0.0.1") {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    } else {
                        denied.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), LIMIT);
        assert_eq!(denied.load(Ordering::SeqCst), EXTRA);
        assert_eq!(registry.visitor_count(), 1);
        assert_eq!(registry.remaining_quota("10.0.0.1"), 0);
    }

    #[test]
    fn test_concurrent_distinct_identities() {
        let registry = Registry::new(Policy::new(3, Duration::from_secs(60)).unwrap());

        std::thread::scope(|scope| {
            for t in 0..8 {
                let registry = &registry;
                scope.spawn(move || {
                    for i in 0..50 {
                        let identity = format!("client-{}-{}", t, i % 10);
                        registry.is_allowed(&identity);
                    }
                });
            }
        });

        assert_eq!(registry.visitor_count(), 80);
        for t in 0..8 {
            for i in 0..10 {
                let identity = format!("client-{}-{}", t, i);
                assert_eq!(registry.remaining_quota(&identity), 0);
            }
        }
    }

    proptest! {
        #[test]
        fn test_admissions_never_exceed_limit_in_any_window(
            limit in 1u64..8,
            window_ms in 5u64..200,
            gaps in prop::collection::vec(0u64..40, 1..300),
        ) {
            let window = Duration::from_millis(window_ms);
            let (registry, clock) = registry(limit, window);

            let mut admitted = Vec::new();
            for gap in gaps {
                clock.advance(Duration::from_millis(gap));
                if registry.is_allowed("client") {
                    admitted.push(clock.now());
                }
            }

            for (i, &start) in admitted.iter().enumerate() {
                let in_window = admitted[i..]
                    .iter()
                    .take_while(|&&t| t < start + window)
                    .count() as u64;
                prop_assert!(in_window <= limit);
            }
        }
    }
}
