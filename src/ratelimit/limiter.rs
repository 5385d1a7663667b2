//! Sliding-window rate limiter with owned background reclamation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::policy::Policy;
use super::reclaimer::Reclaimer;
use super::registry::Registry;
use crate::error::Result;

/// Per-caller sliding-window rate limiter.
///
/// Binds one [`Registry`] to one [`Reclaimer`]: the reclamation task starts
/// when the limiter is built and stops when it is shut down or dropped.
/// Must be constructed inside a Tokio runtime.
///
/// ```no_run
/// use std::time::Duration;
/// use turnstile::ratelimit::SlidingWindowLimiter;
///
/// # async fn demo() -> turnstile::error::Result<()> {
/// let limiter = SlidingWindowLimiter::new(60, Duration::from_secs(60))?;
///
/// let decision = limiter.check("203.0.113.7");
/// if !decision.allowed {
///     println!("retry in {:?}", decision.retry_after());
/// }
///
/// limiter.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SlidingWindowLimiter<C: Clock + 'static = SystemClock> {
    registry: Arc<Registry<C>>,
    reclaimer: Reclaimer,
}

impl SlidingWindowLimiter<SystemClock> {
    /// Create a limiter admitting `limit` requests per `window` per caller.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        Self::with_policy(Policy::new(limit, window)?)
    }

    /// Create a limiter for an already validated policy, reclaiming on the
    /// policy's default tick.
    pub fn with_policy(policy: Policy) -> Result<Self> {
        Self::with_clock(policy, policy.default_cleanup_interval(), SystemClock)
    }
}

impl<C: Clock + 'static> SlidingWindowLimiter<C> {
    /// Create a limiter with an explicit reclamation tick and clock.
    pub fn with_clock(policy: Policy, cleanup_interval: Duration, clock: C) -> Result<Self> {
        let registry = Arc::new(Registry::with_clock(policy, clock));
        let reclaimer = Reclaimer::spawn(&registry, cleanup_interval)?;
        Ok(Self {
            registry,
            reclaimer,
        })
    }

    /// Admit one request from `identity` if its window has room.
    pub fn is_allowed(&self, identity: &str) -> bool {
        self.registry.is_allowed(identity)
    }

    /// Admit one request from `identity` if its window has room, with quota
    /// metadata.
    pub fn check(&self, identity: &str) -> Decision {
        self.registry.check(identity)
    }

    /// Requests `identity` may still make in the current window.
    pub fn remaining_quota(&self, identity: &str) -> u64 {
        self.registry.remaining_quota(identity)
    }

    /// When the oldest counted request of `identity` leaves the window.
    pub fn reset_time(&self, identity: &str) -> Instant {
        self.registry.reset_time(identity)
    }

    /// Quota state of `identity` without admitting a request.
    pub fn quota(&self, identity: &str) -> Decision {
        self.registry.quota(identity)
    }

    /// The admission policy.
    pub fn policy(&self) -> Policy {
        self.registry.policy()
    }

    /// Time between reclamation passes.
    pub fn cleanup_interval(&self) -> Duration {
        self.reclaimer.interval()
    }

    /// Number of identities currently tracked.
    pub fn visitor_count(&self) -> usize {
        self.registry.visitor_count()
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<Registry<C>> {
        &self.registry
    }

    /// Whether background reclamation is still running.
    pub fn is_running(&self) -> bool {
        self.reclaimer.is_running()
    }

    /// Stop background reclamation and wait for it to finish.
    pub async fn shutdown(self) {
        self.reclaimer.shutdown().await;
    }
}

impl<C: Clock + 'static> std::fmt::Debug for SlidingWindowLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("registry", &self.registry)
            .field("reclaimer", &self.reclaimer)
            .finish()
    }
}
