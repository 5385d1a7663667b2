//! A set of named limiters, one per configured policy.

use std::collections::HashMap;
use tracing::info;

use super::clock::SystemClock;
use super::decision::Decision;
use super::limiter::SlidingWindowLimiter;
use crate::config::TurnstileConfig;
use crate::error::{Result, TurnstileError};

/// Limiters keyed by policy name (e.g. one per route class).
///
/// Each policy gets its own registry and reclamation task, so the same
/// caller identity is counted independently under each policy.
pub struct PolicySet {
    limiters: HashMap<String, SlidingWindowLimiter<SystemClock>>,
    default_policy: String,
}

impl PolicySet {
    /// Build one limiter for every policy in `config`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        config.validate()?;

        let mut limiters = HashMap::with_capacity(config.policies.len());
        for (name, rule) in &config.policies {
            let policy = rule.policy()?;
            let limiter = SlidingWindowLimiter::with_clock(
                policy,
                rule.cleanup_interval()?,
                SystemClock,
            )?;

            info!(
                policy = %name,
                limit = policy.limit(),
                window_ms = policy.window().as_millis() as u64,
                cleanup_interval_ms = limiter.cleanup_interval().as_millis() as u64,
                "Policy limiter ready"
            );
            limiters.insert(name.clone(), limiter);
        }

        Ok(Self {
            limiters,
            default_policy: config.default_policy.clone(),
        })
    }

    /// Use `name` as the default policy instead of the configured one.
    pub fn with_default_policy(mut self, name: &str) -> Result<Self> {
        if !self.limiters.contains_key(name) {
            return Err(TurnstileError::UnknownPolicy(name.to_string()));
        }
        self.default_policy = name.to_string();
        Ok(self)
    }

    /// Get the limiter for a policy.
    pub fn get(&self, policy: &str) -> Option<&SlidingWindowLimiter<SystemClock>> {
        self.limiters.get(policy)
    }

    /// Admit one request from `identity` under `policy`.
    pub fn check(&self, policy: &str, identity: &str) -> Result<Decision> {
        self.get(policy)
            .map(|limiter| limiter.check(identity))
            .ok_or_else(|| TurnstileError::UnknownPolicy(policy.to_string()))
    }

    /// Admit one request from `identity` under the default policy.
    pub fn check_default(&self, identity: &str) -> Result<Decision> {
        self.check(&self.default_policy, identity)
    }

    /// Name of the default policy.
    pub fn default_policy(&self) -> &str {
        &self.default_policy
    }

    /// Names of all configured policies.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    /// Number of policies.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether no policies are configured.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Stop every reclamation task and wait for them to finish.
    pub async fn shutdown(self) {
        for (name, limiter) in self.limiters {
            limiter.shutdown().await;
            info!(policy = %name, "Policy limiter stopped");
        }
    }
}

impl std::fmt::Debug for PolicySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicySet")
            .field("policies", &self.limiters.keys().collect::<Vec<_>>())
            .field("default_policy", &self.default_policy)
            .finish()
    }
}
