//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Policy, TimeUnit};

/// Prefix for environment overrides, e.g. `TURNSTILE__DEFAULT_POLICY=api`.
const ENV_PREFIX: &str = "TURNSTILE";
/// Name of the policy applied when a request does not name one.
const DEFAULT_POLICY: &str = "default";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Named admission policies, one limiter each
    #[serde(default = "default_policies")]
    pub policies: HashMap<String, PolicyRule>,

    /// Policy used when none is named
    #[serde(default = "default_policy_name")]
    pub default_policy: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            policies: default_policies(),
            default_policy: default_policy_name(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_policies() -> HashMap<String, PolicyRule> {
    HashMap::from([(
        DEFAULT_POLICY.to_string(),
        PolicyRule {
            requests_per_unit: 60,
            unit: TimeUnit::Minute,
            window_ms: None,
            cleanup_interval_ms: None,
        },
    )])
}

fn default_policy_name() -> String {
    DEFAULT_POLICY.to_string()
}

/// A single admission policy as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Number of requests allowed per window
    pub requests_per_unit: u64,

    /// Window length as a named unit
    #[serde(default = "default_unit")]
    pub unit: TimeUnit,

    /// Window length in milliseconds; takes precedence over `unit`
    #[serde(default)]
    pub window_ms: Option<u64>,

    /// Reclamation tick in milliseconds; derived from the window if unset
    #[serde(default)]
    pub cleanup_interval_ms: Option<u64>,
}

fn default_unit() -> TimeUnit {
    TimeUnit::Minute
}

impl PolicyRule {
    /// The configured window length.
    pub fn window(&self) -> Duration {
        match self.window_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.unit.duration(),
        }
    }

    /// Validate this rule into a [`Policy`].
    pub fn policy(&self) -> Result<Policy> {
        Policy::new(self.requests_per_unit, self.window())
    }

    /// The reclamation tick for this rule.
    pub fn cleanup_interval(&self) -> Result<Duration> {
        let policy = self.policy()?;
        match self.cleanup_interval_ms {
            Some(0) => Err(TurnstileError::InvalidCleanupInterval(Duration::ZERO)),
            Some(ms) => Ok(Duration::from_millis(ms)),
            None => Ok(policy.default_cleanup_interval()),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from an optional YAML file, then apply
    /// `TURNSTILE__*` environment overrides.
    ///
    /// Nested keys are separated by `__`:
    /// `TURNSTILE__POLICIES__API__REQUESTS_PER_UNIT=100` sets
    /// `policies.api.requests_per_unit`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check that every policy is usable and the default policy exists.
    pub fn validate(&self) -> Result<()> {
        for (name, rule) in &self.policies {
            rule.cleanup_interval().map_err(|e| {
                TurnstileError::Config(format!("Policy '{}' is invalid: {}", name, e))
            })?;
        }

        if !self.policies.contains_key(&self.default_policy) {
            return Err(TurnstileError::Config(format!(
                "Default policy '{}' is not defined",
                self.default_policy
            )));
        }

        Ok(())
    }
}
