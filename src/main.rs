use std::path::PathBuf;

use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::{Decision, PolicySet};

/// Replay caller identities from stdin through sliding-window rate limits.
///
/// Each input line is `<identity>` or `<policy> <identity>`; one JSON
/// decision is written to stdout per line.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version)]
struct Args {
    /// YAML configuration file (TURNSTILE__* environment variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Policy for lines that do not name one
    #[arg(short, long)]
    policy: Option<String>,
}

/// One output line.
#[derive(Debug, Serialize)]
struct DecisionRecord<'a> {
    policy: &'a str,
    identity: &'a str,
    allowed: bool,
    limit: u64,
    remaining: u64,
    reset_after_ms: u64,
    reset_at: String,
}

impl<'a> DecisionRecord<'a> {
    fn new(policy: &'a str, identity: &'a str, decision: &Decision) -> Self {
        Self {
            policy,
            identity,
            allowed: decision.allowed,
            limit: decision.limit,
            remaining: decision.remaining,
            reset_after_ms: decision.reset_after.as_millis() as u64,
            reset_at: decision.reset_at_utc(Utc::now()).to_rfc3339(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = TurnstileConfig::load(args.config.as_deref())?;

    init_tracing(&config.logging);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut policies = PolicySet::from_config(&config)?;
    if let Some(name) = args.policy.as_deref() {
        policies = policies.with_default_policy(name)?;
    }
    info!(
        policies = policies.len(),
        default_policy = %policies.default_policy(),
        "Policies loaded"
    );

    // Stop on EOF or on a shutdown signal, whichever comes first
    let outcome = tokio::select! {
        result = replay(&policies) => result,
        _ = shutdown_signal() => Ok(()),
    };

    policies.shutdown().await;
    info!("Turnstile stopped");
    outcome
}

/// Initialize tracing on stderr, keeping stdout for decisions.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Read identities from stdin and write one decision per line to stdout.
async fn replay(policies: &PolicySet) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let mut fields = line.split_whitespace();
        let (policy, identity) = match (fields.next(), fields.next()) {
            (None, _) => continue,
            (Some(identity), None) => (policies.default_policy(), identity),
            (Some(policy), Some(identity)) => (policy, identity),
        };

        match policies.check(policy, identity) {
            Ok(decision) => {
                let mut out = serde_json::to_vec(&DecisionRecord::new(policy, identity, &decision))?;
                out.push(b'\n');
                stdout.write_all(&out).await?;
            }
            Err(e) => {
                warn!(policy = %policy, identity = %identity, error = %e, "Skipping request");
            }
        }
    }

    stdout.flush().await?;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
