use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use keylock::config::{self, Config};
use keylock::coordination::node;
use keylock::{
    BlockingAcquireError, CoordinationStore, KeyDbStore, LockService, LockSettings, LockToken,
    MetricsRegistry, NotAcquired, RateDecision, RateLimiter, ReleaseError,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "keylock", about = "Distributed locks on KeyDB / Redis")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/keylock/config.yaml")]
    config: String,

    /// Print Prometheus metrics to stderr after the command.
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Try once to take a lock; prints the token on success.
    Acquire {
        key: String,
        /// Lock TTL in milliseconds (defaults to `lock.default_ttl_ms`).
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
    /// Release a lock previously taken with `acquire` or `wait`.
    Release { key: String, token: String },
    /// Poll until the lock is taken or the wait budget runs out.
    Wait {
        key: String,
        #[arg(long)]
        ttl_ms: Option<u64>,
        /// Wait budget in milliseconds (defaults to `lock.max_wait_ms`).
        #[arg(long)]
        max_wait_ms: Option<u64>,
    },
    /// Show the current holder token and remaining TTL of a lock.
    Inspect { key: String },
    /// Count one call against a rate-limit key.
    Throttle { key: String },
    /// Check connectivity to the store.
    Check,
}

// Exit codes for expected, non-error outcomes.
const EXIT_CONTENDED: u8 = 2;
const EXIT_NOT_HELD: u8 = 3;
const EXIT_TIMEOUT: u8 = 4;
const EXIT_LIMITED: u8 = 5;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn run_command(
    command: Command,
    config: &Config,
    store: Arc<dyn CoordinationStore>,
    metrics: MetricsRegistry,
) -> Result<ExitCode> {
    let settings = LockSettings::from_config(&config.lock, node::node_id());
    tracing::info!(node_id = %settings.node_id, "node identity established");
    let locks = LockService::new(Arc::clone(&store), settings, metrics.clone());

    match command {
        Command::Acquire { key, ttl_ms } => {
            let ttl = ttl_ms.map_or(config.lock.default_ttl(), Duration::from_millis);
            match locks.acquire(&key, ttl).await {
                Ok(token) => {
                    println!("{token}");
                    Ok(ExitCode::SUCCESS)
                }
                Err(NotAcquired::Contended { .. }) => {
                    eprintln!("lock {key} is held by another owner");
                    Ok(ExitCode::from(EXIT_CONTENDED))
                }
                Err(e) => Err(e).context("acquire failed"),
            }
        }
        Command::Release { key, token } => {
            let token = LockToken::from_string(token);
            match locks.release(&key, &token).await {
                Ok(_) => Ok(ExitCode::SUCCESS),
                Err(ReleaseError::NotHeld { .. }) => {
                    eprintln!("lock {key} is not held by this token");
                    Ok(ExitCode::from(EXIT_NOT_HELD))
                }
                Err(e) => Err(e).context("release outcome unknown"),
            }
        }
        Command::Wait {
            key,
            ttl_ms,
            max_wait_ms,
        } => {
            let ttl = ttl_ms.map_or(config.lock.default_ttl(), Duration::from_millis);
            let max_wait = max_wait_ms.map_or(config.lock.max_wait(), Duration::from_millis);
            match locks
                .try_acquire_blocking(&key, ttl, max_wait, &config.lock.backoff)
                .await
            {
                Ok(token) => {
                    println!("{token}");
                    Ok(ExitCode::SUCCESS)
                }
                Err(BlockingAcquireError::Timeout(timeout)) => {
                    eprintln!("{timeout}");
                    Ok(ExitCode::from(EXIT_TIMEOUT))
                }
                Err(e) => Err(e).context("wait failed"),
            }
        }
        Command::Inspect { key } => {
            let holder = locks.holder(&key).await.context("GET lock holder")?;
            let remaining = locks.remaining_ttl(&key).await.context("PTTL lock")?;
            match holder {
                Some(token) => {
                    let ttl = remaining
                        .map_or_else(|| "-".to_string(), |d| d.as_millis().to_string());
                    println!("{key}\t{token}\t{ttl}");
                }
                None => println!("{key}\t(free)"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Throttle { key } => {
            let limiter = RateLimiter::new(store, &config.rate_limit, metrics);
            match limiter.check(&key).await.context("rate limit check")? {
                RateDecision::Allowed { remaining } => {
                    println!("allowed\t{remaining}");
                    Ok(ExitCode::SUCCESS)
                }
                RateDecision::Limited { retry_after } => {
                    println!("limited\t{}", retry_after.as_millis());
                    Ok(ExitCode::from(EXIT_LIMITED))
                }
            }
        }
        Command::Check => {
            store.ping().await.context("store PING failed")?;
            println!("ok");
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    // stdout carries command output (tokens), so logs go to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    tracing::info!(config_path = %cli.config, "starting keylock");

    // ---- Store client ----
    let store = KeyDbStore::connect(&config.keydb).await?;
    let store: Arc<dyn CoordinationStore> = Arc::new(store);

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    let code = run_command(cli.command, &config, store, metrics.clone()).await?;

    if cli.metrics {
        let text = metrics
            .encode_text()
            .context("failed to encode metrics")?;
        eprint!("{text}");
    }

    Ok(code)
}
