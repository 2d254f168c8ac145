use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::coordination::backoff::BackoffPolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub keydb: KeyDbConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default = "bool_true")]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    /// Number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Upper bound (milliseconds) on a single store command.  A command that
    /// does not answer in time is reported as a communication failure.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl KeyDbConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn bool_true() -> bool {
    true
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_command_timeout_ms() -> u64 {
    2_000
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Prepended to every lock key before it reaches the store.
    #[serde(default = "default_lock_prefix")]
    pub key_prefix: String,
    /// TTL (milliseconds) used when the caller does not pass one.  Locks are
    /// never renewed, so this must comfortably exceed the critical section.
    #[serde(default = "default_lock_ttl_ms")]
    pub default_ttl_ms: u64,
    /// How long (milliseconds) a blocking acquire waits before giving up.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Delay schedule between blocking acquire attempts.
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_lock_prefix(),
            default_ttl_ms: default_lock_ttl_ms(),
            max_wait_ms: default_max_wait_ms(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

fn default_lock_prefix() -> String {
    "keylock:lock:".to_string()
}

fn default_lock_ttl_ms() -> u64 {
    3_000
}

fn default_max_wait_ms() -> u64 {
    10_000
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_prefix")]
    pub key_prefix: String,
    /// Requests allowed per window.
    #[serde(default = "default_rate_limit")]
    pub limit: u64,
    /// Window length in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_rate_prefix(),
            limit: default_rate_limit(),
            window_ms: default_window_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

fn default_rate_prefix() -> String {
    "keylock:rate:".to_string()
}

fn default_rate_limit() -> u64 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.keydb.endpoint.trim().is_empty(),
        "keydb.endpoint must not be empty"
    );
    anyhow::ensure!(config.keydb.pool_size > 0, "keydb.pool_size must be > 0");
    anyhow::ensure!(
        config.keydb.command_timeout_ms > 0,
        "keydb.command_timeout_ms must be > 0"
    );
    anyhow::ensure!(config.lock.default_ttl_ms > 0, "lock.default_ttl_ms must be > 0");
    anyhow::ensure!(config.lock.max_wait_ms > 0, "lock.max_wait_ms must be > 0");
    match config.lock.backoff {
        BackoffPolicy::Fixed { delay_ms } => {
            anyhow::ensure!(delay_ms > 0, "lock.backoff.delay_ms must be > 0");
        }
        BackoffPolicy::Exponential {
            initial_ms,
            max_ms,
            multiplier,
            ..
        } => {
            anyhow::ensure!(initial_ms > 0, "lock.backoff.initial_ms must be > 0");
            anyhow::ensure!(
                max_ms >= initial_ms,
                "lock.backoff.max_ms must be >= initial_ms"
            );
            anyhow::ensure!(
                multiplier.is_finite() && multiplier >= 1.0,
                "lock.backoff.multiplier must be >= 1.0"
            );
        }
    }
    anyhow::ensure!(config.rate_limit.limit > 0, "rate_limit.limit must be > 0");
    anyhow::ensure!(
        config.rate_limit.window_ms > 0,
        "rate_limit.window_ms must be > 0"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn parse(yaml: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(yaml)?;
        validate_config(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse("keydb:\n  endpoint: redis://localhost:6379\n").unwrap();
        assert!(config.keydb.tls);
        assert_eq!(config.keydb.auth_token_env, "KEYDB_AUTH_TOKEN");
        assert_eq!(config.keydb.pool_size, 4);
        assert_eq!(config.keydb.command_timeout(), Duration::from_secs(2));
        assert_eq!(config.lock.key_prefix, "keylock:lock:");
        assert_eq!(config.lock.default_ttl(), Duration::from_secs(3));
        assert_eq!(config.lock.max_wait(), Duration::from_secs(10));
        assert_eq!(config.lock.backoff, BackoffPolicy::default());
        assert_eq!(config.rate_limit.limit, 100);
        assert_eq!(config.rate_limit.window(), Duration::from_secs(60));
    }

    #[test]
    fn full_config_overrides() {
        let yaml = r#"
keydb:
  endpoint: keydb.internal:6380
  tls: false
  pool_size: 2
  command_timeout_ms: 250
lock:
  key_prefix: "app:lock:"
  default_ttl_ms: 1500
  max_wait_ms: 400
  backoff:
    kind: fixed
    delay_ms: 20
rate_limit:
  limit: 5
  window_ms: 1000
"#;
        let config = parse(yaml).unwrap();
        assert!(!config.keydb.tls);
        assert_eq!(config.keydb.pool_size, 2);
        assert_eq!(config.lock.key_prefix, "app:lock:");
        assert_eq!(config.lock.default_ttl_ms, 1500);
        assert_eq!(config.lock.backoff, BackoffPolicy::Fixed { delay_ms: 20 });
        assert_eq!(config.rate_limit.limit, 5);
    }

    #[test]
    fn rejects_zero_ttl() {
        let err = parse("keydb:\n  endpoint: localhost\nlock:\n  default_ttl_ms: 0\n").unwrap_err();
        assert!(err.to_string().contains("default_ttl_ms"));
    }

    #[test]
    fn rejects_inverted_backoff() {
        let yaml = "keydb:\n  endpoint: localhost\nlock:\n  backoff:\n    kind: exponential\n    initial_ms: 500\n    max_ms: 100\n";
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("max_ms"));
    }

    #[test]
    fn rejects_shrinking_multiplier() {
        let yaml = "keydb:\n  endpoint: localhost\nlock:\n  backoff:\n    kind: exponential\n    initial_ms: 10\n    max_ms: 100\n    multiplier: 0.5\n";
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "keydb:\n  endpoint: localhost:6379\n  tls: false").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.keydb.endpoint, "localhost:6379");
    }

    #[test]
    fn load_config_missing_file() {
        let err = load_config("/nonexistent/keylock/config.yaml").unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
