//! KeyDB / Redis implementation of [`CoordinationStore`].
//!
//! Builds a [`fred::clients::Pool`] from [`crate::config::KeyDbConfig`],
//! optionally enabling TLS via `rustls` and reading the auth token from an
//! environment variable.  Conditional writes use `SET ... PX ... NX`; the
//! compare-and-delete and windowed increment run as Lua scripts so the
//! check and the mutation happen in one server-side step.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface, LuaInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, Expiration, SetOptions};
use tracing::{debug, trace};

use super::store::{ttl_millis, CoordinationStore};
use crate::config::KeyDbConfig;
use crate::error::StoreError;

/// Delete KEYS[1] only while it still holds ARGV[1].
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Increment KEYS[1]; (re)arm its expiry to ARGV[1] ms when the counter is
/// new or has somehow lost its TTL.
const INCR_WINDOW_SCRIPT: &str = r#"
    local current = redis.call('INCR', KEYS[1])
    if current == 1 or redis.call('PTTL', KEYS[1]) == -1 then
        redis.call('PEXPIRE', KEYS[1], ARGV[1])
    end
    return current
"#;

/// Create a KeyDB connection pool from the application configuration.
///
/// The pool is initialised (connected + PING verified) before being returned.
/// If `config.tls` is `true`, the connection uses `rustls` via fred's built-in
/// TLS support.  The auth token is read from the environment variable whose
/// name is given in `config.auth_token_env`.
pub async fn create_keydb_pool(config: &KeyDbConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");

    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        ..fred::types::config::Config::default()
    };

    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    if let Some(token) = auth_token {
        fred_config.password = Some(token);
    }

    let mut builder = Builder::from_config(fred_config);

    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(config.pool_size)
        .context("failed to build KeyDB connection pool")?;

    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    tracing::info!(
        host = host,
        port = port,
        tls = config.tls,
        pool_size = config.pool_size,
        "KeyDB pool created and verified"
    );

    Ok(pool)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    // Strip any trailing path segments (e.g. a database index).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

/// [`CoordinationStore`] backed by a KeyDB / Redis connection pool.
#[derive(Clone)]
pub struct KeyDbStore {
    pool: Pool,
    command_timeout: Duration,
}

impl KeyDbStore {
    pub fn new(pool: Pool, command_timeout: Duration) -> Self {
        Self {
            pool,
            command_timeout,
        }
    }

    /// Build the pool described by `config` and wrap it.
    pub async fn connect(config: &KeyDbConfig) -> Result<Self> {
        let pool = create_keydb_pool(config).await?;
        Ok(Self::new(pool, config.command_timeout()))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run one store command under the command timeout.  A reply that never
    /// arrives is reported as [`StoreError::Timeout`], never as success.
    async fn run<T, F>(&self, op: &'static str, command: F) -> Result<T, StoreError>
    where
        F: Future<Output = std::result::Result<T, fred::error::Error>>,
    {
        match tokio::time::timeout(self.command_timeout, command).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(StoreError::communication(op, e)),
            Err(_) => Err(StoreError::Timeout {
                op,
                after: self.command_timeout,
            }),
        }
    }
}

#[async_trait::async_trait]
impl CoordinationStore for KeyDbStore {
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let px = i64::try_from(ttl_millis(ttl)).unwrap_or(i64::MAX);
        // SET … NX returns "OK" when the key was set, nil otherwise.
        let reply: Option<String> = self
            .run(
                "SET",
                self.pool.set(
                    key,
                    value,
                    Some(Expiration::PX(px)),
                    Some(SetOptions::NX),
                    false,
                ),
            )
            .await?;
        let created = reply.is_some();
        trace!(%key, created, ttl_ms = px, "SET NX PX");
        Ok(created)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.run("GET", self.pool.get(key)).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let deleted: i64 = self
            .run(
                "EVAL",
                self.pool.eval(
                    COMPARE_AND_DELETE_SCRIPT,
                    vec![key.to_string()],
                    vec![expected.to_string()],
                ),
            )
            .await?;
        trace!(%key, deleted, "compare-and-delete");
        match deleted {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(StoreError::UnexpectedReply {
                op: "EVAL",
                detail: format!("compare-and-delete returned {other}"),
            }),
        }
    }

    async fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let millis: i64 = self.run("PTTL", self.pool.pttl(key)).await?;
        // -2: no such key, -1: key without expiry.
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64, StoreError> {
        let current: i64 = self
            .run(
                "EVAL",
                self.pool.eval(
                    INCR_WINDOW_SCRIPT,
                    vec![key.to_string()],
                    vec![ttl_millis(window).to_string()],
                ),
            )
            .await?;
        debug!(%key, current, "window counter incremented");
        u64::try_from(current).map_err(|_| StoreError::UnexpectedReply {
            op: "EVAL",
            detail: format!("window counter is negative: {current}"),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = self.run("PING", self.pool.ping(None)).await?;
        Ok(())
    }
}
