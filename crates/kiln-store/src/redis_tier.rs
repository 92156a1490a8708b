//! Durable tier backed by Redis.
//!
//! Session records are stored as JSON under `<prefix>session:<id>` with a
//! 24 h TTL. Connections come from a bounded pool of multiplexed connections
//! with an acquire timeout, an idle timeout, and a PING health check on
//! reuse. Every operation runs under the tier's circuit breaker: connection
//! and timeout errors count toward opening it, anything else does not.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use kiln_admission::{CircuitBreaker, CircuitBreakerConfig};
use kiln_model::Session;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::SessionTier;

/// Configuration for the Redis tier.
#[derive(Debug, Clone)]
pub struct RedisTierConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: String,
    /// Key namespace prefix (default `kiln:`).
    pub key_prefix: String,
    /// Record TTL (default 24 h).
    pub record_ttl: Duration,
    /// Maximum pooled connections.
    pub pool_size: usize,
    /// How long to wait for a pool slot or a fresh connection.
    pub acquire_timeout: Duration,
    /// Idle connections older than this are dropped instead of reused.
    pub idle_timeout: Duration,
}

impl RedisTierConfig {
    /// Config with spec defaults for the given URL.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: "kiln:".into(),
            record_ttl: Duration::from_secs(24 * 3600),
            pool_size: 8,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

struct PooledConn {
    conn: MultiplexedConnection,
    last_used: Instant,
}

/// Redis-backed durable tier with a bounded connection pool and a circuit
/// breaker.
pub struct RedisTier {
    client: redis::Client,
    config: RedisTierConfig,
    idle: Mutex<Vec<PooledConn>>,
    slots: Arc<Semaphore>,
    breaker: CircuitBreaker,
}

/// Whether a Redis error should count toward opening the circuit.
fn expected_redis_error(e: &redis::RedisError) -> bool {
    e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
}

impl RedisTier {
    /// Create the tier. Does not connect; connections are opened lazily.
    pub fn new(config: RedisTierConfig) -> anyhow::Result<Self> {
        let client =
            redis::Client::open(config.url.as_str()).context("invalid redis connection URL")?;
        let slots = Arc::new(Semaphore::new(config.pool_size));
        Ok(Self {
            client,
            config,
            idle: Mutex::new(Vec::new()),
            slots,
            breaker: CircuitBreaker::new("redis", CircuitBreakerConfig::default()),
        })
    }

    /// The tier's circuit breaker, for metrics and health.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn key(&self, id: &str) -> String {
        format!("{}session:{}", self.config.key_prefix, id)
    }

    fn check_breaker(&self) -> anyhow::Result<()> {
        self.breaker
            .check()
            .map_err(|retry_in| anyhow!("redis circuit open, retry in {}s", retry_in.as_secs()))
    }

    /// Check out a connection: bounded by the pool semaphore, reusing a
    /// health-checked idle connection when one is fresh enough.
    async fn checkout(&self) -> anyhow::Result<(OwnedSemaphorePermit, MultiplexedConnection)> {
        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            self.slots.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "redis pool acquire timed out after {}s",
                self.config.acquire_timeout.as_secs()
            )
        })?
        .expect("pool semaphore never closes");

        loop {
            let candidate = {
                let mut idle = self.idle.lock().expect("redis pool lock poisoned");
                idle.pop()
            };
            match candidate {
                Some(pooled) if pooled.last_used.elapsed() < self.config.idle_timeout => {
                    let mut conn = pooled.conn;
                    // Health check before reuse; a dead connection is dropped
                    // and the next candidate tried.
                    let ping: redis::RedisResult<String> =
                        redis::cmd("PING").query_async(&mut conn).await;
                    if ping.is_ok() {
                        return Ok((permit, conn));
                    }
                    tracing::debug!("dropping stale pooled redis connection");
                }
                Some(_) => continue, // idle too long, drop and try the next
                None => break,
            }
        }

        let conn = tokio::time::timeout(
            self.config.acquire_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "redis connect timed out after {}s",
                self.config.acquire_timeout.as_secs()
            )
        })?
        .context("failed to connect to redis")?;
        Ok((permit, conn))
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        let mut idle = self.idle.lock().expect("redis pool lock poisoned");
        if idle.len() < self.config.pool_size {
            idle.push(PooledConn {
                conn,
                last_used: Instant::now(),
            });
        }
    }

    fn record_result<T>(&self, result: redis::RedisResult<T>) -> anyhow::Result<T> {
        match result {
            Ok(v) => {
                self.breaker.on_success();
                Ok(v)
            }
            Err(e) => {
                self.breaker.on_failure(expected_redis_error(&e));
                Err(e).context("redis operation failed")
            }
        }
    }
}

#[async_trait]
impl SessionTier for RedisTier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn put(&self, session: &Session) -> anyhow::Result<()> {
        self.check_breaker()?;
        let json = serde_json::to_string(session).context("session serialization failed")?;
        let (_permit, mut conn) = self.checkout().await.inspect_err(|_| {
            self.breaker.on_failure(true);
        })?;

        let result: redis::RedisResult<()> = conn
            .set_ex(self.key(&session.id), json, self.config.record_ttl.as_secs())
            .await;
        let ok = result.is_ok();
        let out = self.record_result(result);
        if ok {
            self.checkin(conn);
        }
        out
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Session>> {
        self.check_breaker()?;
        let (_permit, mut conn) = self.checkout().await.inspect_err(|_| {
            self.breaker.on_failure(true);
        })?;

        let result: redis::RedisResult<Option<String>> = conn.get(self.key(id)).await;
        let ok = result.is_ok();
        let raw = self.record_result(result)?;
        if ok {
            self.checkin(conn);
        }

        match raw {
            Some(json) => {
                let session: Session =
                    serde_json::from_str(&json).context("stored session record is corrupt")?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        self.check_breaker()?;
        let (_permit, mut conn) = self.checkout().await.inspect_err(|_| {
            self.breaker.on_failure(true);
        })?;

        let result: redis::RedisResult<i64> = conn.del(self.key(id)).await;
        let ok = result.is_ok();
        let removed = self.record_result(result)?;
        if ok {
            self.checkin(conn);
        }
        Ok(removed > 0)
    }

    async fn list(&self, owner: Option<&str>) -> anyhow::Result<Vec<Session>> {
        self.check_breaker()?;
        let (_permit, mut conn) = self.checkout().await.inspect_err(|_| {
            self.breaker.on_failure(true);
        })?;

        let pattern = format!("{}session:*", self.config.key_prefix);
        let keys: Vec<String> = {
            let scan: redis::RedisResult<redis::AsyncIter<'_, String>> =
                conn.scan_match(&pattern).await;
            match scan {
                Ok(mut iter) => {
                    let mut keys = Vec::new();
                    while let Some(key) = iter.next_item().await {
                        keys.push(key);
                    }
                    keys
                }
                Err(e) => {
                    self.breaker.on_failure(expected_redis_error(&e));
                    return Err(e).context("redis scan failed");
                }
            }
        };

        let mut sessions = Vec::new();
        if !keys.is_empty() {
            let result: redis::RedisResult<Vec<Option<String>>> =
                redis::cmd("MGET").arg(&keys).query_async(&mut conn).await;
            let values = self.record_result(result)?;
            for json in values.into_iter().flatten() {
                match serde_json::from_str::<Session>(&json) {
                    Ok(session) => {
                        if owner.is_none_or(|o| session.owner_client_id == o) {
                            sessions.push(session);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping corrupt session record");
                    }
                }
            }
        } else {
            self.breaker.on_success();
        }

        self.checkin(conn);
        Ok(sessions)
    }

    async fn healthy(&self) -> bool {
        if self.breaker.check().is_err() {
            return false;
        }
        match self.checkout().await {
            Ok((_permit, mut conn)) => {
                let ping: redis::RedisResult<String> =
                    redis::cmd("PING").query_async(&mut conn).await;
                let ok = ping.is_ok();
                if ok {
                    self.checkin(conn);
                }
                ok
            }
            Err(_) => false,
        }
    }
}

/// Build a [`RedisTier`] from broker configuration.
pub fn tier_from_config(redis: &kiln_config::RedisConfig) -> anyhow::Result<RedisTier> {
    let mut config = RedisTierConfig::for_url(redis.url());
    config.pool_size = redis.pool_size;
    config.acquire_timeout = Duration::from_secs(redis.acquire_timeout_secs);
    RedisTier::new(config)
}
