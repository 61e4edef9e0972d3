//! Per-scope rate limiting.
//!
//! Two scopes share one limiter: the global platform-API budget and a
//! per-(bot, guest) message budget. The in-process backend is a classical
//! token bucket (capacity = rate, linear refill). When redis is enabled
//! the check runs against a 1-second sliding window in a sorted set and
//! transparently falls back to the in-process buckets on any cache error.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use redis::aio::MultiplexedConnection;

use crate::domain::BotId;

const BUCKET_IDLE_TTL: Duration = Duration::from_secs(60);
const BUCKET_SWEEP_THRESHOLD: usize = 1024;

/// Connects to the cache and verifies it answers a PING. Used at startup,
/// where an enabled-but-unreachable cache is fatal.
pub async fn connect_cache(url: &str) -> Result<MultiplexedConnection, redis::RedisError> {
    let client = redis::Client::open(url)?;
    let mut conn = client.get_multiplexed_tokio_connection().await?;
    redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
    Ok(conn)
}

#[derive(Clone, Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
    capacity: f64,
    rate: f64,
}

pub struct RateLimiter {
    api_rate: u32,
    guest_rate: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
    cache: Option<MultiplexedConnection>,
}

impl RateLimiter {
    pub fn new(api_rate: u32, guest_rate: u32, cache: Option<MultiplexedConnection>) -> Self {
        Self {
            api_rate,
            guest_rate,
            buckets: Mutex::new(HashMap::new()),
            cache,
        }
    }

    /// Global platform-API budget gate. Never waits.
    pub async fn allow_telegram_api(&self) -> bool {
        self.allow("rate_limit:telegram_api", self.api_rate).await
    }

    /// Per-(bot, guest) inbound message gate. Never waits.
    pub async fn allow_guest_message(&self, bot_id: BotId, guest_user_id: i64) -> bool {
        let key = format!("rate_limit:guest:{bot_id}:{guest_user_id}");
        self.allow(&key, self.guest_rate).await
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Liveness probe used by the periodic cache monitor.
    pub async fn cache_ping(&self) -> Result<(), redis::RedisError> {
        let Some(conn) = &self.cache else {
            return Ok(());
        };
        let mut conn = conn.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    async fn allow(&self, key: &str, rate: u32) -> bool {
        if let Some(conn) = &self.cache {
            match self.allow_with_redis(conn.clone(), key, rate).await {
                Ok(allowed) => return allowed,
                Err(e) => {
                    tracing::warn!(error = %e, key, "cache rate-limit check failed, falling back to memory");
                }
            }
        }
        self.allow_with_memory(key, rate, Instant::now())
    }

    async fn allow_with_redis(
        &self,
        mut conn: MultiplexedConnection,
        key: &str,
        rate: u32,
    ) -> Result<bool, redis::RedisError> {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64;
        let window_start = now_ns - 1_000_000_000;

        let (count,): (i64,) = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(0)
            .arg(window_start)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ns)
            .arg(now_ns)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(1)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count <= rate as i64)
    }

    fn allow_with_memory(&self, key: &str, rate: u32, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());

        if buckets.len() > BUCKET_SWEEP_THRESHOLD {
            buckets.retain(|_, b| now.duration_since(b.last_update) < BUCKET_IDLE_TTL);
        }

        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: rate as f64,
            last_update: now,
            capacity: rate as f64,
            rate: rate as f64,
        });

        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * bucket.rate).min(bucket.capacity);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return true;
        }

        false
    }
}
