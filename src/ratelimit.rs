use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const MINUTE: Duration = Duration::from_secs(60);
pub const HOUR: Duration = Duration::from_secs(60 * 60);
pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);

pub const BOUNCE_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);
pub const ERROR_COOLDOWN: Duration = Duration::from_secs(15 * 60);

/// Shared atomic counter backend for the rate limiter.
///
/// Counters are best-effort: losing a window causes at worst a temporary
/// over-admit that the next window corrects.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Increment `key`, arming `ttl` on first write. A `None` ttl makes
    /// the counter persistent; only `clear_prefix` removes it. Returns
    /// the new value.
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64>;

    async fn get(&self, key: &str) -> Result<i64>;

    /// Arm a marker key that reads as set until `ttl` lapses.
    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn flag_set(&self, key: &str) -> Result<bool>;

    /// Drop every key starting with `prefix`.
    async fn clear_prefix(&self, prefix: &str) -> Result<()>;
}

pub struct RedisCounterStore {
    redis: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let redis = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { redis })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let mut conn = self.redis.clone();
        let value: i64 = conn.incr(key, 1).await.context("INCR failed")?;
        if value == 1 {
            if let Some(ttl) = ttl {
                conn.expire::<_, ()>(key, ttl.as_secs() as i64)
                    .await
                    .context("EXPIRE failed")?;
            }
        }
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        let mut conn = self.redis.clone();
        let value: Option<i64> = conn.get(key).await.context("GET failed")?;
        Ok(value.unwrap_or(0))
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(key, 1, ttl.as_secs())
            .await
            .context("SETEX failed")?;
        Ok(())
    }

    async fn flag_set(&self, key: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(key).await.context("EXISTS failed")?;
        Ok(exists)
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let keys: Vec<String> = conn
            .keys(format!("{prefix}*"))
            .await
            .context("KEYS failed")?;
        if !keys.is_empty() {
            conn.del::<_, ()>(keys).await.context("DEL failed")?;
        }
        Ok(())
    }
}

/// Process-local counter store for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<String, (i64, Option<Instant>)>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lapsed(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|deadline| deadline <= now)
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64> {
        let mut guard = self.entries.lock().await;
        let now = Instant::now();
        let deadline = ttl.map(|ttl| now + ttl);
        let entry = guard.entry(key.to_string()).or_insert((0, deadline));
        if lapsed(entry.1, now) {
            *entry = (0, deadline);
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        let guard = self.entries.lock().await;
        Ok(guard
            .get(key)
            .filter(|(_, deadline)| !lapsed(*deadline, Instant::now()))
            .map(|(value, _)| *value)
            .unwrap_or(0))
    }

    async fn set_flag(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut guard = self.entries.lock().await;
        guard.insert(key.to_string(), (1, Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn flag_set(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await? > 0)
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<()> {
        let mut guard = self.entries.lock().await;
        guard.retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RateLimits {
    pub per_minute: i64,
    pub per_hour: i64,
    pub per_day: i64,
    pub per_sequence: i64,
    pub per_contact_per_sequence: i64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_minute: 60,
            per_hour: 500,
            per_day: 2000,
            per_sequence: 1000,
            per_contact_per_sequence: 3,
        }
    }
}

#[derive(Debug)]
pub struct RateCheck {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl RateCheck {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Send caps at three scopes: sliding minute/hour/day windows per user,
/// and persistent totals per (user, sequence) and
/// (user, sequence, contact) that only `reset` clears. Bounce and
/// send-error cooldowns sit alongside.
///
/// `check` followed by `increment` is deliberately not linearizable;
/// slight over-admission self-corrects on the next window.
pub struct RateLimiter {
    store: std::sync::Arc<dyn CounterStore>,
    prefix: String,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(
        store: std::sync::Arc<dyn CounterStore>,
        prefix: impl Into<String>,
        limits: RateLimits,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            limits,
        }
    }

    fn user_key(&self, user_id: Uuid, window: &str) -> String {
        format!("{}:rl:user:{}:{}", self.prefix, user_id, window)
    }

    // Sequence and contact totals never expire on their own; a sequence
    // routinely waits days between steps, so a self-resetting window
    // would quietly lift the cap. Only `reset` clears them.
    fn sequence_key(&self, user_id: Uuid, sequence_id: Uuid) -> String {
        format!("{}:rl:seq:{}:{}:total", self.prefix, user_id, sequence_id)
    }

    fn contact_key(&self, user_id: Uuid, sequence_id: Uuid, contact_id: Uuid) -> String {
        format!(
            "{}:rl:contact:{}:{}:{}:total",
            self.prefix, user_id, sequence_id, contact_id
        )
    }

    fn bounce_key(&self, contact_id: Uuid) -> String {
        format!("{}:cooldown:bounce:{}", self.prefix, contact_id)
    }

    fn error_key(&self, user_id: Uuid) -> String {
        format!("{}:cooldown:error:{}", self.prefix, user_id)
    }

    pub async fn check(
        &self,
        user_id: Uuid,
        sequence_id: Option<Uuid>,
        contact_id: Option<Uuid>,
    ) -> Result<RateCheck> {
        if self.store.flag_set(&self.error_key(user_id)).await? {
            return Ok(RateCheck::denied("send-error cooldown active"));
        }

        let per_minute = self.store.get(&self.user_key(user_id, "minute")).await?;
        if per_minute >= self.limits.per_minute {
            return Ok(RateCheck::denied("per-minute cap reached"));
        }
        let per_hour = self.store.get(&self.user_key(user_id, "hour")).await?;
        if per_hour >= self.limits.per_hour {
            return Ok(RateCheck::denied("per-hour cap reached"));
        }
        let per_day = self.store.get(&self.user_key(user_id, "day")).await?;
        if per_day >= self.limits.per_day {
            return Ok(RateCheck::denied("per-day cap reached"));
        }

        if let Some(sequence_id) = sequence_id {
            let sent = self
                .store
                .get(&self.sequence_key(user_id, sequence_id))
                .await?;
            if sent >= self.limits.per_sequence {
                return Ok(RateCheck::denied("per-sequence cap reached"));
            }

            if let Some(contact_id) = contact_id {
                if self.store.flag_set(&self.bounce_key(contact_id)).await? {
                    return Ok(RateCheck::denied("bounce cooldown active"));
                }
                let sent = self
                    .store
                    .get(&self.contact_key(user_id, sequence_id, contact_id))
                    .await?;
                if sent >= self.limits.per_contact_per_sequence {
                    return Ok(RateCheck::denied("per-contact cap reached"));
                }
            }
        }

        Ok(RateCheck::allowed())
    }

    pub async fn increment(
        &self,
        user_id: Uuid,
        sequence_id: Uuid,
        contact_id: Uuid,
    ) -> Result<()> {
        self.store
            .incr(&self.user_key(user_id, "minute"), Some(MINUTE))
            .await?;
        self.store
            .incr(&self.user_key(user_id, "hour"), Some(HOUR))
            .await?;
        self.store
            .incr(&self.user_key(user_id, "day"), Some(DAY))
            .await?;
        self.store
            .incr(&self.sequence_key(user_id, sequence_id), None)
            .await?;
        self.store
            .incr(&self.contact_key(user_id, sequence_id, contact_id), None)
            .await?;
        Ok(())
    }

    pub async fn reset(&self, user_id: Uuid, sequence_id: Uuid) -> Result<()> {
        self.store
            .clear_prefix(&format!("{}:rl:seq:{}:{}", self.prefix, user_id, sequence_id))
            .await?;
        self.store
            .clear_prefix(&format!(
                "{}:rl:contact:{}:{}",
                self.prefix, user_id, sequence_id
            ))
            .await?;
        Ok(())
    }

    pub async fn start_bounce_cooldown(&self, contact_id: Uuid) -> Result<()> {
        self.store
            .set_flag(&self.bounce_key(contact_id), BOUNCE_COOLDOWN)
            .await
    }

    pub async fn start_error_cooldown(&self, user_id: Uuid) -> Result<()> {
        self.store
            .set_flag(&self.error_key(user_id), ERROR_COOLDOWN)
            .await
    }
}
