//! Advisory session cache.
//!
//! Records "this user has an active session" under `user:<id>:session` in a
//! key-value store with a TTL. Nothing reads it to make an access decision:
//! when the store is slow or down, operations time out, get logged and the
//! caller carries on.

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::{CacheBackend, CacheConfig},
    error::AuthError,
};

/// Value stored under a session key.
pub const SESSION_MARKER: &str = "1";

/// Glob matching every session marker.
pub const SESSION_KEY_PATTERN: &str = "user:*:session";

const SCAN_BATCH: u64 = 100;

pub fn session_key(user_id: Uuid) -> String {
    format!("user:{user_id}:session")
}

/// Redis-style glob match supporting only `*`.
pub fn key_matches(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// Minimal key-value capability the session cache needs.
#[async_trait]
pub trait SessionCache: Send + Sync {
    fn name(&self) -> &'static str;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// Delete every key matching `pattern`, returning how many went.
    async fn delete_matching(&self, pattern: &str) -> anyhow::Result<u64>;
}

/// Build the backend selected by configuration.
pub fn backend_from_config(cfg: &CacheConfig) -> anyhow::Result<Arc<dyn SessionCache>> {
    let backend: Arc<dyn SessionCache> = match &cfg.backend {
        CacheBackend::Upstash { url, token } => {
            info!("session cache: upstash redis");
            Arc::new(UpstashCache::new(url, token, cfg.timeout())?)
        }
        CacheBackend::Redis { url } => {
            info!("session cache: redis");
            Arc::new(RedisCache::new(url)?)
        }
        CacheBackend::Disabled => {
            info!("no redis configuration found, session cache disabled");
            Arc::new(NoopCache)
        }
    };
    Ok(backend)
}

/// Redis over its native protocol. Connects on first use so an unreachable
/// server never blocks startup.
pub struct RedisCache {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisCache {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("parse REDIS_URL")?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn conn(&self) -> anyhow::Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_connection_manager())
            .await
            .context("connect to redis")?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl SessionCache for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .context("redis SET EX")?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value = conn
            .get::<_, Option<String>>(key)
            .await
            .context("redis GET")?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await.context("redis DEL")?;
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> anyhow::Result<u64> {
        let mut conn = self.conn().await?;
        let mut cursor: u64 = 0;
        let mut removed = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .context("redis SCAN")?;
            if !keys.is_empty() {
                let n: u64 = conn.del(&keys).await.context("redis DEL")?;
                removed += n;
            }
            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }
}

/// Upstash Redis through its REST endpoint.
pub struct UpstashCache {
    http: reqwest::Client,
    url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct UpstashReply {
    #[serde(default)]
    result: Value,
    error: Option<String>,
}

impl UpstashCache {
    pub fn new(url: &str, token: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build upstash http client")?;
        Ok(Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn command(&self, command: Value) -> anyhow::Result<Value> {
        let reply: UpstashReply = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&command)
            .send()
            .await
            .context("upstash request")?
            .json()
            .await
            .context("upstash response")?;
        match reply.error {
            Some(e) => anyhow::bail!("upstash error: {e}"),
            None => Ok(reply.result),
        }
    }
}

fn upstash_set(key: &str, value: &str, ttl: Duration) -> Value {
    json!(["SET", key, value, "EX", ttl.as_secs()])
}

/// `SCAN` replies as `[cursor, [keys...]]`, cursor as a string.
fn parse_scan_reply(result: Value) -> anyhow::Result<(String, Vec<String>)> {
    let Value::Array(mut items) = result else {
        anyhow::bail!("unexpected SCAN reply: {result}");
    };
    if items.len() != 2 {
        anyhow::bail!("unexpected SCAN reply length {}", items.len());
    }
    let keys = serde_json::from_value::<Vec<String>>(items.pop().unwrap_or_default())
        .context("SCAN keys")?;
    let cursor = match items.pop() {
        Some(Value::String(c)) => c,
        Some(Value::Number(n)) => n.to_string(),
        other => anyhow::bail!("unexpected SCAN cursor: {other:?}"),
    };
    Ok((cursor, keys))
}

#[async_trait]
impl SessionCache for UpstashCache {
    fn name(&self) -> &'static str {
        "upstash"
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.command(upstash_set(key, value, ttl)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let result = self.command(json!(["GET", key])).await?;
        Ok(match result {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.command(json!(["DEL", key])).await?;
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> anyhow::Result<u64> {
        let mut cursor = "0".to_string();
        let mut removed = 0;
        loop {
            let reply = self
                .command(json!(["SCAN", cursor, "MATCH", pattern, "COUNT", SCAN_BATCH]))
                .await?;
            let (next, keys) = parse_scan_reply(reply)?;
            if !keys.is_empty() {
                let mut del = vec![Value::from("DEL")];
                del.extend(keys.into_iter().map(Value::from));
                removed += self.command(Value::Array(del)).await?.as_u64().unwrap_or(0);
            }
            if next == "0" {
                return Ok(removed);
            }
            cursor = next;
        }
    }
}

/// Used when no cache is configured.
pub struct NoopCache;

#[async_trait]
impl SessionCache for NoopCache {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn delete(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete_matching(&self, _pattern: &str) -> anyhow::Result<u64> {
        Ok(0)
    }
}

/// Session-marker operations with a hard timeout. Failures are logged and
/// reported as `AuthError::CacheUnavailable`; the plain `mark_active` and
/// `clear` helpers swallow them.
#[derive(Clone)]
pub struct AdvisoryCache {
    backend: Arc<dyn SessionCache>,
    timeout: Duration,
}

impl AdvisoryCache {
    pub fn new(backend: Arc<dyn SessionCache>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    async fn run<T, F>(&self, op: &'static str, key: &str, fut: F) -> Result<T, AuthError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let backend = self.backend.name();
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => {
                debug!(backend, op, key, "session cache ok");
                Ok(value)
            }
            Ok(Err(e)) => {
                warn!(backend, op, key, error = %e, "session cache error");
                Err(AuthError::CacheUnavailable(e.to_string()))
            }
            Err(_) => {
                warn!(backend, op, key, timeout_ms = self.timeout.as_millis() as u64, "session cache timed out");
                Err(AuthError::CacheUnavailable(format!(
                    "{op} timed out after {:?}",
                    self.timeout
                )))
            }
        }
    }

    pub async fn try_mark_active(&self, user_id: Uuid, ttl: Duration) -> Result<(), AuthError> {
        let key = session_key(user_id);
        self.run("set", &key, self.backend.set(&key, SESSION_MARKER, ttl))
            .await
    }

    pub async fn try_clear(&self, user_id: Uuid) -> Result<(), AuthError> {
        let key = session_key(user_id);
        self.run("delete", &key, self.backend.delete(&key)).await
    }

    /// `None` when the cache could not answer.
    pub async fn is_active(&self, user_id: Uuid) -> Option<bool> {
        let key = session_key(user_id);
        self.run("get", &key, self.backend.get(&key))
            .await
            .ok()
            .map(|v| v.is_some())
    }

    pub async fn mark_active(&self, user_id: Uuid, ttl: Duration) {
        let _ = self.try_mark_active(user_id, ttl).await;
    }

    pub async fn clear(&self, user_id: Uuid) {
        let _ = self.try_clear(user_id).await;
    }

    /// Drop every session marker. Operator path, so no timeout and errors
    /// are returned rather than swallowed.
    pub async fn purge_sessions(&self) -> anyhow::Result<u64> {
        let backend = self.backend.name();
        let removed = self.backend.delete_matching(SESSION_KEY_PATTERN).await?;
        info!(backend, removed, "session markers purged");
        Ok(removed)
    }
}
