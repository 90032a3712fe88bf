//! Redis-backed TTL cache.
//!
//! Best-effort by contract: a Redis outage degrades every operation to a
//! miss (callers fall through to the origin) and never surfaces an error.
//! Hits and misses are recorded in the metrics registry.

use crate::metrics::metrics;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "tao_treasury";

#[derive(Clone)]
pub struct Cache {
    conn: Option<ConnectionManager>,
}

impl Cache {
    /// Connect to Redis. A failed connection yields a disabled cache
    /// rather than an error; the service keeps working against the origin.
    pub async fn connect(redis_url: &str) -> Self {
        match redis::Client::open(redis_url) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(conn) => {
                    debug!("cache connected");
                    Self { conn: Some(conn) }
                }
                Err(e) => {
                    warn!(error = %e, "cache unavailable, running without it");
                    Self { conn: None }
                }
            },
            Err(e) => {
                warn!(error = %e, "invalid redis url, running without cache");
                Self { conn: None }
            }
        }
    }

    /// A cache that never hits. Used in tests and when Redis is down.
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    fn full_key(key: &str) -> String {
        format!("{KEY_PREFIX}:{key}")
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut conn = self.conn.clone()?;
        match conn.get::<_, Option<String>>(Self::full_key(key)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    metrics().record_cache_hit(key);
                    Some(value)
                }
                Err(e) => {
                    warn!(key, error = %e, "cache entry failed to decode, dropping");
                    let _ = conn.del::<_, ()>(Self::full_key(key)).await;
                    metrics().record_cache_miss(key);
                    None
                }
            },
            Ok(None) => {
                metrics().record_cache_miss(key);
                None
            }
            Err(e) => {
                debug!(key, error = %e, "cache read failed, treating as miss");
                metrics().record_cache_miss(key);
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "cache value failed to serialize");
                return;
            }
        };
        let result = match ttl {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(Self::full_key(key))
                    .arg(raw)
                    .arg("EX")
                    .arg(ttl.as_secs())
                    .query_async::<_, ()>(&mut conn)
                    .await
            }
            None => conn.set::<_, _, ()>(Self::full_key(key), raw).await,
        };
        if let Err(e) = result {
            debug!(key, error = %e, "cache write failed");
        }
    }

    pub async fn delete(&self, key: &str) {
        let Some(mut conn) = self.conn.clone() else {
            return;
        };
        if let Err(e) = conn.del::<_, ()>(Self::full_key(key)).await {
            debug!(key, error = %e, "cache delete failed");
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        let Some(mut conn) = self.conn.clone() else {
            metrics().record_cache_miss(key);
            return false;
        };
        match conn.exists::<_, bool>(Self::full_key(key)).await {
            Ok(true) => {
                metrics().record_cache_hit(key);
                true
            }
            Ok(false) => {
                metrics().record_cache_miss(key);
                false
            }
            Err(e) => {
                debug!(key, error = %e, "cache exists failed, treating as miss");
                metrics().record_cache_miss(key);
                false
            }
        }
    }

    /// Fetch from cache or compute via `factory` and store the result.
    /// Factory errors pass through untouched; cache failures do not.
    pub async fn get_or_set<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get::<T>(key).await {
            return Ok(cached);
        }
        let value = factory().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_cache_degrades_to_origin() {
        let cache = Cache::disabled();
        assert!(!cache.is_enabled());
        assert_eq!(cache.get::<u64>("k").await, None);
        assert!(!cache.exists("k").await);

        // get_or_set still computes the value.
        let value: Result<u64, std::convert::Infallible> =
            cache.get_or_set("k", None, || async { Ok(42) }).await;
        assert_eq!(value.unwrap(), 42);
    }

    #[tokio::test]
    async fn factory_errors_pass_through() {
        let cache = Cache::disabled();
        let value: Result<u64, &str> = cache
            .get_or_set("k", None, || async { Err("origin down") })
            .await;
        assert_eq!(value.unwrap_err(), "origin down");
    }
}
