//! Process-wide resource context.
//!
//! Owns the singletons (datastore, cache, client, sync service) and the
//! lifecycle: build verifies connectivity, shutdown closes in order.

use crate::cache::Cache;
use crate::client::TaostatsClient;
use crate::db::Datastore;
use crate::metrics::metrics;
use crate::models::{Config, HealthStatus};
use crate::sync::SyncService;
use anyhow::{Context, Result};
use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use tracing::info;

pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Datastore,
    pub cache: Cache,
    pub client: Arc<TaostatsClient>,
    pub sync: Arc<SyncService>,
}

impl AppContext {
    /// Build every shared resource and verify datastore connectivity.
    pub async fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let store = Datastore::open(&config.database_path)
            .with_context(|| format!("open database at {}", config.database_path))?;
        store.ping().await.context("datastore connectivity check")?;

        let cache = Cache::connect(&config.redis_url).await;
        let client = TaostatsClient::new(&config, cache.clone())?;
        let sync = SyncService::new(config.clone(), store.clone(), client.clone());

        info!(
            database = %config.database_path,
            cache_enabled = cache.is_enabled(),
            "runtime context ready"
        );
        Ok(Self {
            config,
            store,
            cache,
            client,
            sync,
        })
    }

    /// Health snapshot across the three backing services.
    pub async fn health(&self) -> HealthStatus {
        let database = match self.store.ping().await {
            Ok(()) => "healthy".to_string(),
            Err(e) => format!("unhealthy: {e}"),
        };
        let cache = if self.cache.is_enabled() {
            "healthy".to_string()
        } else {
            "unavailable".to_string()
        };
        let upstream_api = if self.client.health_check().await {
            "healthy".to_string()
        } else {
            "unhealthy".to_string()
        };

        let last_sync = metrics()
            .last_sync_unix()
            .and_then(|s| Utc.timestamp_opt(s, 0).single());
        let data_stale = match last_sync {
            Some(at) => {
                Utc::now() - at > Duration::minutes(self.config.stale_data_threshold_minutes)
            }
            None => true,
        };

        HealthStatus {
            database,
            cache,
            upstream_api,
            last_sync,
            data_stale,
        }
    }
}
