//! Rate-limited TaoStats client with retries and pagination.

use super::schemas::*;
use crate::cache::Cache;
use crate::metrics::metrics;
use crate::models::{Config, SlippageAction};
use chrono::Utc;
use rand::Rng;
use reqwest::{header, Client, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Error taxonomy surfaced to callers. Rate limits are distinct so the
/// orchestrator can drive tier-level backoff.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("rate limited by upstream (retry_after={retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream error {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ClientError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ClientError::RateLimited { .. })
    }
}

pub struct TaostatsClient {
    http: Client,
    base_url: String,
    cache: Cache,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    /// Last Retry-After hint in seconds; 0 means none.
    last_retry_after: AtomicU64,
    max_retries: u32,
    retry_base: Duration,
    retry_cap: Duration,
    pub max_pages: u32,
}

impl TaostatsClient {
    pub fn new(config: &Config, cache: Cache) -> anyhow::Result<Arc<Self>> {
        let mut headers = header::HeaderMap::new();
        let mut auth = header::HeaderValue::from_str(&config.taostats_api_key)
            .map_err(|_| anyhow::anyhow!("invalid TAOSTATS_API_KEY"))?;
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);

        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers(headers)
            .build()?;

        let per_minute = config.taostats_rate_limit_per_minute.max(1);
        Ok(Arc::new(Self {
            http,
            base_url: config.taostats_base_url.trim_end_matches('/').to_string(),
            cache,
            min_interval: Duration::from_millis(60_000 / per_minute as u64),
            last_request: Mutex::new(None),
            last_retry_after: AtomicU64::new(0),
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
            retry_cap: Duration::from_secs(config.retry_cap_secs),
            max_pages: config.max_pages,
        }))
    }

    /// The last Retry-After hint received from the upstream, if any.
    pub fn current_retry_after(&self) -> Option<u64> {
        match self.last_retry_after.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(secs),
        }
    }

    /// Cheap upstream liveness probe. Ignores the cache.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/pool/latest", self.base_url);
        match self
            .http
            .get(&url)
            .query(&[("page", "1"), ("limit", "1")])
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Backoff delay for `attempt` (0-based):
    /// `min(cap, base * 2^attempt) * (1 ± jitter)`, jitter in [0, 0.5).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .retry_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.retry_cap);
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        exp.mul_f64(factor).min(self.retry_cap)
    }

    /// Parse a Retry-After header: integer seconds or an HTTP-date.
    fn parse_retry_after(resp: &Response) -> Option<u64> {
        let raw = resp.headers().get(header::RETRY_AFTER)?.to_str().ok()?;
        if let Ok(secs) = raw.trim().parse::<u64>() {
            return Some(secs);
        }
        let at = chrono::DateTime::parse_from_rfc2822(raw.trim()).ok()?;
        let delta = at.with_timezone(&Utc) - Utc::now();
        Some(delta.num_seconds().max(0) as u64)
    }

    /// Issue an idempotent GET with retries, returning the raw JSON body.
    async fn get_json(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<serde_json::Value, ClientError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let mut attempt = 0u32;

        loop {
            self.throttle().await;
            metrics().record_api_request();

            let sent = self.http.get(&url).query(params).send().await;
            match sent {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        self.last_retry_after.store(0, Ordering::Relaxed);
                        return resp
                            .json::<serde_json::Value>()
                            .await
                            .map_err(|e| ClientError::Decode(e.to_string()));
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        metrics().record_api_rate_limited();
                        let retry_after = Self::parse_retry_after(&resp);
                        if let Some(secs) = retry_after {
                            self.last_retry_after.store(secs.max(1), Ordering::Relaxed);
                        }
                        // Short hints are honored inline; anything past the
                        // cap is the orchestrator's problem.
                        if attempt < self.max_retries {
                            let delay = retry_after
                                .map(Duration::from_secs)
                                .unwrap_or_else(|| self.backoff_delay(attempt));
                            if delay <= self.retry_cap {
                                attempt += 1;
                                metrics().record_api_retry();
                                warn!(endpoint, attempt, delay_ms = delay.as_millis() as u64, "rate limited, backing off");
                                sleep(delay).await;
                                continue;
                            }
                        }
                        return Err(ClientError::RateLimited { retry_after });
                    }

                    if status.is_server_error() && attempt < self.max_retries {
                        attempt += 1;
                        metrics().record_api_retry();
                        let delay = self.backoff_delay(attempt - 1);
                        warn!(endpoint, %status, attempt, "server error, retrying");
                        sleep(delay).await;
                        continue;
                    }

                    metrics().record_api_error();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(ClientError::Upstream {
                        status: status.as_u16(),
                        body: body.chars().take(300).collect(),
                    });
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    if attempt < self.max_retries {
                        attempt += 1;
                        metrics().record_api_retry();
                        let delay = self.backoff_delay(attempt - 1);
                        warn!(endpoint, error = %e, attempt, "transport error, retrying");
                        sleep(delay).await;
                        continue;
                    }
                    metrics().record_api_error();
                    return Err(ClientError::Transport(e.to_string()));
                }
                Err(e) => {
                    metrics().record_api_error();
                    return Err(ClientError::Transport(e.to_string()));
                }
            }
        }
    }

    /// Typed GET.
    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<T, ClientError> {
        let body = self.get_json(endpoint, params).await?;
        serde_json::from_value(body).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Typed GET with a cache short-circuit. A fresh cached body within
    /// `ttl` skips the HTTP call entirely.
    async fn get_cached<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        cache_key: &str,
        ttl: Duration,
    ) -> Result<T, ClientError> {
        if let Some(body) = self.cache.get::<serde_json::Value>(cache_key).await {
            return serde_json::from_value(body).map_err(|e| ClientError::Decode(e.to_string()));
        }
        let body = self.get_json(endpoint, params).await?;
        self.cache.set(cache_key, &body, Some(ttl)).await;
        serde_json::from_value(body).map_err(|e| ClientError::Decode(e.to_string()))
    }

    /// Fetch all pages of a paginated endpoint, up to `max_pages`.
    /// Checks cancellation between pages; a decode failure fails the page.
    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        base_params: &[(String, String)],
        max_pages: u32,
        limit: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, ClientError> {
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            let mut params = base_params.to_vec();
            params.push(("page".into(), page.to_string()));
            params.push(("limit".into(), limit.to_string()));

            let body: ApiPage<T> = self.get(endpoint, &params).await?;
            let fetched = body.data.len();
            all.extend(body.data);

            let has_next = body
                .pagination
                .as_ref()
                .map(|p| p.has_next())
                .unwrap_or(fetched >= limit as usize);

            if !has_next || fetched == 0 || page >= max_pages {
                if page >= max_pages && has_next {
                    debug!(endpoint, page, "pagination stopped at max_pages");
                }
                return Ok(all);
            }
            page += 1;
        }
    }

    // ------------------------------------------------------------------
    // Endpoint surface
    // ------------------------------------------------------------------

    /// Current stakes for a coldkey across all subnets. Never cached:
    /// position sync and reconciliation both need the live values.
    pub async fn stake_balance_latest(
        &self,
        coldkey: &str,
    ) -> Result<Vec<StakeBalanceRow>, ClientError> {
        let params = vec![("coldkey".to_string(), coldkey.to_string())];
        let page: ApiPage<StakeBalanceRow> = self.get("/stake_balance/latest", &params).await?;
        Ok(page.data)
    }

    /// Daily stake balance history for one (coldkey, hotkey, netuid).
    pub async fn stake_balance_history(
        &self,
        coldkey: &str,
        hotkey: &str,
        netuid: i64,
        timestamp_start: i64,
        timestamp_end: i64,
        limit: u32,
    ) -> Result<Vec<StakeBalanceHistoryRow>, ClientError> {
        let params = vec![
            ("coldkey".to_string(), coldkey.to_string()),
            ("hotkey".to_string(), hotkey.to_string()),
            ("netuid".to_string(), netuid.to_string()),
            ("timestamp_start".to_string(), timestamp_start.to_string()),
            ("timestamp_end".to_string(), timestamp_end.to_string()),
            ("limit".to_string(), limit.to_string()),
        ];
        let page: ApiPage<StakeBalanceHistoryRow> =
            self.get("/stake_balance/history", &params).await?;
        Ok(page.data)
    }

    /// All delegation events (stake/unstake/reward) for a coldkey.
    pub async fn delegation_events(
        &self,
        coldkey: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<DelegationEventRow>, ClientError> {
        let params = vec![("coldkey".to_string(), coldkey.to_string())];
        self.get_all_pages("/delegation", &params, self.max_pages, 200, cancel)
            .await
    }

    /// Daily accounting rows for one alpha token over a date window.
    /// The upstream enforces a 12-month window; callers chunk.
    pub async fn accounting_tax(
        &self,
        coldkey: &str,
        token: &str,
        date_start: &str,
        date_end: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<AccountingRow>, ClientError> {
        let params = vec![
            ("coldkey".to_string(), coldkey.to_string()),
            ("token".to_string(), token.to_string()),
            ("date_start".to_string(), date_start.to_string()),
            ("date_end".to_string(), date_end.to_string()),
        ];
        self.get_all_pages("/accounting/tax", &params, self.max_pages, 200, cancel)
            .await
    }

    /// Current pool state for all subnets.
    pub async fn pool_latest(&self) -> Result<Vec<PoolRow>, ClientError> {
        let page: ApiPage<PoolRow> = self
            .get_cached(
                "/pool/latest",
                &[],
                "pool:latest",
                Duration::from_secs(120),
            )
            .await?;
        Ok(page.data)
    }

    /// Historical daily pool state for one subnet.
    pub async fn pool_history(
        &self,
        netuid: i64,
        timestamp_start: i64,
        timestamp_end: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<PoolRow>, ClientError> {
        let params = vec![
            ("netuid".to_string(), netuid.to_string()),
            ("timestamp_start".to_string(), timestamp_start.to_string()),
            ("timestamp_end".to_string(), timestamp_end.to_string()),
        ];
        self.get_all_pages("/pool/history", &params, self.max_pages, 200, cancel)
            .await
    }

    /// Subnet metadata for all subnets.
    pub async fn subnet_latest(&self) -> Result<Vec<SubnetRow>, ClientError> {
        let page: ApiPage<SubnetRow> = self
            .get_cached(
                "/subnet/latest",
                &[],
                "subnet:latest",
                Duration::from_secs(300),
            )
            .await?;
        Ok(page.data)
    }

    /// Slippage quote for one (netuid, amount, action).
    pub async fn slippage(
        &self,
        netuid: i64,
        amount_tao: Decimal,
        action: SlippageAction,
    ) -> Result<Option<SlippageQuote>, ClientError> {
        let params = vec![
            ("netuid".to_string(), netuid.to_string()),
            ("amount".to_string(), amount_tao.to_string()),
            ("action".to_string(), action.as_str().to_string()),
        ];
        let page: ApiPage<SlippageQuote> = self.get("/slippage", &params).await?;
        Ok(page.data.into_iter().next())
    }

    /// Validator performance for one subnet.
    pub async fn validator_latest(&self, netuid: i64) -> Result<Vec<ValidatorRow>, ClientError> {
        let params = vec![("netuid".to_string(), netuid.to_string())];
        let page: ApiPage<ValidatorRow> = self
            .get_cached(
                "/validator/latest",
                &params,
                &format!("validator:{netuid}"),
                Duration::from_secs(300),
            )
            .await?;
        Ok(page.data)
    }

    /// All extrinsics for a wallet address.
    pub async fn extrinsics(
        &self,
        address: &str,
        max_pages: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExtrinsicRow>, ClientError> {
        let params = vec![("address".to_string(), address.to_string())];
        self.get_all_pages("/extrinsics", &params, max_pages, 200, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_config() -> Config {
        std::env::set_var("TAOSTATS_API_KEY", "test-key");
        std::env::set_var("WALLET_ADDRESS", "5TestWallet");
        Config::from_env().unwrap()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let client = TaostatsClient::new(&test_config(), Cache::disabled()).unwrap();
        // base 500ms, cap 60s, jitter in [0.5, 1.5)
        let d0 = client.backoff_delay(0);
        assert!(d0 >= Duration::from_millis(250) && d0 < Duration::from_millis(750));

        let d10 = client.backoff_delay(10);
        assert!(d10 <= Duration::from_secs(60));
    }

    #[test]
    fn retry_after_starts_empty() {
        let client = TaostatsClient::new(&test_config(), Cache::disabled()).unwrap();
        assert_eq!(client.current_retry_after(), None);
    }

    #[tokio::test]
    async fn cancelled_pagination_short_circuits() {
        let client = TaostatsClient::new(&test_config(), Cache::disabled()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client.delegation_events("5TestWallet", &cancel).await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
    }

    #[test]
    fn slippage_params_render_decimal_sizes() {
        // Decimal sizes must serialize without float noise.
        assert_eq!(dec!(2).to_string(), "2");
        assert_eq!(dec!(12.5).to_string(), "12.5");
    }
}
