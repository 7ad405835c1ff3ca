//! Engine tuning, retry policy, and the backend configuration source
//!
//! The backend serves `GET /api/config` with `{contractAddress, chainId}`.
//! Its answer is observed through three states (loading, ready, error);
//! `ready` without an address is the valid "not yet deployed" state.

use crate::cancel::CancelToken;
use crate::types::Address;
use crate::{Error, Result};
use async_trait::async_trait;
use counter_params::{DEFAULT_BACKEND_URL, DEFAULT_CHAIN_ID};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Environment variable holding a fallback contract address
pub const ENV_CONTRACT_ADDRESS: &str = "COUNTER_CONTRACT_ADDRESS";
/// Environment variable holding a fallback chain id
pub const ENV_CHAIN_ID: &str = "COUNTER_CHAIN_ID";

/// Sync engine configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Cadence of `getCount` polling
    pub poll_interval: Duration,
    /// How far back the activity scan looks, in blocks
    pub activity_lookback_blocks: u64,
    /// Maximum entries in the activity feed
    pub activity_feed_cap: usize,
    /// Upper bound on any single ledger call
    pub call_timeout: Duration,
    /// Cadence of receipt lookups while a write is pending
    pub receipt_poll_interval: Duration,
    /// Cadence of filter polling for HTTP event subscriptions
    pub subscription_poll_interval: Duration,
    /// Events kept by the session logger
    pub log_history_cap: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(3_000),
            activity_lookback_blocks: 1_000,
            activity_feed_cap: 10,
            call_timeout: Duration::from_secs(15),
            receipt_poll_interval: Duration::from_secs(1),
            subscription_poll_interval: Duration::from_secs(1),
            log_history_cap: 500,
        }
    }
}

/// Retry configuration for configuration fetches
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum fetch attempts; `None` keeps retrying until cancelled
    pub max_attempts: Option<u32>,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff to use after `current`
    pub fn next_backoff(&self, current: Duration) -> Duration {
        std::cmp::min(
            Duration::from_millis((current.as_millis() as f64 * self.backoff_multiplier) as u64),
            self.max_backoff,
        )
    }
}

/// Spread a delay by +/-20% so clients restarted together do not retry in lockstep
pub fn jitter_duration(duration: Duration) -> Duration {
    let millis = duration.as_millis() as u64;
    if millis == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    let jittered = (millis as f64 * jitter) as u64;
    Duration::from_millis(jittered.max(1))
}

/// Backend-provided dApp configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Deployed counter contract, `None` when not yet deployed
    pub contract_address: Option<Address>,
    /// Chain the contract lives on
    pub chain_id: u64,
}

impl AppConfig {
    /// Read the fallback configuration from the environment.
    ///
    /// Returns `None` unless a contract address is set; the chain id
    /// defaults to the local node.
    pub fn from_env() -> Result<Option<Self>> {
        let address = match std::env::var(ENV_CONTRACT_ADDRESS) {
            Ok(value) if !value.trim().is_empty() => value.trim().parse::<Address>()?,
            _ => return Ok(None),
        };
        let chain_id = match std::env::var(ENV_CHAIN_ID) {
            Ok(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|e| Error::Decode(format!("{}: {}", ENV_CHAIN_ID, e)))?,
            Err(_) => DEFAULT_CHAIN_ID,
        };
        Ok(Some(Self {
            contract_address: Some(address),
            chain_id,
        }))
    }
}

/// Observable state of the configuration fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ConfigState {
    /// Fetch in progress
    Loading,
    /// Configuration available
    Ready(AppConfig),
    /// Last fetch failed; a retry is scheduled
    Error {
        /// Human-readable failure
        message: String,
    },
}

impl ConfigState {
    /// Configuration if ready
    pub fn ready(&self) -> Option<&AppConfig> {
        match self {
            Self::Ready(config) => Some(config),
            _ => None,
        }
    }

    /// Contract address if ready and deployed
    pub fn contract_address(&self) -> Option<Address> {
        self.ready().and_then(|c| c.contract_address)
    }

    /// Expected chain id if ready
    pub fn chain_id(&self) -> Option<u64> {
        self.ready().map(|c| c.chain_id)
    }
}

/// Where configuration comes from
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch the configuration once
    async fn fetch(&self) -> Result<AppConfig>;
}

/// Fixed configuration
#[derive(Debug, Clone)]
pub struct StaticConfigSource(pub AppConfig);

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn fetch(&self) -> Result<AppConfig> {
        Ok(self.0.clone())
    }
}

/// Backend `/api/config` endpoint
pub struct HttpConfigSource {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
    fallback: Option<AppConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConfig {
    contract_address: Option<String>,
    #[serde(default = "default_chain_id")]
    chain_id: u64,
}

#[derive(Deserialize)]
struct WireError {
    error: String,
}

fn default_chain_id() -> u64 {
    DEFAULT_CHAIN_ID
}

impl HttpConfigSource {
    /// Create a source for the given backend base URL
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            timeout: SyncConfig::default().call_timeout,
            fallback: None,
        }
    }

    /// Use the environment fallback when the backend reports it is not configured
    pub fn with_fallback(mut self, fallback: Option<AppConfig>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Override the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Endpoint URL
    pub fn url(&self) -> String {
        format!("{}/api/config", self.base_url.trim_end_matches('/'))
    }
}

impl Default for HttpConfigSource {
    fn default() -> Self {
        Self::new(DEFAULT_BACKEND_URL)
    }
}

#[async_trait]
impl ConfigSource for HttpConfigSource {
    async fn fetch(&self) -> Result<AppConfig> {
        let url = self.url();
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::ConfigUnavailable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status.is_success() {
            let wire: WireConfig = response
                .json()
                .await
                .map_err(|e| Error::ConfigUnavailable(format!("invalid config body: {}", e)))?;
            let contract_address = match wire.contract_address.as_deref().map(str::trim) {
                None | Some("") => None,
                Some(raw) => Some(raw.parse::<Address>()?),
            };
            return Ok(AppConfig {
                contract_address,
                chain_id: wire.chain_id,
            });
        }

        let message = response
            .json::<WireError>()
            .await
            .map(|e| e.error)
            .unwrap_or_else(|_| format!("HTTP {}", status));

        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            if let Some(fallback) = &self.fallback {
                debug!("Backend not configured ({}), using environment fallback", message);
                return Ok(fallback.clone());
            }
        }
        Err(Error::ConfigUnavailable(message))
    }
}

/// Drives a [`ConfigSource`] until it yields a configuration
pub struct ConfigLoader {
    source: Arc<dyn ConfigSource>,
    retry: RetryConfig,
    state: watch::Sender<ConfigState>,
}

impl ConfigLoader {
    /// Create a loader in the `Loading` state
    pub fn new(source: Arc<dyn ConfigSource>, retry: RetryConfig) -> Self {
        let (state, _) = watch::channel(ConfigState::Loading);
        Self {
            source,
            retry,
            state,
        }
    }

    /// Receiver of state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConfigState> {
        self.state.subscribe()
    }

    /// Current state
    pub fn state(&self) -> ConfigState {
        self.state.borrow().clone()
    }

    /// Fetch until ready, cancelled, or out of attempts.
    ///
    /// Failures publish `Error` and are retried with jittered backoff; the
    /// state does not flip back to `Loading` between attempts. The last
    /// error stays published when attempts run out.
    pub async fn run(&self, cancel: &CancelToken) -> Option<AppConfig> {
        let mut backoff = self.retry.initial_backoff;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match cancel.run_until_cancelled(self.source.fetch()).await? {
                Ok(config) => {
                    info!(
                        event = "config_ready",
                        contract = ?config.contract_address,
                        chain_id = config.chain_id,
                        attempt,
                        "Configuration ready"
                    );
                    self.state.send_replace(ConfigState::Ready(config.clone()));
                    return Some(config);
                }
                Err(e) => {
                    self.state.send_replace(ConfigState::Error {
                        message: e.to_string(),
                    });
                    if self.retry.max_attempts.is_some_and(|max| attempt >= max) {
                        warn!("Configuration fetch failed after {} attempts: {}", attempt, e);
                        return None;
                    }
                    warn!(
                        "Configuration fetch failed (attempt {}), retrying in {:?}: {}",
                        attempt, backoff, e
                    );
                    cancel
                        .run_until_cancelled(tokio::time::sleep(jitter_duration(backoff)))
                        .await?;
                    backoff = self.retry.next_backoff(backoff);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};
    use parking_lot::Mutex;
    use serde_json::json;

    const ADDR: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

    #[test]
    fn test_sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(3_000));
        assert_eq!(config.activity_lookback_blocks, 1_000);
        assert_eq!(config.activity_feed_cap, 10);
        assert_eq!(config.call_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_backoff_capped() {
        let retry = RetryConfig {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(15),
            ..Default::default()
        };
        assert_eq!(
            retry.next_backoff(Duration::from_secs(10)),
            Duration::from_secs(15)
        );
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = jitter_duration(Duration::from_millis(1_000));
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1_200));
        }
        assert_eq!(jitter_duration(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_config_state_serde() {
        let state = ConfigState::Ready(AppConfig {
            contract_address: None,
            chain_id: 31_337,
        });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "ready");
        assert_eq!(json["contractAddress"], serde_json::Value::Null);
        assert_eq!(state.contract_address(), None);
        assert_eq!(state.chain_id(), Some(31_337));
    }

    #[tokio::test]
    async fn test_http_source_ready() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/config");
                then.status(200)
                    .json_body(json!({ "contractAddress": ADDR, "chainId": 84532 }));
            })
            .await;

        let source = HttpConfigSource::new(server.base_url());
        let config = source.fetch().await.unwrap();
        mock.assert_async().await;
        assert_eq!(config.chain_id, 84_532);
        assert_eq!(config.contract_address, Some(ADDR.parse().unwrap()));
    }

    #[tokio::test]
    async fn test_http_source_null_address_is_ready() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/config");
                then.status(200)
                    .json_body(json!({ "contractAddress": null, "chainId": 31337 }));
            })
            .await;

        let config = HttpConfigSource::new(server.base_url())
            .fetch()
            .await
            .unwrap();
        assert_eq!(config.contract_address, None);
    }

    #[tokio::test]
    async fn test_http_source_unconfigured_backend() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/config");
                then.status(503)
                    .json_body(json!({ "error": "CONTRACT_ADDRESS not configured." }));
            })
            .await;

        let err = HttpConfigSource::new(server.base_url())
            .fetch()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigUnavailable(ref m) if m.contains("CONTRACT_ADDRESS")));

        let fallback = AppConfig {
            contract_address: Some(ADDR.parse().unwrap()),
            chain_id: 31_337,
        };
        let config = HttpConfigSource::new(server.base_url())
            .with_fallback(Some(fallback.clone()))
            .fetch()
            .await
            .unwrap();
        assert_eq!(config, fallback);
    }

    struct FlakySource {
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl ConfigSource for FlakySource {
        async fn fetch(&self) -> Result<AppConfig> {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(Error::ConfigUnavailable("backend down".into()));
            }
            Ok(AppConfig {
                contract_address: None,
                chain_id: 31_337,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loader_retries_until_ready() {
        let loader = ConfigLoader::new(
            Arc::new(FlakySource {
                failures_left: Mutex::new(2),
            }),
            RetryConfig::default(),
        );
        let mut rx = loader.subscribe();
        assert_eq!(loader.state(), ConfigState::Loading);

        let cancel = CancelToken::new();
        let config = loader.run(&cancel).await.unwrap();
        assert_eq!(config.chain_id, 31_337);
        assert!(rx.has_changed().unwrap());
        assert!(matches!(*rx.borrow_and_update(), ConfigState::Ready(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loader_reports_error_and_stops_on_cancel() {
        let loader = Arc::new(ConfigLoader::new(
            Arc::new(FlakySource {
                failures_left: Mutex::new(u32::MAX),
            }),
            RetryConfig::default(),
        ));
        let cancel = CancelToken::new();
        let handle = {
            let loader = loader.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { loader.run(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(loader.state(), ConfigState::Error { .. }));

        cancel.cancel();
        assert!(handle.await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loader_gives_up_after_max_attempts() {
        let source = Arc::new(FlakySource {
            failures_left: Mutex::new(u32::MAX),
        });
        let loader = ConfigLoader::new(
            source.clone(),
            RetryConfig {
                max_attempts: Some(3),
                ..Default::default()
            },
        );

        assert!(loader.run(&CancelToken::new()).await.is_none());
        assert_eq!(*source.failures_left.lock(), u32::MAX - 3);
        assert!(matches!(
            loader.state(),
            ConfigState::Error { ref message } if message.contains("backend down")
        ));
    }
}
