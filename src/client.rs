//! The gateway client: wires the key pool, scheduler, connection manager
//! and retry driver into one submit surface.

use crate::api::batch::BatchResponse;
use crate::api::connection::ConnectionManager;
use crate::api::key_pool::KeyPool;
use crate::api::retry::{Classifier, RetryDriver};
use crate::api::scheduler::Scheduler;
use crate::api::transport::{GatewayResponse, Http2Transport, RequestOptions, Transport};
use crate::config::Config;
use crate::error::GatewayError;
use futures::future::join_all;
use http::HeaderName;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default per-request retry budget.
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// A client instance for one gateway host.
///
/// Cloning handles is cheap through `Arc`s internally; [`clone_client`]
/// instead rebuilds a fresh instance (new pool counters, new session)
/// from the stored configuration, sharing nothing with the source.
///
/// [`clone_client`]: GatewayClient::clone_client
pub struct GatewayClient {
    config: Arc<Config>,
    pool: Arc<KeyPool>,
    scheduler: Arc<Scheduler>,
    connection: Option<Arc<ConnectionManager>>,
    transport: Arc<dyn Transport>,
    driver: RetryDriver,
    /// Suppress key attachment on first attempts (the 403 healing path
    /// still attaches one on demand).
    without_key: AtomicBool,
}

impl GatewayClient {
    /// Build a client with the production HTTP/2 transport.
    pub fn new(config: Config) -> Result<Self, GatewayError> {
        config.validate()?;
        let connection = ConnectionManager::new(
            &config.host,
            config.keep_alive,
            config.keep_alive_interval,
            config.connect_retry_delay,
        )?;
        let transport: Arc<dyn Transport> =
            Arc::new(Http2Transport::new(connection.clone(), config.connect_attempts));
        Self::assemble(config, transport, Some(connection))
    }

    /// Build a client over a caller-supplied transport. This is the seam
    /// integration tests use to script wire outcomes.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self, GatewayError> {
        config.validate()?;
        Self::assemble(config, transport, None)
    }

    fn assemble(
        config: Config,
        transport: Arc<dyn Transport>,
        connection: Option<Arc<ConnectionManager>>,
    ) -> Result<Self, GatewayError> {
        let key_name = HeaderName::from_bytes(config.key_name.to_lowercase().as_bytes())
            .map_err(|e| GatewayError::Config(format!("invalid key_name '{}': {e}", config.key_name)))?;
        let pool = KeyPool::new(config.keys.clone(), config.key_rps, config.key_limit);
        let scheduler = Arc::new(Scheduler::new(config.effective_rps()));
        let driver = RetryDriver::new(pool.clone(), key_name, config.timing);
        Ok(GatewayClient {
            config: Arc::new(config),
            pool,
            scheduler,
            connection,
            transport,
            driver,
            without_key: AtomicBool::new(false),
        })
    }

    /// Install a 403 classifier overriding the default freeze policy.
    pub fn with_classifier(mut self, classifier: Arc<Classifier>) -> Self {
        self.driver.set_classifier(classifier);
        self
    }

    /// Toggle keyless-first-attempt mode.
    pub fn without_key(&self, without: bool) -> &Self {
        self.without_key.store(without, Ordering::SeqCst);
        self
    }

    /// Register additional API keys at runtime.
    pub async fn add_keys(&self, keys: Vec<String>) {
        self.pool.add_keys(keys).await;
    }

    /// Rebuild a fresh instance from the stored configuration.
    pub fn clone_client(&self) -> Result<Self, GatewayError> {
        Self::new(self.config.as_ref().clone())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Sessions lost so far; zero for transports without a managed session.
    pub fn dropped_connections(&self) -> u64 {
        self.connection.as_ref().map(|c| c.dropped()).unwrap_or(0)
    }

    /// Enable or disable keep-alive PINGs at runtime.
    pub fn set_keep_alive(&self, enabled: bool) {
        if let Some(connection) = &self.connection {
            connection.set_keep_alive(enabled);
        }
    }

    /// Submit one request through admission control and the retry driver.
    pub async fn send(
        &self,
        options: RequestOptions,
        max_retry: u32,
    ) -> Result<GatewayResponse, GatewayError> {
        let skip_key = self.without_key.load(Ordering::SeqCst);
        self.scheduler
            .submit(self.driver.execute(self.transport.as_ref(), options, max_retry, skip_key))
            .await
    }

    /// Fan a prepared batch out concurrently; each element admits, runs
    /// and fails independently.
    pub async fn send_batch(
        &self,
        batch: Vec<RequestOptions>,
        max_retry: u32,
    ) -> Vec<Result<GatewayResponse, GatewayError>> {
        join_all(batch.into_iter().map(|options| self.send(options, max_retry))).await
    }

    /// Fan out one option map per target and aggregate by target id.
    pub async fn call(
        &self,
        only_one: bool,
        ids: Vec<String>,
        batch: Vec<RequestOptions>,
        max_retry: u32,
    ) -> BatchResponse {
        let results = self.send_batch(batch, max_retry).await;
        BatchResponse::collect(only_one, ids, results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::AttemptOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingTransport {
        sends: AtomicUsize,
        concurrent: AtomicUsize,
        peak: AtomicUsize,
    }

    impl CountingTransport {
        fn new() -> Self {
            CountingTransport {
                sends: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(
            &self,
            _options: &RequestOptions,
            _timing: bool,
        ) -> Result<AttemptOutcome, GatewayError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(AttemptOutcome {
                code: 200,
                headers: http::HeaderMap::new(),
                body: r#"{"data":[]}"#.to_string(),
                phase: None,
            })
        }
    }

    fn test_config() -> Config {
        Config::new("http://127.0.0.1:1")
            .with_keys(vec!["k1".to_string(), "k2".to_string()])
            .with_rps(4) // effective bound 3
    }

    #[tokio::test]
    async fn test_send_attaches_key_and_releases() {
        let transport = Arc::new(CountingTransport::new());
        let client = GatewayClient::with_transport(test_config(), transport.clone()).unwrap();
        let response = client
            .send(RequestOptions::get("/v1/accounts/a"), DEFAULT_MAX_RETRY)
            .await
            .unwrap();
        assert!(response.is_ok());
        assert_eq!(transport.sends.load(Ordering::SeqCst), 1);
        assert_eq!(client.pool().stats().await.in_use, 0);
    }

    #[tokio::test]
    async fn test_batch_respects_scheduler_bound() {
        let transport = Arc::new(CountingTransport::new());
        let client = GatewayClient::with_transport(test_config(), transport.clone()).unwrap();
        let batch: Vec<RequestOptions> =
            (0..12).map(|i| RequestOptions::get(format!("/v1/accounts/{i}"))).collect();
        let results = client.send_batch(batch, DEFAULT_MAX_RETRY).await;
        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.as_ref().unwrap().is_ok()));
        // Effective bound is rps - 1 = 3.
        assert!(transport.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_add_keys_extends_pool() {
        let transport = Arc::new(CountingTransport::new());
        let client = GatewayClient::with_transport(test_config(), transport).unwrap();
        client.add_keys(vec!["k3".to_string(), "k1".to_string()]).await;
        assert_eq!(client.pool().stats().await.active, 3);
    }

    #[tokio::test]
    async fn test_clone_client_gets_fresh_counters() {
        let transport = Arc::new(CountingTransport::new());
        let client = GatewayClient::with_transport(test_config(), transport).unwrap();
        client.pool().acquire(2, Duration::ZERO).await;
        assert_eq!(client.pool().stats().await.in_use, 2);
        let cloned = client.clone_client().unwrap();
        assert_eq!(cloned.pool().stats().await.in_use, 0);
        assert_eq!(cloned.config().host, client.config().host);
    }
}
