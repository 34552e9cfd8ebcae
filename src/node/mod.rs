//! The worker node: state, admission pipeline, and HTTP surface.

pub mod handlers;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::envelope::Envelope;
use crate::identity::Keys;
use crate::metrics::Metrics;
use crate::nonce_store::{FileNonceStore, MemoryNonceStore, NonceStore};
use crate::oracle::VerifyOracle;
use crate::proto::{Capability, NodeCapacity, NodeDescriptor, Pricing};
use crate::ratelimit::RateLimiter;
use crate::registry::HEARTBEAT_WINDOW_MS;
use crate::runner::{Runner, build_runner};
use crate::timestamp::UnixMillis;

#[derive(Debug, thiserror::Error)]
pub enum NodeInitError {
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("nonce store could not be opened: {0}")]
    NonceStore(#[from] std::io::Error),
    #[error("runner could not be built: {0}")]
    Runner(#[from] crate::runner::RunnerError),
}

/// Everything the node process owns. Shared across handlers as `Arc`.
pub struct NodeState {
    pub config: NodeConfig,
    pub keys: Keys,
    pub node_id: String,
    pub runner: Arc<dyn Runner>,
    pub nonces: Arc<dyn NonceStore>,
    pub limiter: RateLimiter,
    pub metrics: Metrics,
    pub verify_oracle: Option<VerifyOracle>,
    pub http: reqwest::Client,
    in_flight: Arc<AtomicI64>,
}

impl NodeState {
    pub async fn new(config: NodeConfig) -> Result<Arc<Self>, NodeInitError> {
        let keys = config.secret_key.inner().clone();
        let node_id = config.effective_node_id();
        let http = reqwest::Client::new();
        let runner = build_runner(&config.runner, &config, http.clone())?;
        let nonces: Arc<dyn NonceStore> = match &config.nonce_store_path {
            Some(path) => Arc::new(FileNonceStore::open(path).await?),
            None => Arc::new(MemoryNonceStore::new()),
        };
        let verify_oracle = config
            .payment_verification
            .as_ref()
            .map(|c| VerifyOracle::from_config(http.clone(), c));
        let metrics = Metrics::new("node")?;
        let limiter = RateLimiter::new(config.rate_limit_max, config.rate_limit_window_ms);

        Ok(Arc::new(NodeState {
            keys,
            node_id,
            runner,
            nonces,
            limiter,
            metrics,
            verify_oracle,
            http,
            in_flight: Arc::new(AtomicI64::new(0)),
            config,
        }))
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Take one concurrency slot if `currentLoad + inFlight` leaves room.
    ///
    /// The returned guard releases the slot on every exit path.
    pub fn try_acquire_slot(&self) -> Option<InFlightGuard> {
        loop {
            let current = self.in_flight.load(Ordering::SeqCst);
            let occupied = self.config.capacity_current_load + current;
            if occupied >= self.config.capacity_max_concurrent {
                return None;
            }
            if self
                .in_flight
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(InFlightGuard {
                    counter: Arc::clone(&self.in_flight),
                });
            }
        }
    }

    /// Capabilities to advertise: configured ones, or derived from the
    /// runner's model list with free pricing and the runner's own latency
    /// guess for a small representative request.
    pub async fn advertised_capabilities(&self) -> Vec<Capability> {
        if !self.config.capabilities.is_empty() {
            return self.config.capabilities.clone();
        }
        let mut capabilities = Vec::new();
        for model in self.runner.list_models().await {
            let probe = crate::proto::InferenceRequest {
                request_id: "estimate-probe".to_owned(),
                model_id: model.model_id.clone(),
                prompt: String::new(),
                max_tokens: model.max_tokens.min(256),
                temperature: None,
                top_p: None,
                payment_receipts: None,
            };
            let estimate = self.runner.estimate(&probe).await;
            capabilities.push(Capability {
                model_id: model.model_id,
                context_window: model.context_window,
                max_tokens: model.max_tokens,
                pricing: Pricing::free(),
                job_types: Some(vec!["inference".to_owned()]),
                latency_estimate_ms: estimate.latency_estimate_ms,
            });
        }
        capabilities
    }

    /// The descriptor this node registers with.
    pub async fn descriptor(&self, endpoint: url::Url) -> NodeDescriptor {
        NodeDescriptor {
            node_id: self.node_id.clone(),
            key_id: self.keys.npub(),
            endpoint,
            capacity: NodeCapacity {
                max_concurrent: self.config.capacity_max_concurrent,
                current_load: self.config.capacity_current_load + self.in_flight(),
            },
            capabilities: self.advertised_capabilities().await,
            last_heartbeat_ms: None,
            trust_score: None,
        }
    }
}

/// RAII slot held for the duration of one admitted inference.
pub struct InFlightGuard {
    counter: Arc<AtomicI64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Periodic signed registration heartbeats to the configured router.
pub fn spawn_heartbeat_loop(state: Arc<NodeState>, cancel: CancellationToken) {
    let Some(router_url) = state.config.router_url.clone() else {
        return;
    };
    let Some(endpoint) = state.config.endpoint.clone() else {
        tracing::warn!("heartbeats disabled: node endpoint not configured");
        return;
    };
    // Re-register at a third of the activity window so one lost heartbeat
    // does not make the node stale.
    let interval = Duration::from_millis((HEARTBEAT_WINDOW_MS / 3) as u64);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let descriptor = state.descriptor(endpoint.clone()).await;
            let envelope = match Envelope::signed(descriptor, &state.keys) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::error!(error = %e, "heartbeat signing failed");
                    continue;
                }
            };
            let url = match router_url.join("register-node") {
                Ok(url) => url,
                Err(e) => {
                    tracing::error!(error = %e, "bad router url");
                    break;
                }
            };
            match state.http.post(url).json(&envelope).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!("heartbeat accepted");
                }
                Ok(response) => {
                    tracing::warn!(status = %response.status(), "heartbeat rejected");
                }
                Err(e) => tracing::warn!(error = %e, "heartbeat failed"),
            }
        }
    });
}

/// Periodic nonce-store cleanup at a bounded interval.
pub fn spawn_nonce_cleanup(
    nonces: Arc<dyn NonceStore>,
    window_ms: i64,
    cancel: CancellationToken,
) {
    let interval = Duration::from_millis((window_ms / 2).max(1_000) as u64);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            nonces.cleanup(UnixMillis::now() - window_ms).await;
        }
    });
}
