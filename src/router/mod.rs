//! The routing broker: state, request pipeline, and HTTP surface.

pub mod handlers;
pub mod pipeline;

use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::RouterConfig;
use crate::envelope::Envelope;
use crate::error::{ApiError, ErrorKind};
use crate::federation::FederationState;
use crate::federation::messages::{
    ControlMessageType, RouterCapabilityProfile, RouterControlMessage, RouterOpStatus,
    RouterPriceSheet, RouterStatusPayload,
};
use crate::federation::publish::{publish_to_peers, wrap_control_message};
use crate::health::HealthTracker;
use crate::identity::{Keys, Npub};
use crate::metrics::Metrics;
use crate::nonce_store::{FileNonceStore, MemoryNonceStore, NonceStore};
use crate::oracle::{InvoiceOracle, VerifyOracle};
use crate::payments::{PaymentLedger, RouterFeePolicy};
use crate::proto::{ManifestAdmission, NodeManifest, PriceUnit};
use crate::ratelimit::RateLimiter;
use crate::registry::NodeRegistry;
use crate::scheduler::{Candidate, CandidateCache};
use crate::store::RouterStore;
use crate::timestamp::UnixMillis;
use crate::trust::trust_score;

/// Millisats per sat, used when deriving federation price sheets.
const MSAT_PER_SAT: f64 = 1_000.0;

#[derive(Debug, thiserror::Error)]
pub enum RouterInitError {
    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("nonce store could not be opened: {0}")]
    NonceStore(#[from] std::io::Error),
}

/// Everything the router process owns. Shared across handlers as `Arc`.
pub struct RouterState {
    pub config: RouterConfig,
    pub keys: Keys,
    pub registry: NodeRegistry,
    pub health: HealthTracker,
    pub nonces: Arc<dyn NonceStore>,
    pub ledger: PaymentLedger,
    /// Latest self-signed manifest per node id.
    pub manifests: DashMap<String, Envelope<NodeManifest>>,
    /// Latest admission decision per node id.
    pub manifest_admissions: DashMap<String, ManifestAdmission>,
    /// Committed stake units per node id.
    pub stake: DashMap<String, u64>,
    pub limiter: RateLimiter,
    pub metrics: Metrics,
    pub invoice_oracle: Option<InvoiceOracle>,
    pub verify_oracle: Option<VerifyOracle>,
    pub store: Option<Arc<dyn RouterStore>>,
    pub federation: FederationState,
    pub candidate_cache: CandidateCache,
    pub http: reqwest::Client,
}

impl RouterState {
    pub async fn new(config: RouterConfig) -> Result<Arc<Self>, RouterInitError> {
        Self::with_store(config, None).await
    }

    /// Build the state with an optional durable store, hydrating the
    /// in-memory maps from its snapshot.
    pub async fn with_store(
        config: RouterConfig,
        store: Option<Arc<dyn RouterStore>>,
    ) -> Result<Arc<Self>, RouterInitError> {
        let keys = config.secret_key.inner().clone();
        let nonces: Arc<dyn NonceStore> = match &config.nonce_store_path {
            Some(path) => Arc::new(FileNonceStore::open(path).await?),
            None => Arc::new(MemoryNonceStore::new()),
        };
        let http = reqwest::Client::new();
        let invoice_oracle = config
            .invoice_provider
            .as_ref()
            .map(|c| InvoiceOracle::from_config(http.clone(), c));
        let verify_oracle = config
            .payment_verification
            .as_ref()
            .map(|c| VerifyOracle::from_config(http.clone(), c));
        let metrics = Metrics::new("router")?;
        let limiter = RateLimiter::new(config.rate_limit_max, config.rate_limit_window_ms);
        let federation = FederationState::new(config.federation.clone());

        let state = RouterState {
            keys,
            registry: NodeRegistry::new(),
            health: HealthTracker::default(),
            nonces,
            ledger: PaymentLedger::new(),
            manifests: DashMap::new(),
            manifest_admissions: DashMap::new(),
            stake: DashMap::new(),
            limiter,
            metrics,
            invoice_oracle,
            verify_oracle,
            store,
            federation,
            candidate_cache: CandidateCache::new(),
            http,
            config,
        };

        if let Some(store) = state.store.clone() {
            match store.load().await {
                Ok(snapshot) => {
                    for node in snapshot.nodes {
                        let heartbeat = node.last_heartbeat_ms.unwrap_or_else(UnixMillis::now);
                        state.registry.upsert(node, heartbeat);
                    }
                    for (_, envelope) in snapshot.payment_requests {
                        state
                            .ledger
                            .store_request(crate::payments::LedgerScope::Client, envelope);
                    }
                    for manifest in snapshot.manifests {
                        state
                            .manifests
                            .insert(manifest.payload.node_id.clone(), manifest);
                    }
                    for admission in snapshot.manifest_admissions {
                        state
                            .manifest_admissions
                            .insert(admission.node_id.clone(), admission);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "store hydration failed, starting empty"),
            }
        }

        Ok(Arc::new(state))
    }

    pub fn router_id(&self) -> Npub {
        self.keys.npub()
    }

    pub fn fee_policy(&self) -> RouterFeePolicy {
        RouterFeePolicy {
            enabled: self.config.router_fee_enabled,
            bps: self.config.router_fee_bps,
            flat_sats: self.config.router_fee_flat_sats,
            min_sats: self.config.router_fee_min_sats,
            max_sats: self.config.router_fee_max_sats,
            split_enabled: self.config.router_fee_split_enabled,
        }
    }

    /// Client admission against the block, mute, and allow lists.
    pub fn admit_client(&self, client: &Npub) -> Result<(), ApiError> {
        if self.config.client_block_list.contains(client) {
            return Err(ApiError::forbidden(ErrorKind::ClientBlocked));
        }
        if self.config.client_mute_list.contains(client) {
            return Err(ApiError::forbidden(ErrorKind::ClientMuted));
        }
        if !self.config.client_allow_list.is_empty()
            && !self.config.client_allow_list.contains(client)
        {
            return Err(ApiError::forbidden(ErrorKind::ClientNotAllowed));
        }
        Ok(())
    }

    /// Node admission for `/register-node`, `/manifest`, and stake commits.
    pub fn admit_node_key(&self, node_key: &Npub) -> Result<(), ApiError> {
        if self.config.node_block_list.contains(node_key) {
            return Err(ApiError::forbidden(ErrorKind::ClientBlocked));
        }
        if self.config.node_mute_list.contains(node_key) {
            return Err(ApiError::forbidden(ErrorKind::ClientMuted));
        }
        Ok(())
    }

    /// Weighted candidates for the scheduler, memoized on the registry
    /// generation with a short TTL.
    pub fn candidates(&self, now: UnixMillis) -> Vec<Candidate> {
        let generation = self.registry.generation();
        self.candidate_cache.get_or_build(generation, || {
            self.registry
                .active(now, |node_id| self.health.in_cooldown(node_id, now))
                .into_iter()
                .map(|node| {
                    let manifest = self.manifests.get(&node.node_id);
                    let health = self.health.get(&node.node_id);
                    let staked = self
                        .stake
                        .get(&node.node_id)
                        .map(|units| *units.value())
                        .unwrap_or(0);
                    let trust = trust_score(
                        manifest.as_ref().map(|m| &m.value().payload),
                        health.as_ref(),
                        staked,
                    );
                    Candidate { node, trust }
                })
                .collect()
        })
    }

    /// Record a node failure: health accounting plus the per-node metric.
    pub fn mark_node_failure(&self, node_id: &str, now: UnixMillis) {
        self.metrics.node_failures.with_label_values(&[node_id]).inc();
        if let Some(until) = self.health.mark_failure(node_id, now) {
            tracing::warn!(node_id, until = %until, "node entered cooldown");
        }
        self.candidate_cache.invalidate();
    }

    /// Build this router's current federation status payload.
    pub fn local_status_payload(&self, now: UnixMillis) -> RouterStatusPayload {
        let active = self
            .registry
            .active(now, |node_id| self.health.in_cooldown(node_id, now));
        let status = if active.is_empty() {
            RouterOpStatus::Degraded
        } else {
            RouterOpStatus::Ok
        };
        RouterStatusPayload {
            status,
            active_nodes: active.len() as u32,
            queue_depth: self
                .ledger
                .outstanding(crate::payments::LedgerScope::Client) as u32,
        }
    }

    /// Rebuild and re-sign the local federation view: capability profile,
    /// status, and one price sheet per priced job type.
    pub async fn refresh_federation_self(&self) {
        let now = UnixMillis::now();
        let active = self
            .registry
            .active(now, |node_id| self.health.in_cooldown(node_id, now));

        let mut job_types: Vec<String> = Vec::new();
        let mut models: Vec<String> = Vec::new();
        // Cheapest combined per-token rate per job type, in sats.
        let mut cheapest_rate: std::collections::HashMap<String, f64> =
            std::collections::HashMap::new();
        for node in &active {
            for capability in &node.capabilities {
                if !models.contains(&capability.model_id) {
                    models.push(capability.model_id.clone());
                }
                let types = capability
                    .job_types
                    .clone()
                    .unwrap_or_else(|| vec!["inference".to_owned()]);
                for job_type in types {
                    if !job_types.contains(&job_type) {
                        job_types.push(job_type.clone());
                    }
                    if !capability.pricing.is_free() {
                        let rate =
                            capability.pricing.input_rate + capability.pricing.output_rate;
                        cheapest_rate
                            .entry(job_type)
                            .and_modify(|current| *current = current.min(rate))
                            .or_insert(rate);
                    }
                }
            }
        }

        let caps = RouterCapabilityProfile {
            job_types: job_types.clone(),
            models,
            max_privacy_level: self.config.federation.max_privacy_level,
            endpoint: self.config.federation.endpoint.clone(),
        };
        if let Ok(message) =
            RouterControlMessage::signed(ControlMessageType::CapsAnnounce, caps, &self.keys)
        {
            *self.federation.local_capabilities.write().await = Some(message);
        }

        let status = self.local_status_payload(now);
        if let Ok(message) =
            RouterControlMessage::signed(ControlMessageType::StatusAnnounce, status, &self.keys)
        {
            *self.federation.local_status.write().await = Some(message);
        }

        for (job_type, rate_sats_per_token) in cheapest_rate {
            let sheet = RouterPriceSheet {
                job_type: job_type.clone(),
                unit: PriceUnit::Per1kTokens,
                base_price_msat: (rate_sats_per_token * 1_000.0 * MSAT_PER_SAT).round() as u64,
                surge: 1.0,
                currency: crate::proto::CURRENCY_SAT.to_owned(),
            };
            if let Ok(message) =
                RouterControlMessage::signed(ControlMessageType::PriceAnnounce, sheet, &self.keys)
            {
                self.federation.local_price_sheets.insert(job_type, message);
            }
        }
    }
}

/// Periodic federation announcements, one task per router.
pub fn spawn_announce_loop(state: Arc<RouterState>, cancel: CancellationToken) {
    if !state.config.federation.enabled {
        return;
    }
    let interval = std::time::Duration::from_millis(state.config.federation.publish_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            state.refresh_federation_self().await;

            if let Some(caps) = state.federation.local_capabilities.read().await.clone() {
                let delivered =
                    publish_to_peers(&state.federation, &state.http, "federation/caps", &caps)
                        .await;
                tracing::debug!(delivered, "published capability announcement");
                if state.config.federation.nostr_enabled {
                    match wrap_control_message(&state.keys, &caps) {
                        Ok(event) => tracing::debug!(event_id = %event.id, "relay event ready"),
                        Err(e) => tracing::warn!(error = %e, "relay wrapping failed"),
                    }
                }
            }
            if let Some(status) = state.federation.local_status.read().await.clone() {
                publish_to_peers(&state.federation, &state.http, "federation/status", &status)
                    .await;
            }
            let sheets: Vec<_> = state
                .federation
                .local_price_sheets
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            for sheet in sheets {
                publish_to_peers(&state.federation, &state.http, "federation/price", &sheet)
                    .await;
            }
        }
    });
}
