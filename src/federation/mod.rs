//! Router-to-router federation.
//!
//! Each router keeps a signed view of itself (capabilities, status, price
//! sheets) and an observed view of every peer, runs request-for-bid auctions
//! to place jobs with the cheapest peer, and settles the resulting work
//! through cross-router payment requests and receipts.

pub mod auction;
pub mod handlers;
pub mod jobs;
pub mod messages;
pub mod publish;

use dashmap::DashMap;
use tokio::sync::RwLock;
use url::Url;

use crate::config::FederationConfig;
use crate::ratelimit::RateLimiter;
use crate::timestamp::UnixMillis;

use jobs::FederationJob;
use messages::{
    ControlMessageType, RouterAwardPayload, RouterBidPayload, RouterCapabilityProfile,
    RouterControlMessage, RouterPriceSheet, RouterStatusPayload,
};

/// Strip a single trailing slash for peer identity comparison.
fn normalized(url: &Url) -> String {
    let s = url.as_str();
    s.strip_suffix('/').unwrap_or(s).to_owned()
}

/// Deduplicate a peer list by trailing-slash-stripped equality, keeping
/// first occurrences in order.
pub fn dedup_peers(peers: &[Url]) -> Vec<Url> {
    let mut seen = std::collections::HashSet::new();
    peers
        .iter()
        .filter(|url| seen.insert(normalized(url)))
        .cloned()
        .collect()
}

/// Federation-plane state owned by the router process.
pub struct FederationState {
    pub config: FederationConfig,
    /// Deduplicated peer URLs.
    pub peers: Vec<Url>,

    pub local_capabilities: RwLock<Option<RouterControlMessage<RouterCapabilityProfile>>>,
    pub local_status: RwLock<Option<RouterControlMessage<RouterStatusPayload>>>,
    /// Local price sheets by job type.
    pub local_price_sheets: DashMap<String, RouterControlMessage<RouterPriceSheet>>,

    /// Peer observations keyed by the peer's router id.
    pub peer_capabilities: DashMap<String, RouterControlMessage<RouterCapabilityProfile>>,
    pub peer_status: DashMap<String, RouterControlMessage<RouterStatusPayload>>,
    /// Keyed `routerId|jobType`.
    pub peer_price_sheets: DashMap<String, RouterControlMessage<RouterPriceSheet>>,

    /// Bids collected per job id.
    pub bids: DashMap<String, Vec<RouterControlMessage<RouterBidPayload>>>,
    /// Awards per job id (sent or received).
    pub awards: DashMap<String, RouterControlMessage<RouterAwardPayload>>,
    /// Cross-router jobs per job id.
    pub jobs: DashMap<String, FederationJob>,

    /// Inbound message rate limiter keyed `(peerId, type)`.
    message_limiter: RateLimiter,
}

impl FederationState {
    pub fn new(config: FederationConfig) -> Self {
        let peers = dedup_peers(&config.peers);
        let message_limiter =
            RateLimiter::new(config.rate_limit_max, config.rate_limit_window_ms);
        FederationState {
            config,
            peers,
            local_capabilities: RwLock::new(None),
            local_status: RwLock::new(None),
            local_price_sheets: DashMap::new(),
            peer_capabilities: DashMap::new(),
            peer_status: DashMap::new(),
            peer_price_sheets: DashMap::new(),
            bids: DashMap::new(),
            awards: DashMap::new(),
            jobs: DashMap::new(),
            message_limiter,
        }
    }

    /// Admit one inbound control message from `peer_id` under the
    /// per-`(peer, type)` rate limit.
    pub fn admit_message(
        &self,
        peer_id: &str,
        message_type: ControlMessageType,
        now: UnixMillis,
    ) -> bool {
        let key = format!("{peer_id}|{}", message_type.as_str());
        self.message_limiter.allow(&key, now)
    }

    /// Record a peer capability announcement.
    pub fn record_capabilities(&self, message: RouterControlMessage<RouterCapabilityProfile>) {
        self.peer_capabilities
            .insert(message.router_id.to_string(), message);
    }

    /// Record a peer status announcement.
    pub fn record_status(&self, message: RouterControlMessage<RouterStatusPayload>) {
        self.peer_status.insert(message.router_id.to_string(), message);
    }

    /// Record a peer price sheet.
    pub fn record_price_sheet(&self, message: RouterControlMessage<RouterPriceSheet>) {
        let key = format!("{}|{}", message.router_id, message.payload.job_type);
        self.peer_price_sheets.insert(key, message);
    }

    /// Drop terminal jobs past retention, settled auction traces, and
    /// stale limiter windows.
    pub fn prune(&self, now: UnixMillis, job_retention_ms: i64) {
        self.jobs
            .retain(|_, job| !job.expired(now, job_retention_ms));
        self.bids
            .retain(|_, bids| bids.iter().any(|bid| now - bid.timestamp < job_retention_ms));
        self.awards
            .retain(|_, award| now - award.timestamp < job_retention_ms);
        self.message_limiter.prune(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_dedup_ignores_trailing_slash() {
        let peers = vec![
            "http://peer-a:8080/".parse().unwrap(),
            "http://peer-a:8080".parse().unwrap(),
            "http://peer-b:8080".parse().unwrap(),
        ];
        let deduped = dedup_peers(&peers);
        assert_eq!(deduped.len(), 2);
        assert_eq!(normalized(&deduped[0]), "http://peer-a:8080");
    }

    #[test]
    fn message_rate_limit_is_per_peer_and_type() {
        let config = FederationConfig {
            rate_limit_max: 1,
            rate_limit_window_ms: 60_000,
            ..FederationConfig::default()
        };
        let state = FederationState::new(config);
        let now = UnixMillis::now();
        assert!(state.admit_message("peer-a", ControlMessageType::Rfb, now));
        assert!(!state.admit_message("peer-a", ControlMessageType::Rfb, now));
        // Different type and different peer are separate budgets.
        assert!(state.admit_message("peer-a", ControlMessageType::Bid, now));
        assert!(state.admit_message("peer-b", ControlMessageType::Rfb, now));
    }
}
