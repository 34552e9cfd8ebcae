//! The request-for-bid auction between routers.
//!
//! The initiating router fans an RFB out to every peer with bounded
//! concurrency, collects signed bids from the responses, awards the
//! cheapest valid one, and posts the award to the winning peer. The
//! responding side prices the job from its local sheet and declines when
//! saturated, unpriced, too expensive, or asked for more privacy than it
//! offers.

use futures_util::StreamExt;
use futures_util::stream;
use std::time::Duration;
use url::Url;

use crate::identity::Keys;
use crate::timestamp::UnixMillis;

use super::FederationState;
use super::messages::{
    ControlMessageType, RouterAwardPayload, RouterBidPayload, RouterControlMessage,
    RouterOpStatus, RouterRfbPayload,
};
use crate::proto::PriceUnit;

/// Why the responding router declined to bid.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BidRejection {
    #[error("router is saturated")]
    Saturated,
    #[error("job type {0} not offered")]
    JobTypeNotSupported(String),
    #[error("no price sheet for job type {0}")]
    NoPriceSheet(String),
    #[error("priced at {priced_msat} msat, above the {max_price_msat} msat cap")]
    TooExpensive {
        priced_msat: u64,
        max_price_msat: u64,
    },
    #[error("privacy level {requested} exceeds local maximum {supported}")]
    PrivacyExceeded { requested: u8, supported: u8 },
    #[error("bid could not be signed")]
    Signing,
}

/// Work size in pricing units: per-job pricing ignores the declared size.
pub fn units_for(unit: PriceUnit, rfb_units: f64) -> f64 {
    match unit {
        PriceUnit::PerJob => 1.0,
        PriceUnit::Per1kTokens | PriceUnit::PerMb | PriceUnit::PerSecond => rfb_units,
    }
}

/// Respond to an inbound RFB with a signed bid, or decline.
pub async fn build_bid(
    federation: &FederationState,
    keys: &Keys,
    rfb: &RouterRfbPayload,
) -> Result<RouterControlMessage<RouterBidPayload>, BidRejection> {
    let status = federation.local_status.read().await;
    if let Some(status) = status.as_ref() {
        if status.payload.status == RouterOpStatus::Saturated {
            return Err(BidRejection::Saturated);
        }
    }
    drop(status);

    let capabilities = federation.local_capabilities.read().await;
    let advertises_job_type = capabilities
        .as_ref()
        .is_some_and(|caps| caps.payload.job_types.iter().any(|t| *t == rfb.job_type));
    if !advertises_job_type {
        return Err(BidRejection::JobTypeNotSupported(rfb.job_type.clone()));
    }
    drop(capabilities);

    if rfb.privacy_level > federation.config.max_privacy_level {
        return Err(BidRejection::PrivacyExceeded {
            requested: rfb.privacy_level,
            supported: federation.config.max_privacy_level,
        });
    }

    let sheet = federation
        .local_price_sheets
        .get(&rfb.job_type)
        .ok_or_else(|| BidRejection::NoPriceSheet(rfb.job_type.clone()))?;
    let units = units_for(sheet.payload.unit, rfb.units);
    let priced_msat =
        (sheet.payload.base_price_msat as f64 * sheet.payload.surge * units).round() as u64;
    drop(sheet);

    if priced_msat > rfb.max_price_msat {
        return Err(BidRejection::TooExpensive {
            priced_msat,
            max_price_msat: rfb.max_price_msat,
        });
    }

    let payload = RouterBidPayload {
        job_id: rfb.job_id.clone(),
        bid_hash: rfb.job_hash.clone(),
        price_msat: priced_msat,
        units,
    };
    RouterControlMessage::signed(ControlMessageType::Bid, payload, keys)
        .map_err(|_| BidRejection::Signing)
}

/// A bid together with the peer it came from.
pub type PeerBid = (Url, RouterControlMessage<RouterBidPayload>);

/// Fan the RFB out to every peer and collect valid bids.
///
/// Each peer gets `POST {peer}/federation/rfb` with the signed RFB; the
/// response body, when 200, is the peer's signed BID. Invalid signatures,
/// mismatched job ids, and bids echoing the wrong hash are discarded.
pub async fn run_federation_auction(
    federation: &FederationState,
    http: &reqwest::Client,
    rfb: &RouterControlMessage<RouterRfbPayload>,
) -> Vec<PeerBid> {
    let timeout = Duration::from_millis(federation.config.request_timeout_ms);
    let concurrency = federation.config.auction_concurrency.max(1);
    let now = UnixMillis::now();

    let requests = federation.peers.iter().map(|peer| {
        let peer = peer.clone();
        let http = http.clone();
        let rfb = rfb.clone();
        async move {
            let url = match peer.join("federation/rfb") {
                Ok(url) => url,
                Err(_) => return None,
            };
            let response = http
                .post(url)
                .timeout(timeout)
                .json(&rfb)
                .send()
                .await
                .ok()?;
            if !response.status().is_success() {
                return None;
            }
            let bid = response
                .json::<RouterControlMessage<RouterBidPayload>>()
                .await
                .ok()?;
            Some((peer, bid))
        }
    });

    let mut bids: Vec<PeerBid> = stream::iter(requests)
        .buffer_unordered(concurrency)
        .filter_map(|maybe| async move { maybe })
        .collect()
        .await;

    bids.retain(|(peer, bid)| {
        let valid = bid.verify_live(now).is_ok()
            && bid.message_type == ControlMessageType::Bid
            && bid.payload.job_id == rfb.payload.job_id
            && bid.payload.bid_hash == rfb.payload.job_hash;
        if !valid {
            tracing::warn!(peer = %peer, "discarding invalid bid");
        }
        valid
    });

    federation.bids.insert(
        rfb.payload.job_id.clone(),
        bids.iter().map(|(_, bid)| bid.clone()).collect(),
    );
    bids
}

/// Award the cheapest affordable bid.
///
/// Bids sort ascending by `priceMsat` with `messageId` breaking ties; the
/// winner must itself appear among the collected bids.
pub fn select_award_from_bids(
    keys: &Keys,
    rfb: &RouterRfbPayload,
    bids: &[RouterControlMessage<RouterBidPayload>],
) -> Option<RouterControlMessage<RouterAwardPayload>> {
    let mut ordered: Vec<&RouterControlMessage<RouterBidPayload>> = bids.iter().collect();
    ordered.sort_by(|a, b| {
        a.payload
            .price_msat
            .cmp(&b.payload.price_msat)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });

    let winner = ordered
        .into_iter()
        .filter(|bid| bid.payload.price_msat <= rfb.max_price_msat)
        .find(|bid| bids.iter().any(|b| b.router_id == bid.router_id))?;

    let payload = RouterAwardPayload {
        job_id: rfb.job_id.clone(),
        winner_router_id: winner.router_id,
        bid_message_id: winner.message_id.clone(),
        price_msat: winner.payload.price_msat,
    };
    RouterControlMessage::signed(ControlMessageType::Award, payload, keys).ok()
}

#[derive(Debug, thiserror::Error)]
pub enum AuctionError {
    #[error("award transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("award rejected with status {0}")]
    Rejected(u16),
    #[error("bad peer url")]
    BadPeerUrl,
}

/// Post an award to the winning peer.
pub async fn publish_award(
    federation: &FederationState,
    http: &reqwest::Client,
    peer: &Url,
    award: &RouterControlMessage<RouterAwardPayload>,
) -> Result<(), AuctionError> {
    let url = peer
        .join("federation/award")
        .map_err(|_| AuctionError::BadPeerUrl)?;
    let timeout = Duration::from_millis(federation.config.request_timeout_ms);
    let response = http.post(url).timeout(timeout).json(award).send().await?;
    if !response.status().is_success() {
        return Err(AuctionError::Rejected(response.status().as_u16()));
    }
    Ok(())
}

/// Outcome of a full auction round.
#[derive(Debug, Default)]
pub struct AuctionOutcome {
    pub award: Option<RouterControlMessage<RouterAwardPayload>>,
    pub winner_peer: Option<Url>,
}

/// Run the whole round: fan out, select, publish, remember.
pub async fn run_auction_and_award(
    federation: &FederationState,
    keys: &Keys,
    http: &reqwest::Client,
    rfb: &RouterControlMessage<RouterRfbPayload>,
) -> AuctionOutcome {
    let bids = run_federation_auction(federation, http, rfb).await;
    if bids.is_empty() {
        return AuctionOutcome::default();
    }
    let collected: Vec<_> = bids.iter().map(|(_, bid)| bid.clone()).collect();
    let Some(award) = select_award_from_bids(keys, &rfb.payload, &collected) else {
        return AuctionOutcome::default();
    };
    let winner_peer = bids
        .iter()
        .find(|(_, bid)| bid.router_id == award.payload.winner_router_id)
        .map(|(peer, _)| peer.clone());

    if let Some(peer) = &winner_peer {
        if let Err(e) = publish_award(federation, http, peer, &award).await {
            tracing::warn!(peer = %peer, error = %e, "award publication failed");
            return AuctionOutcome::default();
        }
    }

    federation
        .awards
        .insert(award.payload.job_id.clone(), award.clone());
    AuctionOutcome {
        award: Some(award),
        winner_peer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FederationConfig;
    use crate::federation::messages::{RouterCapabilityProfile, RouterPriceSheet, RouterStatusPayload};

    fn rfb(max_price_msat: u64) -> RouterRfbPayload {
        RouterRfbPayload {
            job_id: "job-1".into(),
            job_type: "inference".into(),
            job_hash: "abc123".into(),
            max_price_msat,
            privacy_level: 1,
            units: 2.0,
        }
    }

    async fn federation_with_sheet(keys: &Keys, base_price_msat: u64) -> FederationState {
        let state = FederationState::new(FederationConfig::default());
        let caps = RouterControlMessage::signed(
            ControlMessageType::CapsAnnounce,
            RouterCapabilityProfile {
                job_types: vec!["inference".into()],
                models: vec!["mock".into()],
                max_privacy_level: 2,
                endpoint: None,
            },
            keys,
        )
        .unwrap();
        *state.local_capabilities.write().await = Some(caps);
        let sheet = RouterControlMessage::signed(
            ControlMessageType::PriceAnnounce,
            RouterPriceSheet {
                job_type: "inference".into(),
                unit: PriceUnit::Per1kTokens,
                base_price_msat,
                surge: 1.0,
                currency: "SAT".into(),
            },
            keys,
        )
        .unwrap();
        state.local_price_sheets.insert("inference".into(), sheet);
        state
    }

    #[tokio::test]
    async fn responder_prices_from_sheet() {
        let keys = Keys::generate();
        let state = federation_with_sheet(&keys, 400).await;
        let bid = build_bid(&state, &keys, &rfb(1_000)).await.unwrap();
        assert_eq!(bid.payload.price_msat, 800); // 400 * 1.0 * 2 units
        assert_eq!(bid.payload.bid_hash, "abc123");
        bid.verify().unwrap();
    }

    #[tokio::test]
    async fn responder_rejects_over_cap_and_privacy() {
        let keys = Keys::generate();
        let state = federation_with_sheet(&keys, 600).await;
        assert!(matches!(
            build_bid(&state, &keys, &rfb(1_000)).await,
            Err(BidRejection::TooExpensive { priced_msat: 1200, .. })
        ));

        let mut private = rfb(10_000);
        private.privacy_level = 3;
        assert!(matches!(
            build_bid(&state, &keys, &private).await,
            Err(BidRejection::PrivacyExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn responder_rejects_when_saturated_or_unpriced() {
        let keys = Keys::generate();
        let state = federation_with_sheet(&keys, 100).await;
        let saturated = RouterControlMessage::signed(
            ControlMessageType::StatusAnnounce,
            RouterStatusPayload {
                status: RouterOpStatus::Saturated,
                active_nodes: 0,
                queue_depth: 50,
            },
            &keys,
        )
        .unwrap();
        *state.local_status.write().await = Some(saturated);
        assert!(matches!(
            build_bid(&state, &keys, &rfb(1_000)).await,
            Err(BidRejection::Saturated)
        ));

        let state = federation_with_sheet(&keys, 100).await;
        let mut unknown = rfb(1_000);
        unknown.job_type = "batch".into();
        assert!(matches!(
            build_bid(&state, &keys, &unknown).await,
            Err(BidRejection::JobTypeNotSupported(_))
        ));

        state.local_price_sheets.clear();
        assert!(matches!(
            build_bid(&state, &keys, &rfb(1_000)).await,
            Err(BidRejection::NoPriceSheet(_))
        ));
    }

    #[tokio::test]
    async fn per_job_pricing_ignores_units() {
        let keys = Keys::generate();
        let state = federation_with_sheet(&keys, 500).await;
        if let Some(mut sheet) = state.local_price_sheets.get_mut("inference") {
            sheet.payload.unit = PriceUnit::PerJob;
        }
        // Re-sign after mutation so verification still holds.
        if let Some(mut sheet) = state.local_price_sheets.get_mut("inference") {
            sheet.sign(&keys).unwrap();
        }
        let bid = build_bid(&state, &keys, &rfb(1_000)).await.unwrap();
        assert_eq!(bid.payload.price_msat, 500);
    }

    fn bid_message(keys: &Keys, price_msat: u64) -> RouterControlMessage<RouterBidPayload> {
        RouterControlMessage::signed(
            ControlMessageType::Bid,
            RouterBidPayload {
                job_id: "job-1".into(),
                bid_hash: "abc123".into(),
                price_msat,
                units: 2.0,
            },
            keys,
        )
        .unwrap()
    }

    #[test]
    fn award_goes_to_cheapest_bid() {
        let initiator = Keys::generate();
        let cheap = Keys::generate();
        let pricey = Keys::generate();
        let bids = vec![bid_message(&pricey, 900), bid_message(&cheap, 700)];
        let award = select_award_from_bids(&initiator, &rfb(1_000), &bids).unwrap();
        assert_eq!(award.payload.winner_router_id, cheap.npub());
        assert_eq!(award.payload.price_msat, 700);
        award.verify().unwrap();
    }

    #[test]
    fn bids_above_cap_cannot_win() {
        let initiator = Keys::generate();
        let bidder = Keys::generate();
        let bids = vec![bid_message(&bidder, 5_000)];
        assert!(select_award_from_bids(&initiator, &rfb(1_000), &bids).is_none());
    }

    #[test]
    fn price_ties_break_by_message_id() {
        let initiator = Keys::generate();
        let a = Keys::generate();
        let b = Keys::generate();
        let bid_a = bid_message(&a, 700);
        let bid_b = bid_message(&b, 700);
        let expected = if bid_a.message_id < bid_b.message_id {
            bid_a.router_id
        } else {
            bid_b.router_id
        };
        let award =
            select_award_from_bids(&initiator, &rfb(1_000), &[bid_a, bid_b]).unwrap();
        assert_eq!(award.payload.winner_router_id, expected);
    }
}
