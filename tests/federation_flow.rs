//! Federation end-to-end: announcements, the RFB auction, and the
//! cross-router job settlement walk.

mod common;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{TestNode, TestRouter, capability_json};
use infermesh::envelope::Envelope;
use infermesh::federation::auction::run_auction_and_award;
use infermesh::federation::jobs::FederationJobState;
use infermesh::federation::messages::{
    ControlMessageType, RouterBidPayload, RouterCapabilityProfile, RouterControlMessage,
    RouterJobResult, RouterJobSubmit, RouterOpStatus, RouterReceipt, RouterRfbPayload,
    RouterStatusPayload,
};
use infermesh::identity::Keys;
use infermesh::proto::{MeteringRecord, PayeeType, PaymentReceipt};
use infermesh::timestamp::UnixMillis;

fn rfb_payload(job_id: &str, max_price_msat: u64) -> RouterRfbPayload {
    RouterRfbPayload {
        job_id: job_id.to_owned(),
        job_type: "inference".to_owned(),
        job_hash: "feedface".to_owned(),
        max_price_msat,
        privacy_level: 1,
        units: 1.0,
    }
}

/// Scenario 6: one peer bids 800 msat under a 1000 msat cap; the auction
/// awards that peer and posts the award exactly once.
#[tokio::test]
async fn auction_awards_the_single_bidder() {
    let peer_keys = Keys::generate();
    let peer = MockServer::start().await;

    let initiator = TestRouter::start(json!({
        "federation": {"enabled": true, "peers": [peer.uri()]}
    }))
    .await;

    let rfb = RouterControlMessage::signed(
        ControlMessageType::Rfb,
        rfb_payload("job-6", 1_000),
        &initiator.keys,
    )
    .unwrap();

    let bid = RouterControlMessage::signed(
        ControlMessageType::Bid,
        RouterBidPayload {
            job_id: "job-6".to_owned(),
            bid_hash: "feedface".to_owned(),
            price_msat: 800,
            units: 1.0,
        },
        &peer_keys,
    )
    .unwrap();

    Mock::given(method("POST"))
        .and(path("/federation/rfb"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&bid))
        .expect(1)
        .mount(&peer)
        .await;
    Mock::given(method("POST"))
        .and(path("/federation/award"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&peer)
        .await;

    let outcome = run_auction_and_award(
        &initiator.state.federation,
        &initiator.keys,
        &initiator.http,
        &rfb,
    )
    .await;

    let award = outcome.award.expect("award issued");
    assert_eq!(award.payload.winner_router_id, peer_keys.npub());
    assert_eq!(award.payload.price_msat, 800);
    award.verify().unwrap();
    assert!(outcome.winner_peer.is_some());
    // Mock expectations assert the award was posted exactly once.
}

/// Bids above the cap cannot win.
#[tokio::test]
async fn auction_ignores_bids_over_cap() {
    let peer_keys = Keys::generate();
    let peer = MockServer::start().await;

    let initiator = TestRouter::start(json!({
        "federation": {"enabled": true, "peers": [peer.uri()]}
    }))
    .await;

    let rfb = RouterControlMessage::signed(
        ControlMessageType::Rfb,
        rfb_payload("job-cap", 500),
        &initiator.keys,
    )
    .unwrap();
    let bid = RouterControlMessage::signed(
        ControlMessageType::Bid,
        RouterBidPayload {
            job_id: "job-cap".to_owned(),
            bid_hash: "feedface".to_owned(),
            price_msat: 800,
            units: 1.0,
        },
        &peer_keys,
    )
    .unwrap();

    Mock::given(method("POST"))
        .and(path("/federation/rfb"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&bid))
        .mount(&peer)
        .await;
    Mock::given(method("POST"))
        .and(path("/federation/award"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&peer)
        .await;

    let outcome = run_auction_and_award(
        &initiator.state.federation,
        &initiator.keys,
        &initiator.http,
        &rfb,
    )
    .await;
    assert!(outcome.award.is_none());
}

/// A responding router prices an inbound RFB from its node capabilities.
#[tokio::test]
async fn responder_bids_over_http() {
    let responder = TestRouter::start(json!({
        "federation": {"enabled": true, "maxPrivacyLevel": 2}
    }))
    .await;
    // A priced node gives the responder a price sheet to quote from.
    let node = TestNode::start(
        &responder.keys,
        json!({"capabilities": [capability_json(0.001, 0.001)]}),
    )
    .await;
    node.register(&responder).await;

    let requester = Keys::generate();
    // 0.002 sat per token -> 2000 msat per 1k tokens sheet price.
    let rfb = RouterControlMessage::signed(
        ControlMessageType::Rfb,
        rfb_payload("job-http", 10_000),
        &requester,
    )
    .unwrap();

    let response = responder
        .http
        .post(responder.url("federation/rfb"))
        .json(&rfb)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let bid: RouterControlMessage<RouterBidPayload> = response.json().await.unwrap();
    bid.verify().unwrap();
    assert_eq!(bid.router_id, responder.keys.npub());
    assert_eq!(bid.payload.job_id, "job-http");
    assert_eq!(bid.payload.bid_hash, "feedface");
    assert_eq!(bid.payload.price_msat, 2_000);
}

/// Announcements from peers are verified, rate limited, and recorded.
#[tokio::test]
async fn peer_announcements_are_recorded_and_rate_limited() {
    let router = TestRouter::start(json!({
        "federation": {"enabled": true, "rateLimitMax": 1, "rateLimitWindowMs": 60000}
    }))
    .await;
    let peer_keys = Keys::generate();

    let caps = RouterControlMessage::signed(
        ControlMessageType::CapsAnnounce,
        RouterCapabilityProfile {
            job_types: vec!["inference".into()],
            models: vec!["mock".into()],
            max_privacy_level: 2,
            endpoint: None,
        },
        &peer_keys,
    )
    .unwrap();

    let response = router
        .http
        .post(router.url("federation/caps"))
        .json(&caps)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(
        router
            .state
            .federation
            .peer_capabilities
            .contains_key(&peer_keys.npub().to_string())
    );

    // Second message of the same type within the window: rate limited.
    let again = RouterControlMessage::signed(
        ControlMessageType::CapsAnnounce,
        RouterCapabilityProfile {
            job_types: vec!["inference".into()],
            models: vec![],
            max_privacy_level: 2,
            endpoint: None,
        },
        &peer_keys,
    )
    .unwrap();
    let response = router
        .http
        .post(router.url("federation/caps"))
        .json(&again)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 429);

    // A different type from the same peer is a separate budget.
    let status = RouterControlMessage::signed(
        ControlMessageType::StatusAnnounce,
        RouterStatusPayload {
            status: RouterOpStatus::Ok,
            active_nodes: 2,
            queue_depth: 0,
        },
        &peer_keys,
    )
    .unwrap();
    let response = router
        .http
        .post(router.url("federation/status"))
        .json(&status)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
}

/// Tampered control messages are refused.
#[tokio::test]
async fn tampered_announcement_is_rejected() {
    let router = TestRouter::start(json!({"federation": {"enabled": true}})).await;
    let peer_keys = Keys::generate();
    let mut status = RouterControlMessage::signed(
        ControlMessageType::StatusAnnounce,
        RouterStatusPayload {
            status: RouterOpStatus::Ok,
            active_nodes: 2,
            queue_depth: 0,
        },
        &peer_keys,
    )
    .unwrap();
    status.payload.active_nodes = 99;

    let response = router
        .http
        .post(router.url("federation/status"))
        .json(&status)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);
}

/// The cross-router job walk: submit, result, payment request, receipt.
#[tokio::test]
async fn federation_job_settles() {
    let router = TestRouter::start(json!({"federation": {"enabled": true}})).await;
    let peer_keys = Keys::generate();
    let worker_keys = Keys::generate();

    // Job arrives from the peer.
    let submit = RouterControlMessage::signed(
        ControlMessageType::JobSubmit,
        RouterJobSubmit {
            job_id: "job-settle".to_owned(),
            job_type: "inference".to_owned(),
            payload: json!({"prompt": "hello"}),
            max_price_msat: Some(10_000),
        },
        &peer_keys,
    )
    .unwrap();
    let response = router
        .http
        .post(router.url("federation/job-submit"))
        .json(&submit)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // The worker's signed metering backs the result and the receipt.
    let metering = Envelope::signed(
        MeteringRecord {
            request_id: "job-settle".to_owned(),
            node_id: "worker-1".to_owned(),
            model_id: "mock".to_owned(),
            prompt_hash: "00".repeat(32),
            input_tokens: 2,
            output_tokens: 8,
            wall_time_ms: 12,
            bytes_in: 5,
            bytes_out: 40,
            ts: UnixMillis::now(),
        },
        &worker_keys,
    )
    .unwrap();

    let result = RouterControlMessage::signed(
        ControlMessageType::JobResult,
        RouterJobResult {
            job_id: "job-settle".to_owned(),
            ok: true,
            output: Some(json!({"text": "done"})),
            error: None,
            worker_receipt: Some(metering.clone()),
        },
        &peer_keys,
    )
    .unwrap();
    let response = router
        .http
        .post(router.url("federation/job-result"))
        .json(&result)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    // The executing side claims payment; we answer with a signed challenge.
    let claim = RouterControlMessage::signed(
        ControlMessageType::Receipt,
        RouterReceipt {
            job_id: "job-settle".to_owned(),
            worker_node_id: "worker-1".to_owned(),
            amount_msat: 9_000,
            metering,
            receipt: None,
        },
        &peer_keys,
    )
    .unwrap();
    let response = router
        .http
        .post(router.url("federation/payment-request"))
        .json(&claim)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    let challenge: Envelope<serde_json::Value> =
        serde_json::from_value(body["payment"].clone()).unwrap();
    challenge.verify(&router.keys.npub()).unwrap();
    let amount_sats = challenge.payload["amountSats"].as_u64().unwrap();
    assert_eq!(amount_sats, 9);

    // The settling client pays and posts the receipt; the job settles.
    let client = Keys::generate();
    let receipt = Envelope::signed(
        PaymentReceipt {
            request_id: "job-settle".to_owned(),
            payee_type: PayeeType::Router,
            payee_id: peer_keys.npub().to_string(),
            amount_sats,
            paid_at_ms: UnixMillis::now(),
            invoice: Some(
                challenge.payload["invoice"].as_str().unwrap().to_owned(),
            ),
            payment_hash: None,
            preimage: None,
        },
        &client,
    )
    .unwrap();
    let response = router
        .http
        .post(router.url("federation/payment-receipt"))
        .json(&receipt)
        .send()
        .await
        .unwrap();
    let status = response.status().as_u16();
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(status, 200, "body: {body}");

    let job = router
        .state
        .federation
        .jobs
        .get("job-settle")
        .map(|j| j.state)
        .unwrap();
    assert_eq!(job, FederationJobState::Settled);
}

/// Self-inspection endpoints expose the signed local view.
#[tokio::test]
async fn self_view_endpoints() {
    let router = TestRouter::start(json!({"federation": {"enabled": true}})).await;
    let node = TestNode::start(
        &router.keys,
        json!({"capabilities": [capability_json(0.5, 0.5)]}),
    )
    .await;
    node.register(&router).await;

    let caps: RouterControlMessage<RouterCapabilityProfile> = router
        .http
        .get(router.url("federation/self/caps"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    caps.verify().unwrap();
    assert!(caps.payload.job_types.contains(&"inference".to_owned()));
    assert!(caps.payload.models.contains(&"mock".to_owned()));

    let status: RouterControlMessage<RouterStatusPayload> = router
        .http
        .get(router.url("federation/self/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.payload.status, RouterOpStatus::Ok);
    assert_eq!(status.payload.active_nodes, 1);

    let sheets: serde_json::Value = router
        .http
        .get(router.url("federation/self/price"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sheet = &sheets["priceSheets"][0];
    assert_eq!(sheet["payload"]["jobType"], "inference");
    // 1.0 sat per token combined -> one million msat per 1k tokens.
    assert_eq!(sheet["payload"]["basePriceMsat"], 1_000_000);
}
