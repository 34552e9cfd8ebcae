//! Seeded end-to-end scenarios: a real router and a real node served on
//! ephemeral ports, driven over HTTP.

mod common;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{TestNode, TestRouter, capability_json, inference_request};
use infermesh::canonical::sha256_hex;
use infermesh::envelope::Envelope;
use infermesh::identity::Keys;
use infermesh::proto::{NodeCapacity, NodeDescriptor, PayeeType, PaymentReceipt};
use infermesh::timestamp::UnixMillis;

/// Scenario 1: unpriced happy path.
#[tokio::test]
async fn unpriced_happy_path() {
    let router = TestRouter::start(json!({})).await;
    let node = TestNode::start(
        &router.keys,
        json!({"capabilities": [capability_json(0.0, 0.0)]}),
    )
    .await;
    node.register(&router).await;

    let client = Keys::generate();
    let envelope = Envelope::signed(inference_request("req-1", "hi", 8), &client).unwrap();
    let (status, body) = router.post_envelope("infer", &envelope).await;

    assert_eq!(status, 200, "body: {body}");
    let output = body["response"]["payload"]["output"].as_str().unwrap();
    assert!(!output.is_empty());
    assert_eq!(
        body["metering"]["payload"]["promptHash"].as_str().unwrap(),
        sha256_hex(b"hi")
    );
    // Both nested envelopes carry the node's key.
    let node_key = node.keys.npub().to_string();
    assert_eq!(body["response"]["keyId"], node_key);
    assert_eq!(body["metering"]["keyId"], node_key);
}

/// Scenario 2: priced flow. 402 challenge, receipt, then success.
#[tokio::test]
async fn priced_flow_pays_then_succeeds() {
    let router = TestRouter::start(json!({"requirePayment": true})).await;
    let node = TestNode::start(
        &router.keys,
        json!({
            "requirePayment": true,
            "capabilities": [capability_json(1.0, 1.0)],
        }),
    )
    .await;
    node.register(&router).await;

    let client = Keys::generate();
    let request = inference_request("req-paid", "hi", 8);

    // First attempt: payment challenge.
    let envelope = Envelope::signed(request.clone(), &client).unwrap();
    let (status, body) = router.post_envelope("infer", &envelope).await;
    assert_eq!(status, 402, "body: {body}");
    assert_eq!(body["error"], "payment-required");
    let payment = &body["payment"]["payload"];
    let amount_sats = payment["amountSats"].as_u64().unwrap();
    assert!(amount_sats >= 1);
    let invoice = payment["invoice"].as_str().unwrap().to_owned();
    let payee_id = payment["payeeId"].as_str().unwrap().to_owned();

    // Pay and post the receipt.
    let receipt = PaymentReceipt {
        request_id: request.request_id.clone(),
        payee_type: PayeeType::Node,
        payee_id,
        amount_sats,
        paid_at_ms: UnixMillis::now(),
        invoice: Some(invoice),
        payment_hash: None,
        preimage: None,
    };
    let receipt_envelope = Envelope::signed(receipt, &client).unwrap();
    let (status, body) = router.post_envelope("payment-receipt", &receipt_envelope).await;
    assert_eq!(status, 200, "body: {body}");

    // Re-posting the same receipt envelope verbatim is a replay.
    let (status, body) = router.post_envelope("payment-receipt", &receipt_envelope).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "nonce-duplicate");

    // Retry: the router attaches the stored receipt and forwards.
    let retry = Envelope::signed(request, &client).unwrap();
    let (status, body) = router.post_envelope("infer", &retry).await;
    assert_eq!(status, 200, "body: {body}");
    assert!(!body["response"]["payload"]["output"].as_str().unwrap().is_empty());
}

/// Scenario 3: replaying the same envelope verbatim is rejected.
#[tokio::test]
async fn replayed_envelope_is_rejected() {
    let router = TestRouter::start(json!({})).await;
    let node = TestNode::start(
        &router.keys,
        json!({"capabilities": [capability_json(0.0, 0.0)]}),
    )
    .await;
    node.register(&router).await;

    let client = Keys::generate();
    let envelope = Envelope::signed(inference_request("req-replay", "hi", 8), &client).unwrap();

    let (status, _) = router.post_envelope("infer", &envelope).await;
    assert_eq!(status, 200);
    let (status, body) = router.post_envelope("infer", &envelope).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "nonce-duplicate");
}

/// Scenario 4: one flipped signature bit fails authentication.
#[tokio::test]
async fn tampered_signature_is_rejected() {
    let router = TestRouter::start(json!({})).await;
    let node = TestNode::start(
        &router.keys,
        json!({"capabilities": [capability_json(0.0, 0.0)]}),
    )
    .await;
    node.register(&router).await;

    let client = Keys::generate();
    let mut envelope =
        Envelope::signed(inference_request("req-tamper", "hi", 8), &client).unwrap();
    let mut sig = B64.decode(envelope.sig.take().unwrap()).unwrap();
    sig[7] ^= 0x01;
    envelope.sig = Some(B64.encode(sig));

    let (status, body) = router.post_envelope("infer", &envelope).await;
    assert_eq!(status, 401);
    assert_eq!(body["error"], "invalid-signature");
}

/// Scenario 5a: a persistently failing node cools down; with nobody else
/// registered the fourth request reports no available nodes.
#[tokio::test]
async fn failing_node_enters_cooldown() {
    let router = TestRouter::start(json!({})).await;

    // A "node" that always responds 500.
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/infer"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&broken)
        .await;

    let broken_keys = Keys::generate();
    let descriptor = NodeDescriptor {
        node_id: "broken-node".to_owned(),
        key_id: broken_keys.npub(),
        endpoint: format!("{}/", broken.uri()).parse().unwrap(),
        capacity: NodeCapacity {
            max_concurrent: 4,
            current_load: 0,
        },
        capabilities: vec![serde_json::from_value(capability_json(0.0, 0.0)).unwrap()],
        last_heartbeat_ms: None,
        trust_score: None,
    };
    let envelope = Envelope::signed(descriptor, &broken_keys).unwrap();
    let (status, _) = router.post_envelope("register-node", &envelope).await;
    assert_eq!(status, 200);

    let client = Keys::generate();
    for attempt in 0..3 {
        let envelope = Envelope::signed(
            inference_request(&format!("req-fail-{attempt}"), "hi", 8),
            &client,
        )
        .unwrap();
        let (status, body) = router.post_envelope("infer", &envelope).await;
        assert_eq!(status, 502, "attempt {attempt}: {body}");
        assert_eq!(body["error"], "node-error");
    }

    let envelope = Envelope::signed(inference_request("req-fail-final", "hi", 8), &client).unwrap();
    let (status, body) = router.post_envelope("infer", &envelope).await;
    assert_eq!(status, 503, "body: {body}");
    assert_eq!(body["error"], "no-nodes-available");
}

/// Scenario 5b: with a failing node and a healthy one, a single request
/// falls back and succeeds on the healthy node.
#[tokio::test]
async fn fallback_to_healthy_node() {
    let router = TestRouter::start(json!({})).await;

    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/infer"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&broken)
        .await;

    // The broken node is free, the healthy one slightly priced, so the
    // scheduler tries the broken one first.
    let broken_keys = Keys::generate();
    let descriptor = NodeDescriptor {
        node_id: "broken-node".to_owned(),
        key_id: broken_keys.npub(),
        endpoint: format!("{}/", broken.uri()).parse().unwrap(),
        capacity: NodeCapacity {
            max_concurrent: 4,
            current_load: 0,
        },
        capabilities: vec![serde_json::from_value(capability_json(0.0, 0.0)).unwrap()],
        last_heartbeat_ms: None,
        trust_score: None,
    };
    let envelope = Envelope::signed(descriptor, &broken_keys).unwrap();
    let (status, _) = router.post_envelope("register-node", &envelope).await;
    assert_eq!(status, 200);

    let healthy = TestNode::start(
        &router.keys,
        json!({
            "nodeId": "healthy-node",
            "capabilities": [capability_json(0.001, 0.001)],
        }),
    )
    .await;
    healthy.register(&router).await;

    let client = Keys::generate();
    let envelope = Envelope::signed(inference_request("req-fb", "hi", 8), &client).unwrap();
    let (status, body) = router.post_envelope("infer", &envelope).await;
    assert_eq!(status, 200, "body: {body}");
    assert_eq!(body["metering"]["payload"]["nodeId"], "healthy-node");
}

/// `GET /nodes` distinguishes known from active; `/health` and `/metrics`
/// answer on both services.
#[tokio::test]
async fn observability_surfaces() {
    let router = TestRouter::start(json!({})).await;
    let node = TestNode::start(
        &router.keys,
        json!({"capabilities": [capability_json(0.0, 0.0)]}),
    )
    .await;
    node.register(&router).await;

    let health: serde_json::Value = router
        .http
        .get(router.url("health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["ok"], true);

    let nodes: serde_json::Value = router
        .http
        .get(router.url("nodes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(nodes["nodes"].as_array().unwrap().len(), 1);
    assert_eq!(nodes["active"].as_array().unwrap().len(), 1);

    let metrics = router
        .http
        .get(router.url("metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("infermesh_http_requests_total"));

    let node_status: serde_json::Value = router
        .http
        .get(node.base.join("status").unwrap())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(node_status["inFlight"], 0);
    assert_eq!(node_status["models"][0]["modelId"], "mock");
}

/// Quote issuance: signed by the router, expiring one minute out.
#[tokio::test]
async fn quote_is_signed_and_bounded() {
    let router = TestRouter::start(json!({})).await;
    let node = TestNode::start(
        &router.keys,
        json!({"capabilities": [capability_json(2.0, 3.0)]}),
    )
    .await;
    node.register(&router).await;

    let client = Keys::generate();
    let quote_request = serde_json::json!({
        "requestId": "q-1",
        "modelId": "mock",
        "prompt": "hello quote",
        "maxTokens": 16
    });
    let envelope = Envelope::signed(quote_request, &client).unwrap();
    let (status, body) = router.post_envelope("quote", &envelope).await;
    assert_eq!(status, 200, "body: {body}");

    let quote: Envelope<serde_json::Value> =
        serde_json::from_value(body["quote"].clone()).unwrap();
    quote.verify(&router.keys.npub()).unwrap();
    // 3 input tokens at rate 2 plus 16 output tokens at rate 3.
    assert_eq!(quote.payload["price"]["total"].as_f64().unwrap(), 54.0);
    let expires = quote.payload["expiresAtMs"].as_i64().unwrap();
    assert!(expires > UnixMillis::now().as_i64());
}
