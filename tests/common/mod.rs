//! Shared fixtures for the end-to-end suites: in-process router and node
//! instances served on ephemeral ports, plus envelope-building helpers.
#![allow(dead_code)]

use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use url::Url;

use infermesh::config::{NodeConfig, RouterConfig};
use infermesh::envelope::Envelope;
use infermesh::identity::Keys;
use infermesh::node::NodeState;
use infermesh::proto::InferenceRequest;
use infermesh::router::RouterState;
use infermesh::{node, router};

/// Serve an axum app on an ephemeral port.
pub async fn serve(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub struct TestRouter {
    pub state: Arc<RouterState>,
    pub keys: Keys,
    pub base: Url,
    pub http: reqwest::Client,
}

impl TestRouter {
    /// Start a router with extra JSON config fields merged in.
    pub async fn start(extra: Value) -> Self {
        let keys = Keys::generate();
        let mut config = json!({"secretKey": keys.nsec()});
        merge(&mut config, extra);
        let config: RouterConfig = serde_json::from_value(config).unwrap();
        let state = RouterState::new(config).await.unwrap();
        let addr = serve(router::handlers::routes(Arc::clone(&state))).await;
        TestRouter {
            state,
            keys,
            base: format!("http://{addr}/").parse().unwrap(),
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> Url {
        self.base.join(path).unwrap()
    }

    /// POST a signed envelope and return `(status, body)`.
    pub async fn post_envelope<T: serde::Serialize>(
        &self,
        path: &str,
        envelope: &Envelope<T>,
    ) -> (u16, Value) {
        let response = self
            .http
            .post(self.url(path))
            .json(envelope)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }
}

pub struct TestNode {
    pub state: Arc<NodeState>,
    pub keys: Keys,
    pub base: Url,
}

impl TestNode {
    /// Start a node trusting `router_keys`, with extra config merged in.
    pub async fn start(router_keys: &Keys, extra: Value) -> Self {
        let keys = Keys::generate();
        let mut config = json!({
            "secretKey": keys.nsec(),
            "routerPublicKey": router_keys.npub().to_string(),
        });
        merge(&mut config, extra);
        let config: NodeConfig = serde_json::from_value(config).unwrap();
        let state = NodeState::new(config).await.unwrap();
        let addr = serve(node::handlers::routes(Arc::clone(&state))).await;
        TestNode {
            state,
            keys,
            base: format!("http://{addr}/").parse().unwrap(),
        }
    }

    /// Register this node with the router via a signed heartbeat.
    pub async fn register(&self, router: &TestRouter) {
        let descriptor = self.state.descriptor(self.base.clone()).await;
        let envelope = Envelope::signed(descriptor, &self.keys).unwrap();
        let (status, body) = router.post_envelope("register-node", &envelope).await;
        assert_eq!(status, 200, "registration failed: {body}");
    }
}

/// A free capability for model `mock`, or a priced one at the given rates.
pub fn capability_json(input_rate: f64, output_rate: f64) -> Value {
    json!({
        "modelId": "mock",
        "contextWindow": 8192,
        "maxTokens": 2048,
        "pricing": {
            "unit": "PER_1K_TOKENS",
            "inputRate": input_rate,
            "outputRate": output_rate,
            "currency": "SAT"
        },
        "jobTypes": ["inference"]
    })
}

pub fn inference_request(request_id: &str, prompt: &str, max_tokens: u64) -> InferenceRequest {
    InferenceRequest {
        request_id: request_id.to_owned(),
        model_id: "mock".to_owned(),
        prompt: prompt.to_owned(),
        max_tokens,
        temperature: None,
        top_p: None,
        payment_receipts: None,
    }
}

/// Shallow-merge `extra` object fields into `base`.
pub fn merge(base: &mut Value, extra: Value) {
    if let (Value::Object(base), Value::Object(extra)) = (base, extra) {
        for (key, value) in extra {
            base.insert(key, value);
        }
    }
}
