//! Wire records exchanged between clients, the router, and nodes.
//!
//! All records serialize camelCase to match the envelope canonicalization;
//! field names are part of the signing bytes and therefore stable protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::envelope::Envelope;
use crate::identity::Npub;
use crate::timestamp::UnixMillis;

/// The marketplace settles in satoshis.
pub const CURRENCY_SAT: &str = "SAT";

/// Model id wildcard: "pick the cheapest capability that fits".
pub const MODEL_AUTO: &str = "auto";

/// Pricing unit of a capability or federation price sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceUnit {
    #[serde(rename = "PER_1K_TOKENS")]
    Per1kTokens,
    #[serde(rename = "PER_MB")]
    PerMb,
    #[serde(rename = "PER_SECOND")]
    PerSecond,
    #[serde(rename = "PER_JOB")]
    PerJob,
}

/// Per-token (or per-unit) rates advertised by a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pricing {
    pub unit: PriceUnit,
    pub input_rate: f64,
    pub output_rate: f64,
    pub currency: String,
}

impl Pricing {
    /// Free capability, used by unpriced mock deployments.
    pub fn free() -> Self {
        Pricing {
            unit: PriceUnit::Per1kTokens,
            input_rate: 0.0,
            output_rate: 0.0,
            currency: CURRENCY_SAT.to_owned(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.input_rate == 0.0 && self.output_rate == 0.0
    }
}

/// One model a node can serve, with its limits and price.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub model_id: String,
    pub context_window: u64,
    pub max_tokens: u64,
    pub pricing: Pricing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_estimate_ms: Option<u64>,
}

/// Concurrency envelope a node advertises.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapacity {
    pub max_concurrent: i64,
    pub current_load: i64,
}

/// A worker node as known to the router registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub node_id: String,
    pub key_id: Npub,
    pub endpoint: Url,
    pub capacity: NodeCapacity,
    pub capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_ms: Option<UnixMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_score: Option<f64>,
}

/// Model metadata reported by a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub model_id: String,
    pub context_window: u64,
    pub max_tokens: u64,
}

/// A client's inference request; the envelope payload of `POST /infer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub request_id: String,
    pub model_id: String,
    pub prompt: String,
    pub max_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_receipts: Option<Vec<Envelope<PaymentReceipt>>>,
}

/// Token accounting for one inference.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// The node's answer to an inference request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    pub request_id: String,
    pub model_id: String,
    pub output: String,
    pub usage: Usage,
    pub latency_ms: u64,
}

/// Billing evidence emitted alongside every response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringRecord {
    pub request_id: String,
    pub node_id: String,
    pub model_id: String,
    pub prompt_hash: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub wall_time_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub ts: UnixMillis,
}

/// Price quotation request; same metadata as an inference request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    pub request_id: String,
    pub model_id: String,
    pub prompt: String,
    pub max_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
}

/// Total price attached to a quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Price {
    pub total: f64,
    pub currency: String,
}

/// Signed quotation returned by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    pub request_id: String,
    pub model_id: String,
    pub node_id: String,
    pub price: Price,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_estimate_ms: Option<u64>,
    pub expires_at_ms: UnixMillis,
}

/// Who a payment is owed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayeeType {
    Node,
    Router,
}

impl std::fmt::Display for PayeeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayeeType::Node => write!(f, "node"),
            PayeeType::Router => write!(f, "router"),
        }
    }
}

/// One leg of a split payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSplit {
    pub payee_type: PayeeType,
    pub payee_id: String,
    pub amount_sats: u64,
    pub role: String,
}

/// A payment challenge issued with HTTP 402.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub request_id: String,
    pub payee_type: PayeeType,
    pub payee_id: String,
    pub amount_sats: u64,
    pub invoice: String,
    pub expires_at_ms: UnixMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splits: Option<Vec<PaymentSplit>>,
}

/// A client's claim that an invoice was paid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    pub request_id: String,
    pub payee_type: PayeeType,
    pub payee_id: String,
    pub amount_sats: u64,
    pub paid_at_ms: UnixMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preimage: Option<String>,
}

/// A node's self-signed declaration of capability bands, used to seed trust
/// before enough live observations accumulate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeManifest {
    pub node_id: String,
    pub key_id: Npub,
    pub cpu_cores: u32,
    pub ram_gb: u32,
    pub disk_gb: u32,
    pub net_mbps: u32,
    #[serde(default)]
    pub gpu_vram_gb: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ts: Option<UnixMillis>,
}

/// Outcome of assessing a manifest against the relay-discovery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAdmission {
    pub node_id: String,
    pub admitted: bool,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub ts: UnixMillis,
}

/// A stake accounting entry posted to `/stake/commit` or `/stake/slash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeEntry {
    pub node_id: String,
    pub units: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_unit_wire_names() {
        assert_eq!(
            serde_json::to_string(&PriceUnit::Per1kTokens).unwrap(),
            "\"PER_1K_TOKENS\""
        );
        assert_eq!(serde_json::to_string(&PriceUnit::PerMb).unwrap(), "\"PER_MB\"");
    }

    #[test]
    fn payee_type_lowercase() {
        assert_eq!(serde_json::to_string(&PayeeType::Node).unwrap(), "\"node\"");
        assert_eq!(PayeeType::Router.to_string(), "router");
    }

    #[test]
    fn inference_request_camel_case() {
        let req = InferenceRequest {
            request_id: "r1".into(),
            model_id: "mock".into(),
            prompt: "hi".into(),
            max_tokens: 8,
            temperature: None,
            top_p: None,
            payment_receipts: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("requestId").is_some());
        assert!(v.get("maxTokens").is_some());
        assert!(v.get("paymentReceipts").is_none());
    }
}
