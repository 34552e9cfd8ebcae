//! Signed control messages exchanged between federated routers.
//!
//! Every message is a [`RouterControlMessage`]: a typed payload wrapped with
//! the originating router's identity, a message id, issue and expiry
//! timestamps, and a Schnorr signature over the canonical serialization of
//! all fields except `sig`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::canonical::{canonical_json, sha256};
use crate::envelope::Envelope;
use crate::identity::{Keys, Npub};
use crate::proto::{MeteringRecord, PaymentReceipt, PriceUnit};
use crate::timestamp::UnixMillis;

/// Control message schema version.
pub const CONTROL_MESSAGE_VERSION: u32 = 1;
/// Default control message lifetime.
pub const CONTROL_MESSAGE_TTL_MS: i64 = 5 * 60 * 1000;

/// Discriminant of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlMessageType {
    #[serde(rename = "CAPS_ANNOUNCE")]
    CapsAnnounce,
    #[serde(rename = "STATUS_ANNOUNCE")]
    StatusAnnounce,
    #[serde(rename = "PRICE_ANNOUNCE")]
    PriceAnnounce,
    #[serde(rename = "RFB")]
    Rfb,
    #[serde(rename = "BID")]
    Bid,
    #[serde(rename = "AWARD")]
    Award,
    #[serde(rename = "JOB_SUBMIT")]
    JobSubmit,
    #[serde(rename = "JOB_RESULT")]
    JobResult,
    #[serde(rename = "RECEIPT")]
    Receipt,
}

impl ControlMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMessageType::CapsAnnounce => "CAPS_ANNOUNCE",
            ControlMessageType::StatusAnnounce => "STATUS_ANNOUNCE",
            ControlMessageType::PriceAnnounce => "PRICE_ANNOUNCE",
            ControlMessageType::Rfb => "RFB",
            ControlMessageType::Bid => "BID",
            ControlMessageType::Award => "AWARD",
            ControlMessageType::JobSubmit => "JOB_SUBMIT",
            ControlMessageType::JobResult => "JOB_RESULT",
            ControlMessageType::Receipt => "RECEIPT",
        }
    }
}

/// Signed wrapper for every federation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterControlMessage<T> {
    #[serde(rename = "type")]
    pub message_type: ControlMessageType,
    pub version: u32,
    pub router_id: Npub,
    pub message_id: String,
    pub timestamp: UnixMillis,
    pub expiry: UnixMillis,
    pub payload: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlMessageError {
    #[error("control message is not signed")]
    SignatureMissing,
    #[error("control message signature invalid")]
    SignatureInvalid,
    #[error("control message expired")]
    Expired,
    #[error("control message payload invalid: {0}")]
    InvalidPayload(String),
}

impl<T: Serialize> RouterControlMessage<T> {
    /// Build and sign a message from this router with default TTL.
    pub fn signed(
        message_type: ControlMessageType,
        payload: T,
        keys: &Keys,
    ) -> Result<Self, ControlMessageError> {
        let now = UnixMillis::now();
        let mut message = RouterControlMessage {
            message_type,
            version: CONTROL_MESSAGE_VERSION,
            router_id: keys.npub(),
            message_id: Uuid::new_v4().to_string(),
            timestamp: now,
            expiry: now + CONTROL_MESSAGE_TTL_MS,
            payload,
            sig: None,
        };
        message.sign(keys)?;
        Ok(message)
    }

    fn signing_digest(&self) -> Result<[u8; 32], ControlMessageError> {
        let payload = serde_json::to_value(&self.payload)
            .map_err(|e| ControlMessageError::InvalidPayload(e.to_string()))?;
        let doc = serde_json::json!({
            "type": self.message_type,
            "version": self.version,
            "routerId": self.router_id,
            "messageId": self.message_id,
            "timestamp": self.timestamp,
            "expiry": self.expiry,
            "payload": payload,
        });
        Ok(sha256(canonical_json(&doc).as_bytes()))
    }

    /// Sign with this router's key, stamping `routerId`.
    pub fn sign(&mut self, keys: &Keys) -> Result<(), ControlMessageError> {
        self.router_id = keys.npub();
        let digest = self.signing_digest()?;
        self.sig = Some(encode_sig(keys.sign_digest(digest)));
        Ok(())
    }

    /// Verify the signature under the message's own `routerId`.
    pub fn verify(&self) -> Result<(), ControlMessageError> {
        let sig_b64 = self
            .sig
            .as_ref()
            .ok_or(ControlMessageError::SignatureMissing)?;
        let sig = decode_sig(sig_b64).ok_or(ControlMessageError::SignatureInvalid)?;
        let digest = self.signing_digest()?;
        self.router_id
            .verify_digest(digest, &sig)
            .map_err(|_| ControlMessageError::SignatureInvalid)
    }

    /// Signature plus liveness check used at every inbound surface.
    pub fn verify_live(&self, now: UnixMillis) -> Result<(), ControlMessageError> {
        self.verify()?;
        if self.expiry < now {
            return Err(ControlMessageError::Expired);
        }
        Ok(())
    }
}

pub(crate) fn encode_sig(sig: [u8; 64]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(sig)
}

pub(crate) fn decode_sig(sig: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(sig).ok()
}

/// Untyped control message used at inbound HTTP surfaces before the payload
/// shape is known.
pub type RawControlMessage = RouterControlMessage<Value>;

impl RawControlMessage {
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ControlMessageError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ControlMessageError::InvalidPayload(e.to_string()))
    }
}

/// What a router can do, announced periodically to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapabilityProfile {
    pub job_types: Vec<String>,
    pub models: Vec<String>,
    pub max_privacy_level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Url>,
}

/// Operational state advertised in status announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterOpStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "DEGRADED")]
    Degraded,
    #[serde(rename = "SATURATED")]
    Saturated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterStatusPayload {
    pub status: RouterOpStatus,
    pub active_nodes: u32,
    pub queue_depth: u32,
}

/// Per-job-type pricing a router quotes to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterPriceSheet {
    pub job_type: String,
    pub unit: PriceUnit,
    pub base_price_msat: u64,
    pub surge: f64,
    pub currency: String,
}

/// Request-for-bid: opens a single-round first-price auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterRfbPayload {
    pub job_id: String,
    pub job_type: String,
    /// Hash binding the auction to the job content.
    pub job_hash: String,
    pub max_price_msat: u64,
    pub privacy_level: u8,
    /// Work size in the pricing unit of the job type (e.g. token thousands).
    pub units: f64,
}

/// A peer's offer in response to an RFB.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterBidPayload {
    pub job_id: String,
    /// Echoes the RFB's `jobHash`.
    pub bid_hash: String,
    pub price_msat: u64,
    pub units: f64,
}

/// Award addressed to the winning bidder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterAwardPayload {
    pub job_id: String,
    pub winner_router_id: Npub,
    pub bid_message_id: String,
    pub price_msat: u64,
}

/// A job handed to the winning router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterJobSubmit {
    pub job_id: String,
    pub job_type: String,
    /// Opaque job body, e.g. a client inference envelope.
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price_msat: Option<u64>,
}

/// Result reported back by the executing router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterJobResult {
    pub job_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Signed metering from the worker node that executed the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_receipt: Option<Envelope<MeteringRecord>>,
}

/// Settlement claim presented to the submitting router.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterReceipt {
    pub job_id: String,
    pub worker_node_id: String,
    pub amount_msat: u64,
    /// Signed metering backing the claim.
    pub metering: Envelope<MeteringRecord>,
    /// Filled once the settling client pays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Envelope<PaymentReceipt>>,
}
