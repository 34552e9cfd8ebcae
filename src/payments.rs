//! The payment ledger: challenges, receipts, fees, and reconciliation.
//!
//! Challenges and receipts are correlated by the ledger key
//! `requestId|payeeType|payeeId`. Client-facing and cross-router
//! (federation) settlements use separate maps with identical semantics.

use dashmap::DashMap;
use serde_json::json;

use crate::envelope::Envelope;
use crate::error::ErrorKind;
use crate::proto::{PayeeType, PaymentReceipt, PaymentRequest, PaymentSplit};
use crate::timestamp::UnixMillis;

/// Lifetime of an issued payment challenge.
pub const PAYMENT_REQUEST_TTL_MS: i64 = 5 * 60 * 1000;

/// Ledger map key for a `(requestId, payeeType, payeeId)` triple.
pub fn ledger_key(request_id: &str, payee_type: PayeeType, payee_id: &str) -> String {
    format!("{request_id}|{payee_type}|{payee_id}")
}

/// Payment acceptance failures, mapped to their wire kinds.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("no outstanding payment request for this receipt")]
    RequestNotFound,
    #[error("receipt amount {got} does not match requested {want}")]
    AmountMismatch { want: u64, got: u64 },
    #[error("receipt amount must be at least 1 sat")]
    AmountInvalid,
    #[error("receipt invoice does not match the issued invoice")]
    InvoiceMismatch,
    #[error("payment request and receipt disagree: {0}")]
    RequestMismatch(String),
    #[error("receipt already consumed for this request")]
    ReceiptAlreadyUsed,
    #[error("preimage required by verification policy")]
    PreimageRequired,
    #[error("payment not settled according to the oracle")]
    NotPaid,
    #[error("payment verification failed: {0}")]
    VerifyFailed(String),
}

impl PaymentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PaymentError::RequestNotFound => ErrorKind::PaymentRequestNotFound,
            PaymentError::AmountMismatch { .. } => ErrorKind::PaymentAmountMismatch,
            PaymentError::AmountInvalid => ErrorKind::PaymentAmountInvalid,
            PaymentError::InvoiceMismatch => ErrorKind::InvoiceMismatch,
            PaymentError::RequestMismatch(_) => ErrorKind::PaymentRequestMismatch,
            PaymentError::ReceiptAlreadyUsed => ErrorKind::PaymentRequestMismatch,
            PaymentError::PreimageRequired => ErrorKind::PreimageRequired,
            PaymentError::NotPaid => ErrorKind::NotPaid,
            PaymentError::VerifyFailed(_) => ErrorKind::PaymentVerifyFailed,
        }
    }
}

/// Which settlement plane a ledger entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerScope {
    Client,
    Federation,
}

impl LedgerScope {
    pub fn label(&self) -> &'static str {
        match self {
            LedgerScope::Client => "client",
            LedgerScope::Federation => "federation",
        }
    }
}

/// In-memory payment ledger, owned by the router process.
#[derive(Debug, Default)]
pub struct PaymentLedger {
    requests: DashMap<String, Envelope<PaymentRequest>>,
    receipts: DashMap<String, Envelope<PaymentReceipt>>,
    federation_requests: DashMap<String, Envelope<PaymentRequest>>,
    federation_receipts: DashMap<String, Envelope<PaymentReceipt>>,
}

impl PaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn requests_of(&self, scope: LedgerScope) -> &DashMap<String, Envelope<PaymentRequest>> {
        match scope {
            LedgerScope::Client => &self.requests,
            LedgerScope::Federation => &self.federation_requests,
        }
    }

    fn receipts_of(&self, scope: LedgerScope) -> &DashMap<String, Envelope<PaymentReceipt>> {
        match scope {
            LedgerScope::Client => &self.receipts,
            LedgerScope::Federation => &self.federation_receipts,
        }
    }

    /// The live (unexpired) challenge under `key`, if any.
    pub fn live_request(
        &self,
        scope: LedgerScope,
        key: &str,
        now: UnixMillis,
    ) -> Option<Envelope<PaymentRequest>> {
        self.requests_of(scope)
            .get(key)
            .filter(|env| env.payload.expires_at_ms > now)
            .map(|env| env.clone())
    }

    /// Store a freshly issued challenge under its ledger key.
    pub fn store_request(&self, scope: LedgerScope, envelope: Envelope<PaymentRequest>) -> String {
        let key = ledger_key(
            &envelope.payload.request_id,
            envelope.payload.payee_type,
            &envelope.payload.payee_id,
        );
        self.requests_of(scope).insert(key.clone(), envelope);
        key
    }

    /// Match a receipt against its challenge and record it.
    ///
    /// The caller has already validated the receipt envelope and signature;
    /// this checks ledger semantics: an outstanding request must exist, the
    /// amounts must agree, invoices must agree when both sides carry one,
    /// and a key settles at most once.
    pub fn accept_receipt(
        &self,
        scope: LedgerScope,
        envelope: Envelope<PaymentReceipt>,
    ) -> Result<String, PaymentError> {
        let receipt = &envelope.payload;
        if receipt.amount_sats == 0 {
            return Err(PaymentError::AmountInvalid);
        }
        let key = ledger_key(&receipt.request_id, receipt.payee_type, &receipt.payee_id);

        let request = self
            .requests_of(scope)
            .get(&key)
            .ok_or(PaymentError::RequestNotFound)?;
        if request.payload.amount_sats != receipt.amount_sats {
            return Err(PaymentError::AmountMismatch {
                want: request.payload.amount_sats,
                got: receipt.amount_sats,
            });
        }
        if let Some(receipt_invoice) = &receipt.invoice {
            if !request.payload.invoice.is_empty() && receipt_invoice != &request.payload.invoice {
                return Err(PaymentError::InvoiceMismatch);
            }
        }
        drop(request);

        if self.receipts_of(scope).contains_key(&key) {
            return Err(PaymentError::ReceiptAlreadyUsed);
        }
        self.receipts_of(scope).insert(key.clone(), envelope);
        Ok(key)
    }

    /// The stored receipt under `key`, if one was accepted.
    pub fn receipt(&self, scope: LedgerScope, key: &str) -> Option<Envelope<PaymentReceipt>> {
        self.receipts_of(scope).get(key).map(|env| env.clone())
    }

    /// Challenges that expired without a matching receipt, past `grace_ms`.
    pub fn divergent_requests(
        &self,
        scope: LedgerScope,
        now: UnixMillis,
        grace_ms: i64,
    ) -> Vec<String> {
        self.requests_of(scope)
            .iter()
            .filter(|entry| now - entry.value().payload.expires_at_ms > grace_ms)
            .filter(|entry| !self.receipts_of(scope).contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Retention sweep for both planes.
    pub fn prune(&self, now: UnixMillis, request_retention_ms: i64, receipt_retention_ms: i64) {
        for requests in [&self.requests, &self.federation_requests] {
            requests.retain(|_, env| now - env.payload.expires_at_ms < request_retention_ms);
        }
        for receipts in [&self.receipts, &self.federation_receipts] {
            receipts.retain(|_, env| now - env.payload.paid_at_ms < receipt_retention_ms);
        }
    }

    pub fn outstanding(&self, scope: LedgerScope) -> usize {
        self.requests_of(scope).len()
    }
}

/// Router fee policy applied when splits are enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterFeePolicy {
    pub enabled: bool,
    pub bps: u32,
    pub flat_sats: u64,
    pub min_sats: u64,
    pub max_sats: Option<u64>,
    pub split_enabled: bool,
}

impl RouterFeePolicy {
    /// Fee the router takes on top of a node amount, clamped to the
    /// configured bounds. Zero when disabled.
    pub fn fee_for(&self, node_amount_sats: u64) -> u64 {
        if !self.enabled {
            return 0;
        }
        let proportional = node_amount_sats * self.bps as u64 / 10_000;
        let fee = (proportional + self.flat_sats).max(self.min_sats);
        match self.max_sats {
            Some(max) => fee.min(max),
            None => fee,
        }
    }

    /// The split legs for a priced request, or `None` when splitting is off.
    pub fn splits_for(
        &self,
        node_id: &str,
        router_id: &str,
        node_amount_sats: u64,
    ) -> Option<Vec<PaymentSplit>> {
        if !self.enabled || !self.split_enabled {
            return None;
        }
        let fee = self.fee_for(node_amount_sats);
        Some(vec![
            PaymentSplit {
                payee_type: PayeeType::Node,
                payee_id: node_id.to_owned(),
                amount_sats: node_amount_sats,
                role: "worker".to_owned(),
            },
            PaymentSplit {
                payee_type: PayeeType::Router,
                payee_id: router_id.to_owned(),
                amount_sats: fee,
                role: "router-fee".to_owned(),
            },
        ])
    }
}

/// Compare split sets ignoring declaration order.
///
/// Enforcement sorts the `(payeeType, payeeId, amountSats, role)` tuples on
/// both sides and requires equality.
pub fn splits_match(expected: &[PaymentSplit], actual: &[PaymentSplit]) -> bool {
    fn sorted(splits: &[PaymentSplit]) -> Vec<(String, String, u64, String)> {
        let mut tuples: Vec<_> = splits
            .iter()
            .map(|s| {
                (
                    s.payee_type.to_string(),
                    s.payee_id.clone(),
                    s.amount_sats,
                    s.role.clone(),
                )
            })
            .collect();
        tuples.sort();
        tuples
    }
    sorted(expected) == sorted(actual)
}

/// Synthesize a new challenge payload for a priced request.
pub fn synthesize_request(
    request_id: &str,
    payee_type: PayeeType,
    payee_id: &str,
    cost_total: f64,
    invoice: Option<String>,
    splits: Option<Vec<PaymentSplit>>,
    now: UnixMillis,
) -> PaymentRequest {
    let amount_sats = (cost_total.round() as i64).max(1) as u64;
    let invoice = invoice
        .unwrap_or_else(|| format!("placeholder:{request_id}:{payee_id}:{amount_sats}"));
    PaymentRequest {
        request_id: request_id.to_owned(),
        payee_type,
        payee_id: payee_id.to_owned(),
        amount_sats,
        invoice,
        expires_at_ms: now + PAYMENT_REQUEST_TTL_MS,
        metadata: Some(json!({"issuedAtMs": now})),
        splits,
    }
}
