//! The router's request pipeline for `/quote`, `/payment-receipt`, and
//! `/infer`.
//!
//! Every inbound envelope walks admit → validate → replay → verify before
//! any routing decision. Priced requests are gated on a live receipt; the
//! forward leg re-signs the request under the router key and validates both
//! nested envelopes of the node's answer. One fallback to the next-best
//! node is allowed for recoverable failures.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::envelope::{Envelope, RawEnvelope, check_replay};
use crate::error::{ApiError, ErrorKind};
use crate::oracle::{InvoiceRequest, VerifyPaymentRequest};
use crate::payments::{LedgerScope, ledger_key, synthesize_request};
use crate::proto::{
    InferenceRequest, InferenceResponse, MeteringRecord, NodeDescriptor, PayeeType,
    PaymentReceipt, PaymentRequest, Price, QuoteRequest, QuoteResponse,
};
use crate::scheduler::{Selection, SelectionMiss, select_node};
use crate::timestamp::UnixMillis;

use super::RouterState;

/// Quote expiry horizon.
pub const QUOTE_TTL_MS: i64 = 60_000;

/// Successful `/infer` body: both node envelopes, validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferOk {
    pub response: Envelope<InferenceResponse>,
    pub metering: Envelope<MeteringRecord>,
}

/// Outcome of the infer pipeline.
pub enum InferOutcome {
    Ok(Box<InferOk>),
    /// Payment challenge the client must settle first.
    PaymentRequired(Box<Envelope<PaymentRequest>>),
}

/// Shared admission prefix: parse, rate-limit, list-check, replay, verify.
pub async fn admit_envelope(
    state: &RouterState,
    bytes: &[u8],
    now: UnixMillis,
) -> Result<RawEnvelope, ApiError> {
    let envelope = RawEnvelope::from_slice(bytes)?;

    let client = envelope.key_id;
    if !state.limiter.allow(&client.to_string(), now) {
        return Err(ApiError::too_many_requests(ErrorKind::CapacityExhausted));
    }
    state.admit_client(&client)?;
    check_replay(&envelope, state.nonces.as_ref(), now).await?;

    // Signature checks hash the whole payload; run them on the blocking
    // pool so large bodies do not stall the event loop.
    let checked = envelope.clone();
    match tokio::task::spawn_blocking(move || checked.verify(&client)).await {
        Ok(result) => result?,
        Err(join_error) => {
            tracing::error!(error = %join_error, "verification worker failed");
            return Err(ApiError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::WorkerError,
            ));
        }
    }
    Ok(envelope)
}

fn selection_miss_error(miss: SelectionMiss) -> ApiError {
    match miss {
        SelectionMiss::NoNodes => ApiError::unavailable(ErrorKind::NoNodesAvailable),
        SelectionMiss::NoCapableNodes => ApiError::unavailable(ErrorKind::NoCapableNodes),
    }
}

/// `/quote`: select a node and sign a price quotation.
pub async fn quote(
    state: &Arc<RouterState>,
    envelope: &RawEnvelope,
    now: UnixMillis,
) -> Result<Envelope<QuoteResponse>, ApiError> {
    let request: QuoteRequest = envelope.payload_as()?;
    let candidates = state.candidates(now);
    let selection =
        select_node(&candidates, &request, None).map_err(selection_miss_error)?;

    let total = priced_total(state, &selection);
    let response = QuoteResponse {
        request_id: request.request_id,
        model_id: selection.capability.model_id.clone(),
        node_id: selection.node.node_id.clone(),
        price: Price {
            total,
            currency: selection.capability.pricing.currency.clone(),
        },
        latency_estimate_ms: selection.capability.latency_estimate_ms,
        expires_at_ms: now + QUOTE_TTL_MS,
    };
    Envelope::signed(response, &state.keys).map_err(|e| {
        tracing::error!(error = %e, "quote signing failed");
        ApiError::internal()
    })
}

/// Node amount plus the router fee when fees are enabled.
fn priced_total(state: &RouterState, selection: &Selection) -> f64 {
    let fee = state
        .fee_policy()
        .fee_for(selection.cost_total.round().max(0.0) as u64);
    selection.cost_total + fee as f64
}

/// `/payment-receipt`: verify and correlate a client receipt.
pub async fn accept_payment_receipt(
    state: &Arc<RouterState>,
    envelope: &RawEnvelope,
) -> Result<String, ApiError> {
    let typed: Envelope<PaymentReceipt> = envelope
        .clone()
        .into_typed()
        .map_err(|_| ApiError::bad_request(ErrorKind::InvalidPaymentReceipt))?;

    if let Some(oracle) = &state.verify_oracle {
        if oracle.require_preimage && typed.payload.preimage.is_none() {
            return Err(ApiError::bad_request(ErrorKind::PreimageRequired));
        }
        if typed.payload.invoice.is_none() && typed.payload.payment_hash.is_none() {
            return Err(ApiError::bad_request(ErrorKind::PaymentProofMissing));
        }
        let verify = VerifyPaymentRequest {
            invoice: typed.payload.invoice.clone(),
            payment_hash: typed.payload.payment_hash.clone(),
            preimage: typed.payload.preimage.clone(),
            amount_sats: typed.payload.amount_sats,
            payee_id: typed.payload.payee_id.clone(),
            request_id: typed.payload.request_id.clone(),
        };
        let outcome = oracle.verify(&verify).await.map_err(|e| {
            ApiError::bad_request(ErrorKind::PaymentVerifyFailed).with_details(e.to_string())
        })?;
        if !outcome.paid {
            return Err(ApiError::bad_request(ErrorKind::NotPaid));
        }
    }

    let key = state
        .ledger
        .accept_receipt(LedgerScope::Client, typed.clone())
        .map_err(|e| ApiError::bad_request(e.kind()).with_details(e.to_string()))?;

    if let Some(store) = &state.store {
        if let Err(e) = store.save_payment_receipt(&key, &typed).await {
            tracing::warn!(error = %e, "receipt persistence failed");
        }
    }
    Ok(key)
}

/// `/infer`: the full pipeline after admission.
pub async fn infer(
    state: &Arc<RouterState>,
    envelope: &RawEnvelope,
    now: UnixMillis,
) -> Result<InferOutcome, ApiError> {
    let request: InferenceRequest = envelope.payload_as()?;
    if request.prompt.is_empty() {
        return Err(ApiError::bad_request(ErrorKind::InvalidEnvelope)
            .with_details("prompt must not be empty"));
    }

    let quote_shape = QuoteRequest {
        request_id: request.request_id.clone(),
        model_id: request.model_id.clone(),
        prompt: request.prompt.clone(),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        top_p: request.top_p,
        job_type: None,
    };
    let candidates = state.candidates(now);
    let selection =
        select_node(&candidates, &quote_shape, None).map_err(selection_miss_error)?;

    // Payment gate: priced work forwards only with a live receipt attached.
    let receipt = if payment_due(state, &selection) {
        match find_or_challenge(state, &request, &selection, now).await? {
            PaymentGate::Receipt(receipt) => Some(receipt),
            PaymentGate::Challenge(challenge) => {
                return Ok(InferOutcome::PaymentRequired(Box::new(challenge)));
            }
        }
    } else {
        None
    };

    match forward(state, &request, &selection, receipt.clone(), now).await {
        Ok(ok) => {
            state.health.record_success(&selection.node.node_id, now);
            Ok(InferOutcome::Ok(Box::new(ok)))
        }
        Err(failure) => {
            state.mark_node_failure(&selection.node.node_id, now);
            if !failure.recoverable {
                return Err(failure.error);
            }
            // One fallback to the next-best active node.
            let remaining: Vec<_> = candidates
                .iter()
                .filter(|c| c.node.node_id != selection.node.node_id)
                .cloned()
                .collect();
            let Ok(second) = select_node(&remaining, &quote_shape, None) else {
                return Err(failure.error);
            };
            tracing::info!(
                failed = %selection.node.node_id,
                fallback = %second.node.node_id,
                "retrying request on fallback node"
            );
            match forward(state, &request, &second, receipt, now).await {
                Ok(ok) => {
                    state.health.record_success(&second.node.node_id, now);
                    Ok(InferOutcome::Ok(Box::new(ok)))
                }
                Err(second_failure) => {
                    state.mark_node_failure(&second.node.node_id, now);
                    Err(second_failure.error)
                }
            }
        }
    }
}

fn payment_due(state: &RouterState, selection: &Selection) -> bool {
    state.config.require_payment && selection.cost_total > 0.0
}

enum PaymentGate {
    Receipt(Envelope<PaymentReceipt>),
    Challenge(Envelope<PaymentRequest>),
}

/// Find the stored receipt for this `(requestId, payeeId)`, or issue (or
/// re-serve) a challenge. Linearizable per ledger key.
async fn find_or_challenge(
    state: &Arc<RouterState>,
    request: &InferenceRequest,
    selection: &Selection,
    now: UnixMillis,
) -> Result<PaymentGate, ApiError> {
    let key = ledger_key(&request.request_id, PayeeType::Node, &selection.node.node_id);
    if let Some(receipt) = state.ledger.receipt(LedgerScope::Client, &key) {
        return Ok(PaymentGate::Receipt(receipt));
    }
    if let Some(live) = state.ledger.live_request(LedgerScope::Client, &key, now) {
        return Ok(PaymentGate::Challenge(live));
    }

    let node_amount = selection.cost_total.round().max(1.0) as u64;
    let splits = state.fee_policy().splits_for(
        &selection.node.node_id,
        &state.router_id().to_string(),
        node_amount,
    );
    let total = priced_total(state, selection);

    let invoice = match &state.invoice_oracle {
        Some(oracle) => {
            let quote = oracle
                .create_invoice(&InvoiceRequest {
                    request_id: request.request_id.clone(),
                    payee_id: selection.node.node_id.clone(),
                    amount_sats: total.round().max(1.0) as u64,
                    splits: splits.clone(),
                })
                .await
                .map_err(|e| {
                    ApiError::bad_gateway(ErrorKind::InvoiceProviderFailed)
                        .with_details(e.to_string())
                })?;
            Some(quote.invoice)
        }
        None => None,
    };

    let payload = synthesize_request(
        &request.request_id,
        PayeeType::Node,
        &selection.node.node_id,
        total,
        invoice,
        splits,
        now,
    );
    let challenge = Envelope::signed(payload, &state.keys).map_err(|e| {
        tracing::error!(error = %e, "challenge signing failed");
        ApiError::internal()
    })?;
    let key = state
        .ledger
        .store_request(LedgerScope::Client, challenge.clone());
    if let Some(store) = &state.store {
        if let Err(e) = store.save_payment_request(&key, &challenge).await {
            tracing::warn!(error = %e, "challenge persistence failed");
        }
    }
    Ok(PaymentGate::Challenge(challenge))
}

struct ForwardFailure {
    error: ApiError,
    /// Transport and signature defects may fall back; semantic node
    /// rejections are final.
    recoverable: bool,
}

impl ForwardFailure {
    fn recoverable(error: ApiError) -> Self {
        ForwardFailure {
            error,
            recoverable: true,
        }
    }

    fn terminal(error: ApiError) -> Self {
        ForwardFailure {
            error,
            recoverable: false,
        }
    }
}

/// Wire shape of the node's 200 body.
#[derive(Debug, Deserialize)]
struct NodeInferBody {
    response: RawEnvelope,
    metering: RawEnvelope,
}

/// Forward to one node and validate its signed answer.
async fn forward(
    state: &Arc<RouterState>,
    request: &InferenceRequest,
    selection: &Selection,
    receipt: Option<Envelope<PaymentReceipt>>,
    now: UnixMillis,
) -> Result<InferOk, ForwardFailure> {
    let node = &selection.node;
    let mut outbound = request.clone();
    if let Some(receipt) = receipt {
        outbound.payment_receipts = Some(vec![receipt]);
    }

    // Fresh envelope under the router key: the node trusts the router, not
    // the original client wrapper.
    let signed = Envelope::signed(outbound, &state.keys).map_err(|e| {
        tracing::error!(error = %e, "forward signing failed");
        ForwardFailure::terminal(ApiError::internal())
    })?;

    let url = node.endpoint.join("infer").map_err(|_| {
        ForwardFailure::terminal(
            ApiError::bad_gateway(ErrorKind::NodeError).with_details("bad node endpoint"),
        )
    })?;
    let response = state
        .http
        .post(url)
        .timeout(Duration::from_millis(state.config.forward_timeout_ms))
        .json(&signed)
        .send()
        .await
        .map_err(|e| {
            ForwardFailure::recoverable(
                ApiError::bad_gateway(ErrorKind::NodeError).with_details(e.to_string()),
            )
        })?;

    let status = response.status();
    if !status.is_success() {
        let details = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or_else(|_| json!({"status": status.as_u16()}));
        let error =
            ApiError::bad_gateway(ErrorKind::NodeError).with_details(details);
        // A semantic rejection from the node will repeat elsewhere; only
        // server-side defects are worth a fallback.
        return Err(if status.is_client_error() {
            ForwardFailure::terminal(error)
        } else {
            ForwardFailure::recoverable(error)
        });
    }

    let body: NodeInferBody = response.json().await.map_err(|e| {
        ForwardFailure::recoverable(
            ApiError::bad_gateway(ErrorKind::InvalidNodeResponse).with_details(e.to_string()),
        )
    })?;

    validate_node_envelopes(node, body, request, now)
}

/// Both nested envelopes must carry the node's key and verify under it.
fn validate_node_envelopes(
    node: &NodeDescriptor,
    body: NodeInferBody,
    request: &InferenceRequest,
    _now: UnixMillis,
) -> Result<InferOk, ForwardFailure> {
    if body.response.key_id != node.key_id {
        return Err(ForwardFailure::recoverable(ApiError::bad_gateway(
            ErrorKind::KeyIdMismatch,
        )));
    }
    if body.response.verify(&node.key_id).is_err() {
        return Err(ForwardFailure::recoverable(ApiError::bad_gateway(
            ErrorKind::NodeResponseSignatureInvalid,
        )));
    }
    let response: Envelope<InferenceResponse> = body.response.into_typed().map_err(|e| {
        ForwardFailure::recoverable(
            ApiError::bad_gateway(ErrorKind::InvalidNodeResponse).with_details(e.to_string()),
        )
    })?;
    if response.payload.request_id != request.request_id {
        return Err(ForwardFailure::recoverable(
            ApiError::bad_gateway(ErrorKind::InvalidNodeResponse)
                .with_details("requestId mismatch"),
        ));
    }

    if body.metering.key_id != node.key_id {
        return Err(ForwardFailure::recoverable(ApiError::bad_gateway(
            ErrorKind::KeyIdMismatch,
        )));
    }
    if body.metering.verify(&node.key_id).is_err() {
        return Err(ForwardFailure::recoverable(ApiError::bad_gateway(
            ErrorKind::NodeMeteringSignatureInvalid,
        )));
    }
    let metering: Envelope<MeteringRecord> = body.metering.into_typed().map_err(|e| {
        ForwardFailure::recoverable(
            ApiError::bad_gateway(ErrorKind::InvalidMetering).with_details(e.to_string()),
        )
    })?;
    if metering.payload.request_id != request.request_id {
        return Err(ForwardFailure::recoverable(
            ApiError::bad_gateway(ErrorKind::InvalidMetering).with_details("requestId mismatch"),
        ));
    }

    Ok(InferOk { response, metering })
}
