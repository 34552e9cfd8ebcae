//! Federation HTTP surface mounted under `/federation`.
//!
//! Inbound control messages are rate limited per `(peerId, type)`, verified
//! against the sender's own router id, and recorded in the peer view. The
//! RFB endpoint answers with this router's bid; the settlement endpoints
//! walk the federation job state machine.

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;

use crate::envelope::Envelope;
use crate::error::{ApiError, ErrorKind};
use crate::payments::{LedgerScope, synthesize_request};
use crate::proto::{PayeeType, PaymentReceipt};
use crate::router::RouterState;
use crate::timestamp::UnixMillis;

use super::auction::build_bid;
use super::jobs::{FederationJob, FederationJobState};
use super::messages::{
    ControlMessageType, RawControlMessage, RouterAwardPayload, RouterCapabilityProfile,
    RouterJobResult, RouterJobSubmit, RouterPriceSheet, RouterReceipt, RouterRfbPayload,
    RouterStatusPayload,
};

pub fn routes() -> Router<Arc<RouterState>> {
    Router::new()
        .route("/federation/caps", post(post_caps))
        .route("/federation/status", post(post_status))
        .route("/federation/price", post(post_price))
        .route("/federation/rfb", post(post_rfb))
        .route("/federation/award", post(post_award))
        .route("/federation/job-submit", post(post_job_submit))
        .route("/federation/job-result", post(post_job_result))
        .route("/federation/payment-request", post(post_payment_request))
        .route("/federation/payment-receipt", post(post_payment_receipt))
        .route("/federation/self/caps", get(get_self_caps))
        .route("/federation/self/status", get(get_self_status))
        .route("/federation/self/price", get(get_self_price))
}

/// Parse, rate-limit, and verify one inbound control message.
fn admit_message(
    state: &RouterState,
    body: &[u8],
    expected: ControlMessageType,
    now: UnixMillis,
) -> Result<RawControlMessage, ApiError> {
    if !state.config.federation.enabled {
        return Err(ApiError::forbidden(ErrorKind::FederationDisabled));
    }
    if body.is_empty() {
        return Err(ApiError::bad_request(ErrorKind::EmptyBody));
    }
    let message: RawControlMessage = serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request(ErrorKind::InvalidEnvelope).with_details(e.to_string()))?;
    if message.message_type != expected {
        return Err(ApiError::bad_request(ErrorKind::InvalidEnvelope)
            .with_details(format!("expected {} message", expected.as_str())));
    }

    let peer_id = message.router_id.to_string();
    if !state
        .federation
        .admit_message(&peer_id, message.message_type, now)
    {
        state
            .metrics
            .federation_messages
            .with_label_values(&[expected.as_str(), "rate-limited"])
            .inc();
        return Err(ApiError::too_many_requests(ErrorKind::CapacityExhausted));
    }

    message.verify_live(now).map_err(|e| {
        state
            .metrics
            .federation_messages
            .with_label_values(&[expected.as_str(), "rejected"])
            .inc();
        ApiError::unauthorized(ErrorKind::InvalidSignature).with_details(e.to_string())
    })?;

    state
        .metrics
        .federation_messages
        .with_label_values(&[expected.as_str(), "accepted"])
        .inc();
    Ok(message)
}

#[instrument(skip_all)]
async fn post_caps(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let now = UnixMillis::now();
    match admit_message(&state, &body, ControlMessageType::CapsAnnounce, now) {
        Ok(message) => match retype::<RouterCapabilityProfile>(&message) {
            Ok(typed) => {
                state.federation.record_capabilities(typed);
                Json(json!({"ok": true})).into_response()
            }
            Err(e) => e.into_response(),
        },
        Err(e) => e.into_response(),
    }
}

#[instrument(skip_all)]
async fn post_status(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let now = UnixMillis::now();
    match admit_message(&state, &body, ControlMessageType::StatusAnnounce, now) {
        Ok(message) => match retype::<RouterStatusPayload>(&message) {
            Ok(typed) => {
                state.federation.record_status(typed);
                Json(json!({"ok": true})).into_response()
            }
            Err(e) => e.into_response(),
        },
        Err(e) => e.into_response(),
    }
}

#[instrument(skip_all)]
async fn post_price(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let now = UnixMillis::now();
    match admit_message(&state, &body, ControlMessageType::PriceAnnounce, now) {
        Ok(message) => match retype::<RouterPriceSheet>(&message) {
            Ok(typed) => {
                state.federation.record_price_sheet(typed);
                Json(json!({"ok": true})).into_response()
            }
            Err(e) => e.into_response(),
        },
        Err(e) => e.into_response(),
    }
}

/// Rebuild a typed control message from a raw one, keeping the signature.
fn retype<T: serde::de::DeserializeOwned>(
    message: &RawControlMessage,
) -> Result<super::messages::RouterControlMessage<T>, ApiError> {
    let payload: T = message
        .payload_as()
        .map_err(|e| ApiError::bad_request(ErrorKind::InvalidEnvelope).with_details(e.to_string()))?;
    Ok(super::messages::RouterControlMessage {
        message_type: message.message_type,
        version: message.version,
        router_id: message.router_id,
        message_id: message.message_id.clone(),
        timestamp: message.timestamp,
        expiry: message.expiry,
        payload,
        sig: message.sig.clone(),
    })
}

/// `POST /federation/rfb`: answer with this router's bid, or decline.
#[instrument(skip_all)]
async fn post_rfb(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let now = UnixMillis::now();
    let message = match admit_message(&state, &body, ControlMessageType::Rfb, now) {
        Ok(message) => message,
        Err(e) => return e.into_response(),
    };
    let rfb: RouterRfbPayload = match message.payload_as() {
        Ok(rfb) => rfb,
        Err(e) => {
            return ApiError::bad_request(ErrorKind::InvalidEnvelope)
                .with_details(e.to_string())
                .into_response();
        }
    };

    // Keep the local view fresh before pricing the job.
    state.refresh_federation_self().await;
    match build_bid(&state.federation, &state.keys, &rfb).await {
        Ok(bid) => Json(bid).into_response(),
        Err(rejection) => ApiError::bad_request(ErrorKind::BidRejected)
            .with_details(rejection.to_string())
            .into_response(),
    }
}

/// `POST /federation/award`: an auction we bid in resolved in our favor.
#[instrument(skip_all)]
async fn post_award(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let now = UnixMillis::now();
    let message = match admit_message(&state, &body, ControlMessageType::Award, now) {
        Ok(message) => message,
        Err(e) => return e.into_response(),
    };
    let typed = match retype::<RouterAwardPayload>(&message) {
        Ok(typed) => typed,
        Err(e) => return e.into_response(),
    };
    if typed.payload.winner_router_id != state.router_id() {
        return ApiError::forbidden(ErrorKind::ActorKeyMismatch)
            .with_details("award addressed to another router")
            .into_response();
    }
    state
        .federation
        .awards
        .insert(typed.payload.job_id.clone(), typed);
    Json(json!({"ok": true})).into_response()
}

/// `POST /federation/job-submit`: accept a job we won.
#[instrument(skip_all)]
async fn post_job_submit(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let now = UnixMillis::now();
    let message = match admit_message(&state, &body, ControlMessageType::JobSubmit, now) {
        Ok(message) => message,
        Err(e) => return e.into_response(),
    };
    let submit: RouterJobSubmit = match message.payload_as() {
        Ok(submit) => submit,
        Err(e) => {
            return ApiError::bad_request(ErrorKind::InvalidEnvelope)
                .with_details(e.to_string())
                .into_response();
        }
    };

    let job = FederationJob::submitted(
        submit.job_id.clone(),
        message.router_id.to_string(),
        submit.job_type.clone(),
        now,
    );
    state.federation.jobs.insert(submit.job_id.clone(), job);
    Json(json!({"ok": true, "jobId": submit.job_id})).into_response()
}

/// `POST /federation/job-result`: the executing router reports back.
#[instrument(skip_all)]
async fn post_job_result(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let now = UnixMillis::now();
    let message = match admit_message(&state, &body, ControlMessageType::JobResult, now) {
        Ok(message) => message,
        Err(e) => return e.into_response(),
    };
    let result: RouterJobResult = match message.payload_as() {
        Ok(result) => result,
        Err(e) => {
            return ApiError::bad_request(ErrorKind::InvalidEnvelope)
                .with_details(e.to_string())
                .into_response();
        }
    };

    // The worker receipt, when present, must be a valid self-signed record.
    if let Some(worker_receipt) = &result.worker_receipt {
        if worker_receipt.verify_self().is_err() {
            return ApiError::unauthorized(ErrorKind::NodeMeteringSignatureInvalid)
                .into_response();
        }
    }

    let Some(mut job) = state.federation.jobs.get_mut(&result.job_id) else {
        return ApiError::bad_request(ErrorKind::UnknownJob).into_response();
    };
    let next = if result.ok {
        FederationJobState::Resulted
    } else {
        FederationJobState::Failed
    };
    if let Err(current) = job.transition(next, now) {
        return ApiError::bad_request(ErrorKind::InvalidJobTransition)
            .with_details(format!("job in state {current:?}"))
            .into_response();
    }
    job.result = Some(result.clone());
    drop(job);
    Json(json!({"ok": true, "jobId": result.job_id})).into_response()
}

/// `POST /federation/payment-request`: turn a worker receipt into a signed
/// settlement challenge bound to the job.
#[instrument(skip_all)]
async fn post_payment_request(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let now = UnixMillis::now();
    let message = match admit_message(&state, &body, ControlMessageType::Receipt, now) {
        Ok(message) => message,
        Err(e) => return e.into_response(),
    };
    let receipt: RouterReceipt = match message.payload_as() {
        Ok(receipt) => receipt,
        Err(e) => {
            return ApiError::bad_request(ErrorKind::InvalidEnvelope)
                .with_details(e.to_string())
                .into_response();
        }
    };
    if receipt.metering.verify_self().is_err() {
        return ApiError::unauthorized(ErrorKind::NodeMeteringSignatureInvalid).into_response();
    }

    let Some(mut job) = state.federation.jobs.get_mut(&receipt.job_id) else {
        return ApiError::bad_request(ErrorKind::UnknownJob).into_response();
    };
    if let Err(current) = job.transition(FederationJobState::PaymentRequested, now) {
        return ApiError::bad_request(ErrorKind::InvalidJobTransition)
            .with_details(format!("job in state {current:?}"))
            .into_response();
    }

    let amount_sats = (receipt.amount_msat as f64 / 1_000.0).ceil().max(1.0);
    let payload = synthesize_request(
        &receipt.job_id,
        PayeeType::Router,
        &message.router_id.to_string(),
        amount_sats,
        None,
        None,
        now,
    );
    let challenge = match Envelope::signed(payload, &state.keys) {
        Ok(challenge) => challenge,
        Err(e) => {
            tracing::error!(error = %e, "federation challenge signing failed");
            return ApiError::internal().into_response();
        }
    };
    let key = state
        .ledger
        .store_request(LedgerScope::Federation, challenge.clone());
    job.payment_key = Some(key);
    drop(job);
    Json(json!({"payment": challenge})).into_response()
}

/// `POST /federation/payment-receipt`: the settling side posts the paid
/// receipt; the job settles.
#[instrument(skip_all)]
async fn post_payment_receipt(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let now = UnixMillis::now();
    if !state.config.federation.enabled {
        return ApiError::forbidden(ErrorKind::FederationDisabled).into_response();
    }
    let envelope = match crate::envelope::RawEnvelope::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => return ApiError::from(e).into_response(),
    };
    if let Err(e) = envelope.verify(&envelope.key_id) {
        return ApiError::from(e).into_response();
    }
    let typed: Envelope<PaymentReceipt> = match envelope.into_typed() {
        Ok(typed) => typed,
        Err(_) => {
            return ApiError::bad_request(ErrorKind::InvalidPaymentReceipt).into_response();
        }
    };
    let job_id = typed.payload.request_id.clone();

    if let Err(e) = state.ledger.accept_receipt(LedgerScope::Federation, typed) {
        return ApiError::bad_request(e.kind())
            .with_details(e.to_string())
            .into_response();
    }

    if let Some(mut job) = state.federation.jobs.get_mut(&job_id) {
        if let Err(current) = job.transition(FederationJobState::Settled, now) {
            return ApiError::bad_request(ErrorKind::InvalidJobTransition)
                .with_details(format!("job in state {current:?}"))
                .into_response();
        }
    }
    Json(json!({"ok": true, "jobId": job_id})).into_response()
}

#[instrument(skip_all)]
async fn get_self_caps(State(state): State<Arc<RouterState>>) -> Response {
    state.refresh_federation_self().await;
    match state.federation.local_capabilities.read().await.clone() {
        Some(caps) => Json(caps).into_response(),
        None => ApiError::internal().into_response(),
    }
}

#[instrument(skip_all)]
async fn get_self_status(State(state): State<Arc<RouterState>>) -> Response {
    state.refresh_federation_self().await;
    match state.federation.local_status.read().await.clone() {
        Some(status) => Json(status).into_response(),
        None => ApiError::internal().into_response(),
    }
}

#[instrument(skip_all)]
async fn get_self_price(State(state): State<Arc<RouterState>>) -> Response {
    state.refresh_federation_self().await;
    let sheets: Vec<_> = state
        .federation
        .local_price_sheets
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    Json(json!({"priceSheets": sheets})).into_response()
}
