//! HTTP endpoints implemented by the worker node.
//!
//! `/infer` admits requests through an ordered checklist (size, shape,
//! identity, authorization, limits, signature, replay, payment, capacity)
//! where the first failure wins, then races the runner against the
//! configured wall clock and returns the signed response and metering pair.

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::instrument;

use crate::canonical::sha256_hex;
use crate::envelope::{Envelope, RawEnvelope, check_replay};
use crate::error::{ApiError, ErrorKind};
use crate::identity::Npub;
use crate::oracle::VerifyPaymentRequest;
use crate::proto::{InferenceRequest, MeteringRecord, PayeeType, PaymentReceipt};
use crate::timestamp::UnixMillis;

use super::NodeState;

pub fn routes(state: Arc<NodeState>) -> Router {
    // The in-pipeline size check owns the 413; give axum enough headroom
    // that it never fires first.
    let body_limit = state.config.max_request_bytes.saturating_mul(2).max(1024);
    Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .route("/infer", post(post_infer))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

#[instrument(skip_all)]
async fn get_health(State(state): State<Arc<NodeState>>) -> impl IntoResponse {
    let runner = state.runner.health().await;
    Json(json!({"ok": runner.ok, "runner": runner}))
}

#[instrument(skip_all)]
async fn get_status(State(state): State<Arc<NodeState>>) -> impl IntoResponse {
    let models = state.runner.list_models().await;
    Json(json!({
        "nodeId": state.node_id,
        "keyId": state.keys.npub(),
        "models": models,
        "capacity": {
            "maxConcurrent": state.config.capacity_max_concurrent,
            "currentLoad": state.config.capacity_current_load,
        },
        "inFlight": state.in_flight(),
    }))
}

#[instrument(skip_all)]
async fn get_metrics(State(state): State<Arc<NodeState>>) -> impl IntoResponse {
    state.metrics.render()
}

#[instrument(skip_all)]
async fn post_infer(State(state): State<Arc<NodeState>>, body: Bytes) -> Response {
    let started = Instant::now();
    let response = match infer(&state, &body).await {
        Ok(ok) => Json(ok).into_response(),
        Err(e) => e.into_response(),
    };
    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    state
        .metrics
        .observe_request("/infer", response.status().as_u16(), elapsed_ms);
    response
}

async fn infer(state: &Arc<NodeState>, body: &[u8]) -> Result<serde_json::Value, ApiError> {
    let now = UnixMillis::now();
    let config = &state.config;

    // 1. Raw body size.
    if body.len() > config.max_request_bytes {
        return Err(ApiError::payload_too_large(ErrorKind::PayloadTooLarge));
    }

    // 2-4. JSON, envelope shape, key id.
    let envelope = RawEnvelope::from_slice(body)?;
    let request: InferenceRequest = envelope.payload_as()?;

    if !state.limiter.allow(&envelope.key_id.to_string(), now) {
        return Err(ApiError::too_many_requests(ErrorKind::CapacityExhausted));
    }

    // 5. Router authorization lists and pinning.
    admit_router(config, &envelope.key_id)?;

    // 6. Prompt and token limits.
    if request.prompt.len() > config.max_prompt_bytes {
        return Err(ApiError::payload_too_large(ErrorKind::PromptTooLarge));
    }
    if request.max_tokens > config.max_tokens {
        return Err(ApiError::bad_request(ErrorKind::MaxTokensExceeded).with_details(format!(
            "{} > {}",
            request.max_tokens, config.max_tokens
        )));
    }

    // 7-8. The envelope must verify under the configured router key.
    let router_key = config
        .router_public_key
        .or(config.router_key_id)
        .ok_or_else(|| {
            ApiError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::RouterPublicKeyMissing,
            )
        })?;
    envelope
        .verify(&router_key)
        .map_err(|_| ApiError::unauthorized(ErrorKind::InvalidSignature))?;

    // 9. Replay.
    check_replay(&envelope, state.nonces.as_ref(), now).await?;

    // 10. Payment receipt addressed to this node.
    if config.require_payment {
        verify_payment(state, &request, &envelope).await?;
    }

    // 11. Capacity; the guard releases on every exit path below.
    let _slot = state
        .try_acquire_slot()
        .ok_or_else(|| ApiError::too_many_requests(ErrorKind::CapacityExhausted))?;

    // Run, racing the configured wall clock.
    let run_started = Instant::now();
    let result = match config.max_inference_ms {
        Some(limit) => {
            match tokio::time::timeout(Duration::from_millis(limit), state.runner.infer(&request))
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    return Err(ApiError::gateway_timeout(ErrorKind::RunnerTimeout));
                }
            }
        }
        None => state.runner.infer(&request).await,
    };
    let mut response = result.map_err(|e| {
        tracing::warn!(error = %e, request_id = %request.request_id, "runner failed");
        ApiError::internal()
    })?;
    let wall_time_ms = run_started.elapsed().as_millis() as u64;
    response.latency_ms = wall_time_ms.max(response.latency_ms);

    let metering = MeteringRecord {
        request_id: request.request_id.clone(),
        node_id: state.node_id.clone(),
        model_id: response.model_id.clone(),
        prompt_hash: sha256_hex(request.prompt.as_bytes()),
        input_tokens: response.usage.input_tokens,
        output_tokens: response.usage.output_tokens,
        wall_time_ms,
        bytes_in: request.prompt.len() as u64,
        bytes_out: response.output.len() as u64,
        ts: UnixMillis::now(),
    };

    let response_envelope = Envelope::signed(response, &state.keys).map_err(|e| {
        tracing::error!(error = %e, "response signing failed");
        ApiError::internal()
    })?;
    let metering_envelope = Envelope::signed(metering, &state.keys).map_err(|e| {
        tracing::error!(error = %e, "metering signing failed");
        ApiError::internal()
    })?;

    Ok(json!({
        "response": response_envelope,
        "metering": metering_envelope,
    }))
}

/// Check 5: block, mute, follow, allow lists, then router pinning.
fn admit_router(config: &crate::config::NodeConfig, key: &Npub) -> Result<(), ApiError> {
    if config.router_block_list.contains(key) {
        return Err(ApiError::forbidden(ErrorKind::RouterBlocked));
    }
    if config.router_mute_list.contains(key) {
        return Err(ApiError::forbidden(ErrorKind::RouterMuted));
    }
    if !config.router_follow_list.is_empty() && !config.router_follow_list.contains(key) {
        return Err(ApiError::forbidden(ErrorKind::RouterNotFollowed));
    }
    if !config.router_allow_list.is_empty() && !config.router_allow_list.contains(key) {
        return Err(ApiError::forbidden(ErrorKind::RouterNotAllowed));
    }
    if let Some(pinned) = &config.router_key_id {
        if key != pinned {
            return Err(ApiError::unauthorized(ErrorKind::RouterKeyIdMismatch));
        }
    }
    Ok(())
}

/// Check 10: a valid receipt addressed to this node must be attached.
async fn verify_payment(
    state: &Arc<NodeState>,
    request: &InferenceRequest,
    envelope: &RawEnvelope,
) -> Result<(), ApiError> {
    let receipts = request.payment_receipts.as_deref().unwrap_or(&[]);
    let receipt: &Envelope<PaymentReceipt> = receipts
        .iter()
        .find(|r| {
            r.payload.payee_type == PayeeType::Node && r.payload.payee_id == state.node_id
        })
        .ok_or_else(|| {
            ApiError::new(
                axum::http::StatusCode::PAYMENT_REQUIRED,
                ErrorKind::PaymentRequired,
            )
        })?;

    // The receipt signs itself under the paying client's key.
    receipt
        .verify(&receipt.key_id)
        .map_err(|_| ApiError::unauthorized(ErrorKind::InvalidPaymentReceiptSignature))?;
    if receipt.payload.amount_sats < 1 {
        return Err(ApiError::bad_request(ErrorKind::PaymentAmountInvalid));
    }
    let envelope_request_id = envelope
        .payload
        .get("requestId")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if receipt.payload.request_id != envelope_request_id {
        return Err(ApiError::bad_request(ErrorKind::PaymentRequestMismatch));
    }

    if let Some(oracle) = &state.verify_oracle {
        if oracle.require_preimage && receipt.payload.preimage.is_none() {
            return Err(ApiError::bad_request(ErrorKind::PreimageRequired));
        }
        let outcome = oracle
            .verify(&VerifyPaymentRequest {
                invoice: receipt.payload.invoice.clone(),
                payment_hash: receipt.payload.payment_hash.clone(),
                preimage: receipt.payload.preimage.clone(),
                amount_sats: receipt.payload.amount_sats,
                payee_id: receipt.payload.payee_id.clone(),
                request_id: receipt.payload.request_id.clone(),
            })
            .await
            .map_err(|e| {
                ApiError::bad_request(ErrorKind::PaymentVerifyFailed)
                    .with_details(e.to_string())
            })?;
        if !outcome.paid {
            return Err(ApiError::new(
                axum::http::StatusCode::PAYMENT_REQUIRED,
                ErrorKind::NotPaid,
            ));
        }
    }
    Ok(())
}
