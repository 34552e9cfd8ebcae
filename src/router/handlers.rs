//! HTTP endpoints implemented by the router.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

use crate::envelope::{RawEnvelope, check_replay};
use crate::error::{ApiError, ErrorKind};
use crate::proto::{ManifestAdmission, NodeDescriptor, NodeManifest, StakeEntry};
use crate::timestamp::UnixMillis;
use crate::trust::manifest_score;

use super::RouterState;
use super::pipeline::{self, InferOutcome};

pub fn routes(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/nodes", get(get_nodes))
        .route("/register-node", post(post_register_node))
        .route("/manifest", post(post_manifest))
        .route("/stake/commit", post(post_stake_commit))
        .route("/stake/slash", post(post_stake_slash))
        .route("/quote", post(post_quote))
        .route("/payment-receipt", post(post_payment_receipt))
        .route("/infer", post(post_infer))
        .merge(crate::federation::handlers::routes())
        .with_state(state)
}

fn finish(state: &RouterState, route: &str, started: Instant, response: Response) -> Response {
    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    state
        .metrics
        .observe_request(route, response.status().as_u16(), elapsed_ms);
    response
}

#[instrument(skip_all)]
async fn get_health() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

#[instrument(skip_all)]
async fn get_metrics(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    state.metrics.render()
}

#[instrument(skip_all)]
async fn get_nodes(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let now = UnixMillis::now();
    let nodes = state.registry.all();
    let active = state
        .registry
        .active(now, |node_id| state.health.in_cooldown(node_id, now));
    Json(json!({"nodes": nodes, "active": active}))
}

/// `POST /register-node`: a node's signed heartbeat.
#[instrument(skip_all)]
async fn post_register_node(
    State(state): State<Arc<RouterState>>,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let now = UnixMillis::now();
    let response = register_node(&state, &body, now)
        .await
        .map(|descriptor| {
            Json(json!({"ok": true, "nodeId": descriptor.node_id})).into_response()
        })
        .unwrap_or_else(IntoResponse::into_response);
    finish(&state, "/register-node", started, response)
}

async fn register_node(
    state: &Arc<RouterState>,
    body: &[u8],
    now: UnixMillis,
) -> Result<NodeDescriptor, ApiError> {
    let envelope = RawEnvelope::from_slice(body)?;
    let descriptor: NodeDescriptor = envelope.payload_as()?;
    if descriptor.key_id != envelope.key_id {
        return Err(ApiError::bad_request(ErrorKind::KeyIdMismatch));
    }
    check_replay(&envelope, state.nonces.as_ref(), now).await?;
    envelope.verify(&envelope.key_id)?;
    state.admit_node_key(&envelope.key_id)?;

    state.registry.upsert(descriptor.clone(), now);
    state.candidate_cache.invalidate();
    if let Some(store) = &state.store {
        let mut stored = descriptor.clone();
        stored.last_heartbeat_ms = Some(now);
        if let Err(e) = store.save_node(&stored).await {
            tracing::warn!(error = %e, "node persistence failed");
        }
    }
    Ok(descriptor)
}

/// `POST /manifest`: a node's self-signed capability manifest.
#[instrument(skip_all)]
async fn post_manifest(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let started = Instant::now();
    let now = UnixMillis::now();
    let response = accept_manifest(&state, &body, now)
        .await
        .map(|admission| Json(json!({"admission": admission})).into_response())
        .unwrap_or_else(IntoResponse::into_response);
    finish(&state, "/manifest", started, response)
}

async fn accept_manifest(
    state: &Arc<RouterState>,
    body: &[u8],
    now: UnixMillis,
) -> Result<ManifestAdmission, ApiError> {
    let envelope = RawEnvelope::from_slice(body)?;
    let manifest: NodeManifest = envelope.payload_as()?;
    if manifest.key_id != envelope.key_id {
        return Err(ApiError::bad_request(ErrorKind::KeyIdMismatch));
    }
    check_replay(&envelope, state.nonces.as_ref(), now).await?;
    envelope.verify(&envelope.key_id)?;
    state.admit_node_key(&envelope.key_id)?;

    let policy = &state.config.relay_admission;
    let score = manifest_score(&manifest);
    let mut admitted = true;
    let mut reason = None;

    if policy.require_snapshot {
        match manifest.snapshot_ts {
            None => {
                admitted = false;
                reason = Some("snapshot-missing".to_owned());
            }
            Some(ts) if now - ts > policy.max_age_ms => {
                admitted = false;
                reason = Some("snapshot-stale".to_owned());
            }
            Some(_) => {}
        }
    }
    if admitted {
        if let Some(min_score) = policy.min_score {
            if score < min_score {
                admitted = false;
                reason = Some("score-below-minimum".to_owned());
            }
        }
    }
    if admitted {
        if let Some(max_results) = policy.max_results {
            let admitted_count = state
                .manifest_admissions
                .iter()
                .filter(|entry| entry.value().admitted)
                .count();
            let already_admitted = state
                .manifest_admissions
                .get(&manifest.node_id)
                .is_some_and(|a| a.admitted);
            if !already_admitted && admitted_count >= max_results {
                admitted = false;
                reason = Some("admission-capacity".to_owned());
            }
        }
    }

    let admission = ManifestAdmission {
        node_id: manifest.node_id.clone(),
        admitted,
        score,
        reason,
        ts: now,
    };

    let typed = envelope
        .into_typed::<NodeManifest>()
        .map_err(|e| ApiError::bad_request(ErrorKind::InvalidEnvelope).with_details(e.to_string()))?;
    if admitted {
        state.manifests.insert(manifest.node_id.clone(), typed.clone());
        state.candidate_cache.invalidate();
    }
    state
        .manifest_admissions
        .insert(manifest.node_id.clone(), admission.clone());

    if let Some(store) = &state.store {
        if admitted {
            if let Err(e) = store.save_manifest(&typed).await {
                tracing::warn!(error = %e, "manifest persistence failed");
            }
        }
        if let Err(e) = store.save_manifest_admission(&admission).await {
            tracing::warn!(error = %e, "admission persistence failed");
        }
    }
    Ok(admission)
}

/// `POST /stake/commit`: a node commits stake units.
#[instrument(skip_all)]
async fn post_stake_commit(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let started = Instant::now();
    let now = UnixMillis::now();
    let response = stake_commit(&state, &body, now)
        .await
        .map(|(node_id, total)| {
            Json(json!({"ok": true, "nodeId": node_id, "committedUnits": total})).into_response()
        })
        .unwrap_or_else(IntoResponse::into_response);
    finish(&state, "/stake/commit", started, response)
}

async fn stake_commit(
    state: &Arc<RouterState>,
    body: &[u8],
    now: UnixMillis,
) -> Result<(String, u64), ApiError> {
    let envelope = RawEnvelope::from_slice(body)?;
    let entry: StakeEntry = envelope.payload_as()?;
    check_replay(&envelope, state.nonces.as_ref(), now).await?;
    envelope.verify(&envelope.key_id)?;

    // Stake binds to a registered node's identity.
    if let Some(node) = state.registry.get(&entry.node_id) {
        if node.key_id != envelope.key_id {
            return Err(ApiError::unauthorized(ErrorKind::ActorKeyMismatch));
        }
    }

    let mut committed = state.stake.entry(entry.node_id.clone()).or_insert(0);
    *committed += entry.units;
    let total = *committed;
    drop(committed);
    state.candidate_cache.invalidate();
    Ok((entry.node_id, total))
}

/// `POST /stake/slash`: the router operator voids stake. Router-key signed.
#[instrument(skip_all)]
async fn post_stake_slash(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let started = Instant::now();
    let now = UnixMillis::now();
    let response = stake_slash(&state, &body, now)
        .await
        .map(|(node_id, total)| {
            Json(json!({"ok": true, "nodeId": node_id, "committedUnits": total})).into_response()
        })
        .unwrap_or_else(IntoResponse::into_response);
    finish(&state, "/stake/slash", started, response)
}

async fn stake_slash(
    state: &Arc<RouterState>,
    body: &[u8],
    now: UnixMillis,
) -> Result<(String, u64), ApiError> {
    let envelope = RawEnvelope::from_slice(body)?;
    let entry: StakeEntry = envelope.payload_as()?;
    if envelope.key_id != state.router_id() {
        return Err(ApiError::forbidden(ErrorKind::ActorKeyMismatch));
    }
    check_replay(&envelope, state.nonces.as_ref(), now).await?;
    envelope.verify(&state.router_id())?;

    let mut committed = state.stake.entry(entry.node_id.clone()).or_insert(0);
    *committed = committed.saturating_sub(entry.units);
    let total = *committed;
    drop(committed);
    state.candidate_cache.invalidate();
    Ok((entry.node_id, total))
}

/// `POST /quote`: signed price quotation for a request.
#[instrument(skip_all)]
async fn post_quote(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let started = Instant::now();
    let now = UnixMillis::now();
    let response = match pipeline::admit_envelope(&state, &body, now).await {
        Ok(envelope) => match pipeline::quote(&state, &envelope, now).await {
            Ok(quote) => Json(json!({"quote": quote})).into_response(),
            Err(e) => e.into_response(),
        },
        Err(e) => e.into_response(),
    };
    finish(&state, "/quote", started, response)
}

/// `POST /payment-receipt`: store a receipt for an outstanding challenge.
#[instrument(skip_all)]
async fn post_payment_receipt(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let started = Instant::now();
    let now = UnixMillis::now();
    let response = match pipeline::admit_envelope(&state, &body, now).await {
        Ok(envelope) => match pipeline::accept_payment_receipt(&state, &envelope).await {
            Ok(key) => Json(json!({"ok": true, "key": key})).into_response(),
            Err(e) => e.into_response(),
        },
        Err(e) => e.into_response(),
    };
    finish(&state, "/payment-receipt", started, response)
}

/// `POST /infer`: admit, select, gate on payment, forward, validate.
#[instrument(skip_all)]
async fn post_infer(State(state): State<Arc<RouterState>>, body: Bytes) -> Response {
    let started = Instant::now();
    let now = UnixMillis::now();
    let response = match pipeline::admit_envelope(&state, &body, now).await {
        Ok(envelope) => match pipeline::infer(&state, &envelope, now).await {
            Ok(InferOutcome::Ok(ok)) => Json(json!({
                "response": ok.response,
                "metering": ok.metering,
            }))
            .into_response(),
            Ok(InferOutcome::PaymentRequired(challenge)) => (
                StatusCode::PAYMENT_REQUIRED,
                Json(json!({
                    "error": ErrorKind::PaymentRequired,
                    "payment": challenge,
                })),
            )
                .into_response(),
            Err(e) => e.into_response(),
        },
        Err(e) => e.into_response(),
    };
    finish(&state, "/infer", started, response)
}
