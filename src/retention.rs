//! Background retention and reconciliation for the router.
//!
//! One periodic task prunes every bounded map on its configured horizon,
//! sweeps the nonce store, and raises divergence counters for payment
//! challenges that expired without a receipt.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::envelope::REPLAY_WINDOW_MS;
use crate::payments::LedgerScope;
use crate::router::RouterState;
use crate::store::StoreRetention;
use crate::timestamp::UnixMillis;

/// Cadence of the retention sweep.
pub const RETENTION_INTERVAL: Duration = Duration::from_secs(30);

/// Flag expired challenges that never saw a receipt, once per key.
pub fn reconcile_payments(
    state: &RouterState,
    now: UnixMillis,
    already_flagged: &mut HashSet<String>,
) {
    let grace = state.config.payment_reconcile_grace_ms;
    for scope in [LedgerScope::Client, LedgerScope::Federation] {
        for key in state.ledger.divergent_requests(scope, now, grace) {
            if !already_flagged.insert(format!("{}:{key}", scope.label())) {
                continue;
            }
            state
                .metrics
                .payment_divergence
                .with_label_values(&[scope.label(), "missing-receipt"])
                .inc();
            tracing::warn!(
                scope = scope.label(),
                key = %key,
                reason = "missing-receipt",
                "payment challenge expired without a receipt"
            );
        }
    }
}

/// One sweep over every retained map.
pub async fn sweep(state: &RouterState, now: UnixMillis, flagged: &mut HashSet<String>) {
    let config = &state.config;

    state.nonces.cleanup(now - REPLAY_WINDOW_MS).await;
    state.registry.prune(now - config.node_retention_ms);
    state.health.prune(
        now,
        config.node_health_retention_ms,
        config.node_cooldown_retention_ms,
    );
    reconcile_payments(state, now, flagged);
    state.ledger.prune(
        now,
        config.payment_request_retention_ms,
        config.payment_receipt_retention_ms,
    );
    state
        .federation
        .prune(now, config.federation_job_retention_ms);
    state.limiter.prune(now);

    if let Some(store) = &state.store {
        let retention = StoreRetention {
            node_cutoff: now - config.node_retention_ms,
            payment_request_cutoff: now - config.payment_request_retention_ms,
            payment_receipt_cutoff: now - config.payment_receipt_retention_ms,
        };
        if let Err(e) = store.apply_retention(retention).await {
            tracing::warn!(error = %e, "store retention failed");
        }
    }
}

/// Spawn the periodic retention task.
pub fn spawn_retention_loop(state: Arc<RouterState>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
        let mut flagged: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            sweep(&state, UnixMillis::now(), &mut flagged).await;
        }
    });
}
