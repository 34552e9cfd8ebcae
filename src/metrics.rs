//! Process-local metrics with text exposition for `GET /metrics`.
//!
//! Counters and histograms live in an owned `prometheus::Registry` per
//! service instance, so a router and a node embedded in one test process do
//! not share (or double-register) collectors.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Latency buckets in milliseconds, spanning cache hits to slow model runs.
const LATENCY_BUCKETS_MS: &[f64] = &[
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0,
];

/// Metric handles shared by the request pipelines.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Requests by route and final status code.
    pub http_requests: IntCounterVec,
    /// Request wall time by route and final status code.
    pub http_latency_ms: HistogramVec,
    /// Forwarding failures per node.
    pub node_failures: IntCounterVec,
    /// Payment reconciliation divergences by scope and reason.
    pub payment_divergence: IntCounterVec,
    /// Federation control messages by type and outcome.
    pub federation_messages: IntCounterVec,
}

impl Metrics {
    pub fn new(component: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let labels = |name: &str, help: &str| {
            Opts::new(name, help).const_label("component", component.to_owned())
        };

        let http_requests = IntCounterVec::new(
            labels("infermesh_http_requests_total", "Requests by route and status"),
            &["route", "status"],
        )?;
        let http_latency_ms = HistogramVec::new(
            HistogramOpts::new(
                "infermesh_http_request_duration_ms",
                "Request wall time in milliseconds",
            )
            .const_label("component", component.to_owned())
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["route", "status"],
        )?;
        let node_failures = IntCounterVec::new(
            labels(
                "infermesh_node_failures_total",
                "Forwarding failures per node",
            ),
            &["node_id"],
        )?;
        let payment_divergence = IntCounterVec::new(
            labels(
                "infermesh_payment_divergence_total",
                "Payment reconciliation divergences",
            ),
            &["scope", "reason"],
        )?;
        let federation_messages = IntCounterVec::new(
            labels(
                "infermesh_federation_messages_total",
                "Federation control messages by type and outcome",
            ),
            &["type", "outcome"],
        )?;

        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(http_latency_ms.clone()))?;
        registry.register(Box::new(node_failures.clone()))?;
        registry.register(Box::new(payment_divergence.clone()))?;
        registry.register(Box::new(federation_messages.clone()))?;

        Ok(Metrics {
            registry,
            http_requests,
            http_latency_ms,
            node_failures,
            payment_divergence,
            federation_messages,
        })
    }

    /// Record one finished request.
    pub fn observe_request(&self, route: &str, status: u16, elapsed_ms: f64) {
        let status = status.to_string();
        self.http_requests.with_label_values(&[route, &status]).inc();
        self.http_latency_ms
            .with_label_values(&[route, &status])
            .observe(elapsed_ms);
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&families, &mut buf) {
            tracing::warn!(error = %e, "metrics encoding failed");
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_recorded_series() {
        let metrics = Metrics::new("router").unwrap();
        metrics.observe_request("/infer", 200, 12.0);
        metrics.node_failures.with_label_values(&["node-a"]).inc();

        let text = metrics.render();
        assert!(text.contains("infermesh_http_requests_total"));
        assert!(text.contains("node-a"));
        assert!(text.contains(r#"component="router""#));
    }

    #[test]
    fn separate_instances_do_not_collide() {
        let a = Metrics::new("router").unwrap();
        let b = Metrics::new("node").unwrap();
        a.observe_request("/infer", 200, 1.0);
        assert!(!b.render().contains("/infer"));
    }
}
