//! # Prometheus Metrics
//!
//! Operational metrics for the mirror daemon, scraped at `/metrics` on the
//! configured metrics port. All metrics live in a dedicated
//! [`prometheus::Registry`] so they never collide with a default global
//! registry consumer.
//!
//! The counters are fed from the notification stream — the sync machine
//! itself stays observability-free — and the cursor gauge is refreshed by a
//! small poller task in `main`.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the daemon.
///
/// Clone-friendly (prometheus handles are `Arc` internally) so it can be
/// shared across request handlers and background tasks.
#[derive(Clone)]
pub struct MirrorMetrics {
    /// Registry that owns all metrics below.
    registry: Registry,
    /// Wallet notifications emitted for accepted vertices.
    pub wallet_updates_accepted_total: IntCounter,
    /// Wallet notifications emitted for voided vertices.
    pub wallet_updates_voided_total: IntCounter,
    /// Notifications the consumer task missed because it lagged.
    pub notifications_lagged_total: IntCounter,
    /// The durable cursor — last fully processed upstream event id.
    pub last_event_id: IntGauge,
}

impl MirrorMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("prism".into()), None)
            .expect("failed to create prometheus registry");

        let wallet_updates_accepted_total = IntCounter::new(
            "wallet_updates_accepted_total",
            "Wallet balance updates from accepted vertices",
        )
        .expect("metric creation");
        registry
            .register(Box::new(wallet_updates_accepted_total.clone()))
            .expect("metric registration");

        let wallet_updates_voided_total = IntCounter::new(
            "wallet_updates_voided_total",
            "Wallet balance updates from voided vertices",
        )
        .expect("metric creation");
        registry
            .register(Box::new(wallet_updates_voided_total.clone()))
            .expect("metric registration");

        let notifications_lagged_total = IntCounter::new(
            "notifications_lagged_total",
            "Notifications dropped because the metrics consumer lagged",
        )
        .expect("metric creation");
        registry
            .register(Box::new(notifications_lagged_total.clone()))
            .expect("metric registration");

        let last_event_id = IntGauge::new(
            "last_event_id",
            "Last fully processed upstream event id (durable cursor)",
        )
        .expect("metric creation");
        registry
            .register(Box::new(last_event_id.clone()))
            .expect("metric registration");

        Self {
            registry,
            wallet_updates_accepted_total,
            wallet_updates_voided_total,
            notifications_lagged_total,
            last_event_id,
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition
    /// format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        encoder.encode_to_string(&self.registry.gather())
    }
}

impl Default for MirrorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics handle passed to axum handlers via state.
pub type SharedMetrics = Arc<MirrorMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_encode() {
        let metrics = MirrorMetrics::new();
        metrics.wallet_updates_accepted_total.inc();
        metrics.last_event_id.set(42);

        let body = metrics.encode().expect("encode");
        assert!(body.contains("prism_wallet_updates_accepted_total 1"));
        assert!(body.contains("prism_last_event_id 42"));
    }
}
