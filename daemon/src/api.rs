//! # Status & Read API
//!
//! A small axum router over the mirror. Wallets read balances from the
//! relational mirror in production deployments; this surface is the
//! embedded equivalent, plus the liveness and status endpoints every
//! supervisor wants.
//!
//! ## Endpoints
//!
//! | Method | Path                            | Description                |
//! |--------|---------------------------------|----------------------------|
//! | GET    | `/health`                       | Liveness probe             |
//! | GET    | `/status`                       | Daemon status summary      |
//! | GET    | `/addresses/:address/balances`  | Balance rows of an address |

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use prism_sync::store::{LedgerStore, SledStore, StoreTxn};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone -- everything behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The daemon's reported version string.
    pub version: String,
    /// Network identifier the mirror is configured for.
    pub network: String,
    /// When the daemon started, for uptime reporting.
    pub started_at: DateTime<Utc>,
    /// The embedded mirror store.
    pub store: Arc<SledStore>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the status/read router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/addresses/:address/balances", get(address_balances_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Daemon software version.
    pub version: String,
    /// Network identifier.
    pub network: String,
    /// Durable cursor -- last fully processed upstream event id.
    pub last_event_id: Option<u64>,
    /// Seconds since the daemon started.
    pub uptime_seconds: i64,
    /// ISO-8601 timestamp of the response.
    pub timestamp: String,
}

/// One balance row in the `GET /addresses/:address/balances` response.
#[derive(Debug, Serialize)]
pub struct BalanceEntry {
    pub token: String,
    pub unlocked_balance: i64,
    pub locked_balance: i64,
    pub unlocked_authorities: u8,
    pub locked_authorities: u8,
    pub timelock_expires: Option<i64>,
    pub transactions: u64,
    pub total_received: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let last_event_id = match read_cursor(&state.store) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let now = Utc::now();
    Json(StatusResponse {
        version: state.version.clone(),
        network: state.network.clone(),
        last_event_id,
        uptime_seconds: (now - state.started_at).num_seconds(),
        timestamp: now.to_rfc3339(),
    })
    .into_response()
}

async fn address_balances_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let result = state.store.begin().and_then(|txn| {
        let balances = txn.address_balances(&address);
        txn.rollback();
        balances
    });

    match result {
        Ok(rows) => {
            let entries: Vec<BalanceEntry> = rows
                .into_iter()
                .map(|row| BalanceEntry {
                    token: row.token,
                    unlocked_balance: row.unlocked_balance,
                    locked_balance: row.locked_balance,
                    unlocked_authorities: row.unlocked_authorities,
                    locked_authorities: row.locked_authorities,
                    timelock_expires: row.timelock_expires,
                    transactions: row.transactions,
                    total_received: row.total_received,
                })
                .collect();
            Json(entries).into_response()
        }
        Err(e) => {
            tracing::error!(%address, "balance lookup failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "store error").into_response()
        }
    }
}

fn read_cursor(store: &SledStore) -> Result<Option<u64>, axum::response::Response> {
    match store.begin() {
        Ok(txn) => {
            let cursor = txn.last_event_id();
            txn.rollback();
            cursor.map_err(|e| {
                tracing::error!("cursor read failed: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "store error").into_response()
            })
        }
        Err(e) => {
            tracing::error!("store transaction failed: {e}");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "store error").into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use prism_sync::ledger::AddressBalanceRecord;
    use tower::util::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            version: "test".into(),
            network: "testnet".into(),
            started_at: Utc::now(),
            store: Arc::new(SledStore::open_temporary().unwrap()),
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_reports_cursor() {
        let state = test_state();
        {
            let mut txn = state.store.begin().unwrap();
            txn.set_last_event_id(42).unwrap();
            txn.commit().unwrap();
        }

        let router = create_router(state);
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/status")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["last_event_id"], 42);
        assert_eq!(json["network"], "testnet");
    }

    #[tokio::test]
    async fn address_balances_round_trip() {
        let state = test_state();
        {
            let mut txn = state.store.begin().unwrap();
            let mut row = AddressBalanceRecord::empty("addr1", "00");
            row.unlocked_balance = 100;
            row.transactions = 1;
            row.total_received = 100;
            txn.put_address_balance(&row).unwrap();
            txn.commit().unwrap();
        }

        let router = create_router(state);
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/addresses/addr1/balances")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json[0]["token"], "00");
        assert_eq!(json[0]["unlocked_balance"], 100);
    }

    #[tokio::test]
    async fn unknown_address_returns_empty_list() {
        let router = create_router(test_state());
        let response = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/addresses/nobody/balances")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 0);
    }
}
