//! HTTP API for the faucet

use crate::coordinator::{ClaimCoordinator, ClaimOutcome};
use crate::error::{FaucetError, FaucetResult};
use crate::identity::Identity;
use crate::metrics::MetricsCollector;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ClaimCoordinator>,
    pub metrics: MetricsCollector,
    /// Network name reported by the status endpoint
    pub network: String,
}

/// Claim request
#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    #[serde(alias = "identity")]
    pub address: Option<String>,
}

/// Successful claim
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    pub dispatched: bool,
    pub receipt: String,
    pub amount: String,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub network: String,
    pub token: String,
    pub symbol: String,
    pub funding_level: String,
    pub dispense_amount: String,
    pub cooldown_hours: f64,
}

/// Build the faucet router.
pub fn router(state: AppState, cors_enabled: bool) -> Router {
    let mut app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/faucet", post(claim_handler).get(status_handler))
        .route("/api/dispense", post(claim_handler))
        .route("/api/status", get(status_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors_enabled {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    app
}

/// Claim handler
pub async fn claim_handler(
    State(state): State<AppState>,
    payload: Result<Json<ClaimRequest>, JsonRejection>,
) -> FaucetResult<Json<ClaimResponse>> {
    let Json(request) = payload.map_err(|e| {
        debug!(error = %e, "Malformed claim request");
        FaucetError::InvalidAddress
    })?;

    let identity = request
        .address
        .as_deref()
        .and_then(Identity::parse)
        .ok_or(FaucetError::InvalidAddress)?;

    info!(%identity, "Claim request");

    let coordinator = &state.coordinator;
    match coordinator.request_claim(&identity, chrono::Utc::now()).await? {
        ClaimOutcome::Dispatched(receipt) => {
            let dispensation = coordinator.dispensation();
            Ok(Json(ClaimResponse {
                dispatched: true,
                receipt: receipt.tx_hash,
                amount: dispensation.display_amount(),
                token: dispensation.token_symbol.clone(),
            }))
        }
        ClaimOutcome::Throttled(remaining) => Err(FaucetError::Throttled(remaining)),
        ClaimOutcome::Underfunded => Err(FaucetError::InsufficientFunds),
        ClaimOutcome::TransferFailed(cause) => Err(FaucetError::TransferFailed(cause)),
    }
}

/// Status handler. Reads the ledger only.
pub async fn status_handler(State(state): State<AppState>) -> FaucetResult<Json<StatusResponse>> {
    let status = state.coordinator.status().await?;
    Ok(Json(StatusResponse {
        status: "ok".to_string(),
        network: state.network.clone(),
        token: status.token,
        symbol: status.symbol,
        funding_level: status.funding_level,
        dispense_amount: status.dispense_amount,
        cooldown_hours: status.cooldown_hours,
    }))
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Prometheus metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.gather() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Root handler with info
pub async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    let dispensation = state.coordinator.dispensation();
    Json(serde_json::json!({
        "name": "Token Faucet",
        "version": env!("CARGO_PKG_VERSION"),
        "network": state.network,
        "token": dispensation.token_symbol,
        "amount": dispensation.display_amount(),
        "backend": state.coordinator.store().backend(),
        "endpoints": {
            "POST /api/faucet": "Request tokens",
            "GET /api/faucet": "Get faucet status",
            "GET /health": "Health check",
            "GET /metrics": "Prometheus metrics"
        }
    }))
}
