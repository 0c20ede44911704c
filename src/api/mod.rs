//! HTTP API for request intake, status queries and health checks

use crate::config::ApiConfig;
use crate::coordination::RelayEngine;
use crate::error::{RelayerError, RelayerResult};
use crate::relayer::FleetStats;
use crate::tx::{NewTransaction, TransactionRequest};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RelayEngine>,
}

pub fn router(engine: Arc<RelayEngine>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/v1/transactions", post(submit_transaction))
        .route("/v1/transactions/:id", get(get_transaction))
        .route("/v1/chains/:chain_id/relayers", get(get_relayers))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, engine: Arc<RelayEngine>) -> RelayerResult<()> {
    let app = router(engine);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("api bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("api server: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store reachable and every chain connected
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.engine.store().health_check().await.is_ok();
    let details: Vec<ChainHealth> = state
        .engine
        .health()
        .await
        .into_iter()
        .map(|(chain_id, healthy)| ChainHealth { chain_id, healthy })
        .collect();
    let chains_ok = details.iter().all(|chain| chain.healthy);

    let ready = store_ok && chains_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready,
            store: store_ok,
            chains: chains_ok,
            details,
        }),
    )
}

async fn submit_transaction(
    State(state): State<AppState>,
    Json(request): Json<NewTransaction>,
) -> Result<impl IntoResponse, ApiError> {
    let id = state.engine.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { id })))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TransactionRequest>, ApiError> {
    Ok(Json(state.engine.get_status(&id).await?))
}

async fn get_relayers(
    State(state): State<AppState>,
    Path(chain_id): Path<u64>,
) -> Result<Json<FleetResponse>, ApiError> {
    let relayers = state
        .engine
        .relayers(chain_id)
        .ok_or(RelayerError::ChainNotFound { chain_id })?;

    let stats = relayers.stats().await;
    let available = relayers.queue().size().await;
    let fleet = relayers
        .fleet()
        .await
        .into_iter()
        .map(|relayer| RelayerView {
            address: relayer.address_string(),
            balance: relayer.balance.to_string(),
            nonce: relayer.nonce,
            pending_tx_count: relayer.pending_tx_count,
            active: relayer.active,
        })
        .collect();

    Ok(Json(FleetResponse {
        chain_id,
        stats,
        available,
        relayers: fleet,
    }))
}

/// Error wrapper mapping relayer errors onto HTTP statuses
struct ApiError(RelayerError);

impl From<RelayerError> for ApiError {
    fn from(e: RelayerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayerError::TransactionNotFound { .. } | RelayerError::ChainNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            RelayerError::Transaction(_) | RelayerError::Config(_) => StatusCode::BAD_REQUEST,
            RelayerError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayerError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    store: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Serialize)]
struct FleetResponse {
    chain_id: u64,
    stats: FleetStats,
    available: usize,
    relayers: Vec<RelayerView>,
}

#[derive(Serialize)]
struct RelayerView {
    address: String,
    balance: String,
    nonce: u64,
    pending_tx_count: u64,
    active: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
