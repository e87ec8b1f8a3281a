//! Public HTTP API.
//!
//! `/simulate` runs one job in a sandbox, `/simulate/parallel` fans a batch
//! out, and `/simulate/local` runs the calculation engine in-process.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::JobError;
use crate::orchestrator::dispatcher::ParallelDispatcher;
use crate::orchestrator::executor::{JobExecutor, JobRunner, SimulationResponse};
use crate::sandbox::EnvironmentRegistry;
use crate::simulation::SimulationRequest;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<EnvironmentRegistry>,
    pub runner: Arc<dyn JobRunner>,
    pub dispatcher: ParallelDispatcher,
    pub job_timeout: Duration,
}

impl AppState {
    pub fn new(executor: Arc<JobExecutor>) -> Self {
        let job_timeout = executor.default_deadline();
        Self {
            registry: Arc::clone(executor.registry()),
            dispatcher: ParallelDispatcher::new(executor.clone(), job_timeout),
            runner: executor,
            job_timeout,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub sandbox_connected: bool,
    pub backend: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct ParallelRequest {
    pub simulations: Vec<SimulationRequest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ParallelResponse {
    pub results: BTreeMap<String, SimulationResponse>,
    /// Wall-clock seconds for the whole batch.
    pub total_time: f64,
    pub errors: BTreeMap<String, String>,
}

/// Error body is always `{"detail": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    InvalidInput(String),
    Timeout(String),
    Execution(String),
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Timeout { .. } => Self::Timeout(e.to_string()),
            JobError::Execution(_) => Self::Execution(format!("Simulation failed: {}", e.describe())),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidInput(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::InvalidInput(detail) => (StatusCode::UNPROCESSABLE_ENTITY, detail),
            Self::Timeout(detail) => (StatusCode::GATEWAY_TIMEOUT, detail),
            Self::Execution(detail) => (StatusCode::INTERNAL_SERVER_ERROR, detail),
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/simulate", post(simulate))
        .route("/simulate/parallel", post(simulate_parallel))
        .route("/simulate/local", post(simulate_local))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Bind and serve in the background. Returns the bound address.
pub async fn start_server(addr: SocketAddr, state: AppState) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router(state)).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });
    Ok(bound)
}

// -- Handlers --

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let sandbox_connected = match state.registry.health_check().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Sandbox backend health check failed");
            false
        }
    };
    Json(HealthResponse {
        status: "healthy",
        service: "treasury-simulation",
        sandbox_connected,
        backend: state.registry.backend_name(),
    })
}

async fn simulate(
    State(state): State<AppState>,
    payload: Result<Json<SimulationRequest>, JsonRejection>,
) -> Result<Json<SimulationResponse>, ApiError> {
    let Json(request) = payload?;
    request.validate().map_err(ApiError::InvalidInput)?;

    let response = state.runner.run(&request, state.job_timeout).await?;
    Ok(Json(response))
}

async fn simulate_parallel(
    State(state): State<AppState>,
    payload: Result<Json<ParallelRequest>, JsonRejection>,
) -> Result<Json<ParallelResponse>, ApiError> {
    let Json(batch) = payload?;
    for (n, request) in batch.simulations.iter().enumerate() {
        request
            .validate()
            .map_err(|e| ApiError::InvalidInput(format!("simulations[{}]: {}", n, e)))?;
    }

    let outcome = state.dispatcher.run_all(batch.simulations).await;
    Ok(Json(ParallelResponse {
        results: outcome.results,
        total_time: outcome.total_elapsed.as_secs_f64(),
        errors: outcome.errors,
    }))
}

async fn simulate_local(
    payload: Result<Json<SimulationRequest>, JsonRejection>,
) -> Result<Json<SimulationResponse>, ApiError> {
    let Json(request) = payload?;
    request.validate().map_err(ApiError::InvalidInput)?;
    Ok(Json(SimulationResponse::local(request.compute_metrics())))
}
