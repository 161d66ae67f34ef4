use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::aggregate::SharedAggregator;

#[derive(Clone)]
pub struct AppState {
    aggregator: SharedAggregator,
    phase: Arc<RwLock<RunPhase>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Running,
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub state: RunPhase,
    pub total: u64,
    pub tested: u64,
    pub available: u64,
    pub unavailable: u64,
    pub mean_latency_ms: Option<f64>,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
}

impl AppState {
    pub fn new(aggregator: SharedAggregator) -> Self {
        Self {
            aggregator,
            phase: Arc::new(RwLock::new(RunPhase::Running)),
        }
    }

    pub async fn set_phase(&self, phase: RunPhase) {
        *self.phase.write().await = phase;
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/results", get(get_results))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

/// Serve the status API until the process exits.
pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("status API on http://{}/api/status", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.aggregator.stats().await;
    let state = *app.phase.read().await;
    let out = Status {
        state,
        total: s.total,
        tested: s.tested,
        available: s.available,
        unavailable: s.unavailable,
        mean_latency_ms: s.mean_latency_ms,
        min_latency_ms: s.min_latency_ms,
        max_latency_ms: s.max_latency_ms,
    };
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.aggregator.ranked().await))
}
