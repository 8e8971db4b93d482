//! HTTP metric query service for external autoscalers.
//!
//! Read-only endpoints:
//! - `/health` - `OK` while the process runs
//! - `/v1/metric` - current [`ScaleMetric`] as JSON
//! - `/v1/active` - `{"active": bool}`, true while the metric is non-zero
//! - `/v1/partitions` - per-partition lag estimates behind the metric
//! - `/metrics` - Prometheus exposition format
//!
//! Only configuration errors fail a request (HTTP 500); everything else degrades the
//! metric instead.

use crate::aggregator::{ScaleMetric, ScaleMetricAggregator};
use crate::error::{Result, ScalerError};
use crate::lag_estimator::PartitionLag;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use feedscale_observability::exporter::create_metrics_router;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<ScaleMetricAggregator>,
}

#[derive(Debug, Serialize)]
pub struct ActiveResponse {
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct PartitionsResponse {
    pub metric: ScaleMetric,
    pub partitions: Vec<PartitionLag>,
}

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/metric", get(get_metric))
        .route("/active", get(get_active))
        .route("/partitions", get(get_partitions));

    Router::new()
        .route("/health", get(health_check))
        .nest("/v1", api_routes)
        .with_state(state)
        .merge(create_metrics_router())
}

async fn health_check() -> impl IntoResponse {
    "OK"
}

async fn get_metric(State(state): State<AppState>) -> Response {
    match state.aggregator.current_metric().await {
        Ok(metric) => Json(metric).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_active(State(state): State<AppState>) -> Response {
    match state.aggregator.current_metric().await {
        Ok(metric) => Json(ActiveResponse {
            active: metric.value > 0,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_partitions(State(state): State<AppState>) -> Response {
    match state.aggregator.snapshot().await {
        Ok((metric, partitions)) => Json(PartitionsResponse { metric, partitions }).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: ScalerError) -> Response {
    error!(error = %e, "Scale metric query failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

/// Serves [`create_router`] on a TCP address.
pub struct ScalerServer {
    addr: SocketAddr,
    state: AppState,
}

impl ScalerServer {
    pub fn new(addr: SocketAddr, aggregator: Arc<ScaleMetricAggregator>) -> Self {
        Self {
            addr,
            state: AppState { aggregator },
        }
    }

    /// Serve until `shutdown` flips to true.
    pub async fn start(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let app = create_router(self.state);

        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "Scale metric server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow_and_update() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await?;

        Ok(())
    }
}
