//! HTTP API Server
//!
//! Read-only JSON views of the relay's statistics registry and peer cache.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::cache::PeerCache;
use crate::config::{ApiConfig, Protocol};
use crate::error::{Error, Result};
use crate::stats::{ChartSample, ClientRecord, Statistics};
use crate::transport::PeerConn;

/// Shared application state
pub struct AppState {
    pub protocol: Protocol,
    pub stats: Arc<Statistics>,
    pub cache: Arc<PeerCache<PeerConn>>,
    pub started: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(
        config: ApiConfig,
        protocol: Protocol,
        stats: Arc<Statistics>,
        cache: Arc<PeerCache<PeerConn>>,
    ) -> Self {
        let state = Arc::new(AppState {
            protocol,
            stats,
            cache,
            started: Instant::now(),
        });
        Self { config, state }
    }

    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/stats", get(handle_stats))
            .route("/clients", get(handle_clients))
            .route("/chart", get(handle_chart))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind the configured address and serve until `cancel` fires
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        self.serve(listener, cancel).await
    }

    pub async fn serve(
        &self,
        listener: tokio::net::TcpListener,
        cancel: CancellationToken,
    ) -> Result<()> {
        let app = Self::create_router(Arc::clone(&self.state));
        tracing::info!("HTTP API listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))?;

        tracing::info!("HTTP API stopped");
        Ok(())
    }
}

// ============ Response Types ============

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub protocol: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub protocol: String,
    pub uptime_seconds: u64,
    pub online_clients: usize,
    pub known_clients: usize,
    pub rx_total: u64,
    pub tx_total: u64,
    pub cache_entries: usize,
    pub chart_samples: usize,
}

/// One row of `/clients`
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientView {
    pub address: SocketAddr,
    pub online: bool,
    pub online_time: String,
    pub offline_time: Option<String>,
    pub rx: u64,
    pub tx: u64,
}

impl From<ClientRecord> for ClientView {
    fn from(record: ClientRecord) -> Self {
        Self {
            address: record.address,
            online: record.online,
            online_time: record.online_time.to_rfc3339(),
            offline_time: record.offline_time.map(|t| t.to_rfc3339()),
            rx: record.rx,
            tx: record.tx,
        }
    }
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        protocol: state.protocol.to_string(),
    })
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summary = state.stats.summary();
    Json(StatsResponse {
        protocol: state.protocol.to_string(),
        uptime_seconds: state.started.elapsed().as_secs(),
        online_clients: summary.online_clients,
        known_clients: summary.known_clients,
        rx_total: summary.rx_total,
        tx_total: summary.tx_total,
        cache_entries: state.cache.len(),
        chart_samples: summary.chart_samples,
    })
}

async fn handle_clients(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let clients: Vec<ClientView> = state
        .stats
        .clients()
        .into_iter()
        .map(ClientView::from)
        .collect();
    Json(clients)
}

async fn handle_chart(State(state): State<Arc<AppState>>) -> Json<Vec<ChartSample>> {
    Json(state.stats.chart())
}
