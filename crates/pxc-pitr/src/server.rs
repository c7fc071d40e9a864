//! HTTP endpoints served next to the collector and the recoverer
//!
//! `/health` answers while the process is up, `/metrics` renders the
//! Prometheus registry and `POST /invalidate-cache/?hostname=<host>` drops
//! the cached GTID sets of one host.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use prometheus::{Encoder, Registry, TextEncoder};
use pxc_storage::StorageClient;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cache;
use crate::error::Result;

/// State shared by the handlers
pub struct ServerState {
    /// Binlog storage holding the cache document
    pub storage: Arc<dyn StorageClient>,
    /// Object name of the cache document
    pub cache_key: String,
    /// Held by whoever reads and writes back the cache document
    pub cache_lock: Arc<Mutex<()>>,
    /// Registry rendered on `/metrics`
    pub registry: Registry,
}

#[derive(Debug, Deserialize)]
struct InvalidateParams {
    hostname: Option<String>,
}

/// Routes of the PITR binary
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/invalidate-cache/", post(invalidate_cache))
        .with_state(state)
}

/// Serve [`router`] on `addr` until `shutdown` fires
pub async fn serve(
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "serving health, metrics and cache endpoints");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<Arc<ServerState>>) -> Response {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    match encoder.encode(&state.registry.gather(), &mut body) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn invalidate_cache(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<InvalidateParams>,
) -> (StatusCode, String) {
    let Some(hostname) = params.hostname.filter(|h| !h.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "hostname is required".to_string());
    };

    let _cache = state.cache_lock.lock().await;
    match cache::invalidate_hosts(state.storage.as_ref(), &state.cache_key, |host: &str| {
        host == hostname
    })
    .await
    {
        Ok(_) => (
            StatusCode::OK,
            format!("cache invalidated for host: {hostname}"),
        ),
        Err(e) => {
            error!(%hostname, error = %e, "invalidate cache");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("invalidate cache: {e}"),
            )
        }
    }
}
