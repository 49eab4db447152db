//! HTTP API Server
//!
//! Read-only status endpoints for load balancers and operators.

use std::sync::Arc;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::election::{LeadershipStatus, Role};
use crate::error::Result;
use crate::identity::ServiceIdentity;

/// Shared application state
pub struct AppState {
    /// This instance
    pub identity: ServiceIdentity,
    /// Latest election status
    pub status: watch::Receiver<LeadershipStatus>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, identity: ServiceIdentity, status: watch::Receiver<LeadershipStatus>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { identity, status }),
        }
    }

    /// Create the router
    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/leader", get(handle_leader))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server on the configured address
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);
        self.serve(listener, cancel).await
    }

    /// Serve on an already bound listener until cancelled
    pub async fn serve(&self, listener: tokio::net::TcpListener, cancel: CancellationToken) -> Result<()> {
        let app = Self::create_router(Arc::clone(&self.state));
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        tracing::info!("HTTP API stopped");
        Ok(())
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
    pub is_leader: bool,
}

/// Leader response
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub leader: Option<ServiceIdentity>,
    pub is_self: bool,
    pub index: u64,
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    let healthy = status.role != Role::Stopped;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            healthy,
            node_id: state.identity.id.clone(),
            is_leader: status.role == Role::Leader,
        }),
    )
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.status.borrow().clone())
}

async fn handle_leader(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.status.borrow().clone();
    let code = if status.leader.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (
        code,
        Json(LeaderResponse {
            is_self: status.leader.as_ref() == Some(&state.identity),
            leader: status.leader,
            index: status.index,
        }),
    )
}
