//! Health check endpoint
//!
//! Liveness plus a summary of the registry: how many sessions exist and how
//! many currently hold an open connection.

use hyper::{Response, StatusCode};
use serde::Serialize;

use super::{json_response, BoxBody};
use crate::server::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    /// Sessions in the registry
    pub sessions: usize,
    /// Sessions with a live connection
    pub open_connections: usize,
    pub idle_timeout_secs: u64,
    pub timestamp: String,
}

fn build_health_response(state: &AppState) -> HealthResponse {
    HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.registry.len(),
        open_connections: state.registry.open_count(),
        idle_timeout_secs: state.registry.config().idle_timeout.as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

/// GET /health
pub fn health_check(state: &AppState) -> Response<BoxBody> {
    json_response(StatusCode::OK, &build_health_response(state))
}
