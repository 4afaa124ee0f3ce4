//! # Health Check Endpoint
//!
//! `GET /health` reports whether the relay is listening and what it is
//! currently carrying. Used by load balancers and container orchestrators.
//!
//! ## Response Format:
//! ```json
//! {
//!   "status": "healthy",
//!   "timestamp": "2024-10-01T12:00:00Z",
//!   "uptime_seconds": 3600,
//!   "service": { "name": "realtime-relay", "version": "0.1.0" },
//!   "server_state": "listening",
//!   "pairings": { "active": 2, "total": 40 },
//!   "frames": { "client_to_upstream": 1200, "upstream_to_client": 3400, "dropped": 3 },
//!   "upstream": { "model": "gpt-4o-realtime-preview-2024-10-01", "url": "wss://..." }
//! }
//! ```
//!
//! The upstream credential never appears in the response.

use crate::state::{AppState, ServerState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics_snapshot();
    let server_state = state.server_state();
    let upstream = &state.config.upstream;

    let status = match server_state {
        ServerState::Listening => "healthy",
        ServerState::Terminated => "terminated",
    };

    let body = json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION")
        },
        "server_state": server_state,
        "pairings": {
            "active": metrics.active_pairings,
            "total": metrics.total_pairings
        },
        "frames": {
            "client_to_upstream": metrics.frames_to_upstream,
            "upstream_to_client": metrics.frames_to_client,
            "dropped": metrics.frames_dropped
        },
        "connector_failures": metrics.connector_failures,
        "upstream": {
            "model": upstream.model,
            "url": upstream.base_url
        }
    });

    match server_state {
        ServerState::Listening => HttpResponse::Ok().json(body),
        ServerState::Terminated => HttpResponse::ServiceUnavailable().json(body),
    }
}
