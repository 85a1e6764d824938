//! Health check endpoints.

use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    /// ISO 8601.
    pub timestamp: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
}

fn ok() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "director".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn healthz() -> Json<HealthResponse> {
    ok()
}

/// The process is up; says nothing about the cluster.
async fn livez() -> Json<HealthResponse> {
    ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_healthz_reports_ok() {
        let Json(response) = healthz().await;
        assert_eq!(response.status, "ok");
        assert_eq!(response.service, "director");
    }
}
