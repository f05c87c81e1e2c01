use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthData {
    status: &'static str,
    database: &'static str,
    environment: String,
    cached_flags: usize,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthData>) {
    let ping = state.service.ping().await;

    let (code, status, database, error) = match ping {
        Ok(()) => (StatusCode::OK, "healthy", "connected", None),
        Err(e) => {
            tracing::error!(error = %e, "health check could not reach the store");
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy", "disconnected", Some(e.to_string()))
        }
    };

    let health_data = HealthData {
        status,
        database,
        environment: state.service.default_environment().to_string(),
        cached_flags: state.service.cache().len(),
        timestamp: Utc::now(),
        error,
    };
    (code, Json(health_data))
}
