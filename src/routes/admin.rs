use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;

use crate::error::ServiceError;
use crate::state::AppState;

pub async fn segments(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let segments = state.service.list_segments().await?;

    Ok(Json(json!({
        "success": true,
        "count": segments.len(),
        "segments": segments,
    })))
}

/// Emergency kill switch: disables every flag in every environment
pub async fn kill_switch(State(state): State<AppState>) -> Result<impl IntoResponse, ServiceError> {
    let disabled = state.service.kill_switch().await?;

    Ok(Json(json!({
        "message": "Emergency kill switch activated - all features disabled",
        "disabled": disabled,
        "timestamp": Utc::now(),
    })))
}

pub async fn static_features(State(state): State<AppState>) -> impl IntoResponse {
    let flags = &state.static_flags;

    Json(json!({
        "enabled": flags.enabled(),
        "disabled": flags.disabled(),
        "summary": flags.summary(),
    }))
}

pub async fn static_feature(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    let enabled = state.static_flags.is_enabled(&name);
    Json(json!({ "feature": name, "enabled": enabled }))
}
