use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::StartRolloutRequest;
use crate::error::ServiceError;
use crate::routes::features::EnvironmentQuery;
use crate::state::AppState;

/// Start a staged rollout in the background
pub async fn start(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<EnvironmentQuery>,
    Json(payload): Json<StartRolloutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let environment = state.environment_or_default(query.environment);
    let plan = state.scheduler.plan(&name, &environment, payload.stages)?;
    let estimated_completion = plan.estimated_completion();
    let stages = plan.stages.clone();
    let total_duration_ms = plan.total_duration_ms;

    let status = state.scheduler.start(plan)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": "Gradual rollout started",
            "plan": {
                "feature": name,
                "stages": stages,
                "total_duration_ms": total_duration_ms,
                "estimated_completion": estimated_completion,
            },
            "status": status,
        })),
    ))
}

/// Current stage and next transition of a rollout
pub async fn status(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<EnvironmentQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let environment = state.environment_or_default(query.environment);
    state
        .scheduler
        .status(&name, &environment)
        .map(Json)
        .ok_or_else(|| ServiceError::NotFound(format!("rollout for '{}' in {}", name, environment)))
}

/// Stop a running rollout at its current stage
pub async fn cancel(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<EnvironmentQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let environment = state.environment_or_default(query.environment);
    if !state.scheduler.cancel(&name, &environment) {
        return Err(ServiceError::NotFound(format!(
            "active rollout for '{}' in {}",
            name, environment
        )));
    }

    Ok(Json(json!({ "feature": name, "environment": environment, "cancelled": true })))
}
