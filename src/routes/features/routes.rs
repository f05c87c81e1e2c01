use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;

use super::{
    validate_flag_name, AnalyticsQuery, CheckRequest, CheckResponse, EnvironmentQuery, FlagListResponse,
    RolloutRequest, ToggleRequest, UsageRequest,
};
use crate::error::ServiceError;
use crate::evaluation::UserContext;
use crate::routes::user_context::RequestUser;
use crate::state::AppState;
use crate::store::NewFlag;

/// List all flags of an environment
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<EnvironmentQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let environment = state.environment_or_default(query.environment);
    let features = state.service.list_flags(&environment).await?;

    Ok(Json(FlagListResponse {
        success: true,
        count: features.len(),
        environment,
        features,
    }))
}

/// Create or update a feature flag
pub async fn upsert(
    State(state): State<AppState>,
    Json(payload): Json<NewFlag>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_flag_name(&payload.name)?;

    let feature = state.service.upsert_flag(payload).await?;

    Ok(Json(json!({
        "success": true,
        "feature": feature,
        "message": "Feature flag updated successfully",
    })))
}

/// Check a feature for the user described by `x-user-*` headers
pub async fn check_from_headers(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<EnvironmentQuery>,
    RequestUser(user): RequestUser,
) -> Result<impl IntoResponse, ServiceError> {
    check(state, name, query, user).await
}

/// Check a feature for the user in the request body
pub async fn check_from_body(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<EnvironmentQuery>,
    Json(payload): Json<CheckRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    check(state, name, query, payload.user).await
}

async fn check(
    state: AppState,
    name: String,
    query: EnvironmentQuery,
    user: UserContext,
) -> Result<Json<CheckResponse>, ServiceError> {
    let environment = state.environment_or_default(query.environment);
    let decision = state.service.check_feature(&name, &environment, &user).await?;

    Ok(Json(CheckResponse {
        feature: name,
        enabled: decision.assigned,
        reason: decision.reason,
        user: user.id,
        timestamp: Utc::now(),
    }))
}

/// Update rollout percentage
pub async fn update_rollout(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<EnvironmentQuery>,
    headers: HeaderMap,
    Json(payload): Json<RolloutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let environment = state.environment_or_default(query.environment);
    let changed_by = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("system");

    let feature = state
        .service
        .update_rollout_percentage(&name, &environment, payload.percentage, changed_by)
        .await?;

    Ok(Json(json!({
        "success": true,
        "feature": feature,
        "message": format!("Rollout percentage updated to {}% for {}", payload.percentage, name),
    })))
}

/// Turn a single flag on or off
pub async fn toggle(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<EnvironmentQuery>,
    Json(payload): Json<ToggleRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let environment = state.environment_or_default(query.environment);
    let feature = state.service.set_enabled(&name, &environment, payload.enabled).await?;

    Ok(Json(json!({
        "message": format!("Feature {} {}", name, if payload.enabled { "enabled" } else { "disabled" }),
        "feature": feature,
    })))
}

/// Aggregated analytics for the last `days` days (default 7)
pub async fn analytics(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let environment = state.environment_or_default(query.environment);
    let days = query.days.unwrap_or(7);
    let analytics = state.service.analytics(&name, &environment, days).await?;

    Ok(Json(json!({
        "success": true,
        "feature": name,
        "period": format!("{} days", days),
        "analytics": analytics,
    })))
}

/// Record that a user actually used the feature
pub async fn record_usage(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<EnvironmentQuery>,
    Json(payload): Json<UsageRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let environment = state.environment_or_default(query.environment);
    let recorded = state
        .service
        .record_usage(&name, &environment, &payload.user_id, payload.event_data)
        .await?;

    let status = if recorded { StatusCode::CREATED } else { StatusCode::ACCEPTED };
    Ok((status, Json(json!({ "recorded": recorded }))))
}

/// Drop stored assignments so users are re-bucketed on their next check
pub async fn reset_assignments(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<EnvironmentQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let environment = state.environment_or_default(query.environment);
    let removed = state.service.reset_assignments(&name, &environment).await?;

    Ok(Json(json!({ "feature": name, "removed": removed })))
}
