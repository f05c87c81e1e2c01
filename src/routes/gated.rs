use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::service::RolloutService;

/// State for [`require_feature`]: the flag guarding one route.
#[derive(Clone)]
pub struct FeatureGate {
    service: RolloutService,
    feature: &'static str,
}

impl FeatureGate {
    pub fn new(service: RolloutService, feature: &'static str) -> Self {
        Self { service, feature }
    }
}

/// Lets the request through only while the flag is enabled in the default
/// environment. Lookup failures close the gate.
pub async fn require_feature(State(gate): State<FeatureGate>, req: Request, next: Next) -> Response {
    let environment = gate.service.default_environment();

    match gate.service.flag_enabled(gate.feature, environment).await {
        Ok(true) => next.run(req).await,
        Ok(false) => {
            tracing::info!(feature = gate.feature, path = %req.uri().path(), "blocked by disabled feature");
            unavailable(
                "Feature temporarily unavailable",
                format!("The {} feature is currently disabled", gate.feature),
                "FEATURE_DISABLED",
            )
        }
        Err(e) => {
            tracing::error!(feature = gate.feature, error = %e, "feature gate lookup failed, denying");
            unavailable(
                "Service temporarily unavailable",
                "Unable to verify feature availability".to_string(),
                "SERVICE_ERROR",
            )
        }
    }
}

fn unavailable(error: &str, message: String, code: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": error, "message": message, "code": code })),
    )
        .into_response()
}

pub async fn register() -> impl IntoResponse {
    Json(json!({ "message": "User registration endpoint" }))
}

pub async fn payment() -> impl IntoResponse {
    Json(json!({ "message": "Payment processing endpoint" }))
}

pub async fn beta_feature() -> impl IntoResponse {
    Json(json!({ "message": "Beta feature endpoint" }))
}
