use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::cors::CorsLayer;

mod admin;
mod features;
mod gated;
mod health;
mod rollouts;
mod user_context;

pub use health::health;

use crate::state::AppState;
use gated::{require_feature, FeatureGate};

pub fn routes(state: AppState) -> Router {
    let service = state.service.clone();
    let gate = move |feature: &'static str| {
        middleware::from_fn_with_state(FeatureGate::new(service.clone(), feature), require_feature)
    };

    let feature_router = Router::new()
        .route("/", get(features::routes::list).post(features::routes::upsert))
        .route(
            "/{name}/check",
            get(features::routes::check_from_headers).post(features::routes::check_from_body),
        )
        .route("/{name}/rollout", put(features::routes::update_rollout))
        .route("/{name}/toggle", post(features::routes::toggle))
        .route(
            "/{name}/gradual-rollout",
            post(rollouts::routes::start)
                .get(rollouts::routes::status)
                .delete(rollouts::routes::cancel),
        )
        .route("/{name}/analytics", get(features::routes::analytics))
        .route("/{name}/usage", post(features::routes::record_usage))
        .route(
            "/{name}/assignments",
            axum::routing::delete(features::routes::reset_assignments),
        );

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest(
            "/api",
            Router::new()
                .nest("/features", feature_router)
                .route("/segments", get(admin::segments))
                .route("/kill-switch", post(admin::kill_switch))
                .route("/static-features", get(admin::static_features))
                .route("/static-features/{name}", get(admin::static_feature))
                .route("/register", post(gated::register).layer(gate("user-registration")))
                .route("/payment", post(gated::payment).layer(gate("payment-gateway")))
                .route("/beta/new-feature", get(gated::beta_feature).layer(gate("beta-features"))),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> &'static str {
    "Feature rollout service"
}
