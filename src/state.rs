use std::sync::Arc;

use crate::rollout::RolloutScheduler;
use crate::service::RolloutService;
use crate::static_flags::StaticFlags;

#[derive(Clone)]
pub struct AppState {
    pub service: RolloutService,
    pub scheduler: RolloutScheduler,
    pub static_flags: Arc<StaticFlags>,
}

impl AppState {
    pub fn environment_or_default(&self, environment: Option<String>) -> String {
        environment.unwrap_or_else(|| self.service.default_environment().to_string())
    }
}
