pub mod routes;

use serde::Deserialize;

use crate::rollout::StageSpec;

#[derive(Debug, Deserialize)]
pub struct StartRolloutRequest {
    pub stages: Vec<StageSpec>,
}
