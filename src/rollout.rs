//! Multi-stage rollouts run as tracked background tasks.
//!
//! Each stage sets the flag's rollout percentage, then waits its duration
//! before the next stage. Progress is published through [`RolloutStatus`]
//! and a running rollout can be cancelled at any point.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ServiceError};
use crate::evaluation::validate_rollout_percentage;
use crate::service::RolloutService;

pub const ROLLOUT_ACTOR: &str = "gradual_rollout_system";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage: u32,
    pub percentage: i32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloutStage {
    pub stage: u32,
    pub percentage: i32,
    pub duration_ms: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloutPlan {
    pub feature_name: String,
    pub environment: String,
    pub stages: Vec<RolloutStage>,
    pub total_duration_ms: u64,
}

impl RolloutPlan {
    /// Lays the stages end to end starting at `now`.
    pub fn new(
        feature_name: impl Into<String>,
        environment: impl Into<String>,
        specs: Vec<StageSpec>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if specs.is_empty() {
            return Err(ServiceError::InvalidArgument("rollout plan needs at least one stage".to_string()));
        }

        let mut stages = Vec::with_capacity(specs.len());
        let mut cursor = now;
        let mut total_duration_ms: u64 = 0;
        for spec in specs {
            validate_rollout_percentage(spec.percentage)?;
            let end_time = to_chrono(spec.duration_ms)
                .and_then(|d| cursor.checked_add_signed(d))
                .ok_or_else(|| too_long(spec.stage))?;
            total_duration_ms = total_duration_ms
                .checked_add(spec.duration_ms)
                .ok_or_else(|| too_long(spec.stage))?;
            stages.push(RolloutStage {
                stage: spec.stage,
                percentage: spec.percentage,
                duration_ms: spec.duration_ms,
                start_time: cursor,
                end_time,
            });
            cursor = end_time;
        }

        Ok(Self {
            feature_name: feature_name.into(),
            environment: environment.into(),
            total_duration_ms,
            stages,
        })
    }

    pub fn estimated_completion(&self) -> Option<DateTime<Utc>> {
        self.stages.last().map(|s| s.end_time)
    }
}

fn to_chrono(ms: u64) -> Option<chrono::TimeDelta> {
    chrono::TimeDelta::try_milliseconds(i64::try_from(ms).ok()?)
}

fn too_long(stage: u32) -> ServiceError {
    ServiceError::InvalidArgument(format!("stage {} runs past the supported date range", stage))
}

fn rollout_key(feature_name: &str, environment: &str) -> (String, String) {
    (feature_name.to_string(), environment.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloutStatus {
    pub feature_name: String,
    pub environment: String,
    pub state: RolloutState,
    pub current_stage: Option<u32>,
    pub current_percentage: Option<i32>,
    pub next_transition_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RolloutStatus {
    fn is_active(&self) -> bool {
        matches!(self.state, RolloutState::Pending | RolloutState::Running)
    }
}

struct RolloutHandle {
    status: Arc<RwLock<RolloutStatus>>,
    cancel: CancellationToken,
}

/// Owns every rollout task started by this process, keyed by `(flag name, environment)`.
#[derive(Clone)]
pub struct RolloutScheduler {
    service: RolloutService,
    rollouts: Arc<Mutex<HashMap<(String, String), RolloutHandle>>>,
    shutdown: CancellationToken,
}

impl RolloutScheduler {
    pub fn new(service: RolloutService, shutdown: CancellationToken) -> Self {
        Self {
            service,
            rollouts: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        }
    }

    pub fn plan(&self, feature_name: &str, environment: &str, specs: Vec<StageSpec>) -> Result<RolloutPlan> {
        RolloutPlan::new(feature_name, environment, specs, self.service.cache().clock().now())
    }

    /// Spawns the rollout. A second rollout for a flag that is still running
    /// in the same environment is a `Conflict`.
    pub fn start(&self, plan: RolloutPlan) -> Result<RolloutStatus> {
        let mut rollouts = self.rollouts.lock();
        let key = rollout_key(&plan.feature_name, &plan.environment);

        if let Some(existing) = rollouts.get(&key) {
            if existing.status.read().is_active() {
                return Err(ServiceError::Conflict(format!(
                    "a rollout for '{}' in {} is already running",
                    plan.feature_name, plan.environment
                )));
            }
        }

        let status = Arc::new(RwLock::new(RolloutStatus {
            feature_name: plan.feature_name.clone(),
            environment: plan.environment.clone(),
            state: RolloutState::Pending,
            current_stage: None,
            current_percentage: None,
            next_transition_at: plan.stages.first().map(|s| s.start_time),
            error: None,
        }));
        let cancel = self.shutdown.child_token();

        rollouts.insert(
            key,
            RolloutHandle {
                status: status.clone(),
                cancel: cancel.clone(),
            },
        );

        let snapshot = status.read().clone();
        tokio::spawn(run_plan(self.service.clone(), plan, status, cancel));
        Ok(snapshot)
    }

    pub fn status(&self, feature_name: &str, environment: &str) -> Option<RolloutStatus> {
        self.rollouts
            .lock()
            .get(&rollout_key(feature_name, environment))
            .map(|h| h.status.read().clone())
    }

    /// Returns false when no rollout is active for the flag in that environment.
    pub fn cancel(&self, feature_name: &str, environment: &str) -> bool {
        match self.rollouts.lock().get(&rollout_key(feature_name, environment)) {
            Some(handle) if handle.status.read().is_active() => {
                handle.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

async fn run_plan(
    service: RolloutService,
    plan: RolloutPlan,
    status: Arc<RwLock<RolloutStatus>>,
    cancel: CancellationToken,
) {
    let name = plan.feature_name.as_str();
    tracing::info!(feature = name, stages = plan.stages.len(), "starting gradual rollout");
    status.write().state = RolloutState::Running;

    let last = plan.stages.len().saturating_sub(1);
    for (i, stage) in plan.stages.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }

        if let Err(e) = service
            .update_rollout_percentage(name, &plan.environment, stage.percentage, ROLLOUT_ACTOR)
            .await
        {
            tracing::error!(feature = name, stage = stage.stage, error = %e, "gradual rollout failed");
            let mut s = status.write();
            s.state = RolloutState::Failed;
            s.next_transition_at = None;
            s.error = Some(e.to_string());
            return;
        }

        let now = service.cache().clock().now();
        {
            let mut s = status.write();
            s.current_stage = Some(stage.stage);
            s.current_percentage = Some(stage.percentage);
            s.next_transition_at = if i < last {
                to_chrono(stage.duration_ms).and_then(|d| now.checked_add_signed(d))
            } else {
                None
            };
        }
        tracing::info!(feature = name, stage = stage.stage, percentage = stage.percentage, "rollout stage applied");

        if i < last {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(stage.duration_ms)) => {}
            }
        }
    }

    let mut s = status.write();
    s.next_transition_at = None;
    if cancel.is_cancelled() {
        s.state = RolloutState::Cancelled;
        tracing::warn!(feature = name, stage = ?s.current_stage, "gradual rollout cancelled");
    } else {
        s.state = RolloutState::Completed;
        tracing::info!(feature = name, "gradual rollout completed");
    }
}
