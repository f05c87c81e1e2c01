//! Persistence contract consumed by the rollout service.
//!
//! The engine itself never touches storage; everything it needs is resolved
//! through [`FlagStore`] by the caller first.

mod memory;
mod postgres;

pub use memory::InMemoryFlagStore;
pub use postgres::PgFlagStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::Result;
use crate::evaluation::{Assignment, FlagDefinition, RolloutStrategy, Segment, Targeting};

#[derive(Debug, Clone, Deserialize)]
pub struct NewFlag {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rollout_percentage: i32,
    #[serde(default = "default_strategy")]
    pub rollout_strategy: RolloutStrategy,
    pub environment: Option<String>,
    pub created_by: Option<String>,
}

fn default_strategy() -> RolloutStrategy {
    RolloutStrategy::Percentage
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Enabled,
    Disabled,
    Used,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Enabled => "enabled",
            EventType::Disabled => "disabled",
            EventType::Used => "used",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "enabled" => Some(EventType::Enabled),
            "disabled" => Some(EventType::Disabled),
            "used" => Some(EventType::Used),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    pub flag_id: Uuid,
    pub user_id: String,
    pub event_type: EventType,
    pub event_data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Event count for one flag, one day and one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub event_type: EventType,
    pub count: i64,
}

#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn flag_by_name(&self, name: &str, environment: &str) -> Result<Option<FlagDefinition>>;

    /// Flags of one environment ordered by name
    async fn list_flags(&self, environment: &str) -> Result<Vec<FlagDefinition>>;

    /// Create, or update every mutable column of, the flag keyed by `(name, environment)`.
    async fn upsert_flag(&self, flag: &NewFlag, environment: &str) -> Result<FlagDefinition>;

    async fn set_enabled(&self, name: &str, environment: &str, enabled: bool) -> Result<Option<FlagDefinition>>;

    /// Updates the percentage and appends a history row. `NotFound` when the flag is absent.
    async fn update_rollout_percentage(
        &self,
        name: &str,
        environment: &str,
        percentage: i32,
        changed_by: &str,
    ) -> Result<FlagDefinition>;

    /// Targeting rows for a flag in creation order
    async fn targeting_for_flag(&self, flag_id: Uuid) -> Result<Vec<Targeting>>;

    async fn list_segments(&self) -> Result<Vec<Segment>>;

    async fn assignment(&self, user_id: &str, flag_id: Uuid) -> Result<Option<Assignment>>;

    /// Stores `assignment` unless one already exists for the pair; returns whichever row is stored.
    async fn insert_assignment(&self, assignment: &Assignment) -> Result<Assignment>;

    async fn delete_assignments(&self, flag_id: Uuid) -> Result<u64>;

    async fn record_event(&self, event: &AnalyticsEvent) -> Result<()>;

    async fn daily_counts(&self, flag_id: Uuid, since: DateTime<Utc>) -> Result<Vec<DailyCount>>;

    async fn distinct_users(&self, flag_id: Uuid, since: DateTime<Utc>) -> Result<i64>;

    /// Disables every flag in one statement, returning how many rows changed.
    async fn disable_all(&self) -> Result<u64>;

    /// Cheap round trip used by health checks.
    async fn ping(&self) -> Result<()>;
}
