use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::FlagCache;
use crate::error::{Result, ServiceError};
use crate::evaluation::{
    decide, validate_rollout_percentage, validate_user_id, Assignment, Decision, FlagDefinition,
    RolloutStrategy, Segment, UserContext,
};
use crate::store::{AnalyticsEvent, EventType, FlagStore, NewFlag};

pub const REASON_NOT_FOUND: &str = "not_found";
pub const REASON_UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";

pub const MAX_ANALYTICS_DAYS: i64 = 365;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DayBreakdown {
    pub enabled: i64,
    pub disabled: i64,
    pub used: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    pub total_users: i64,
    pub enabled_count: i64,
    pub disabled_count: i64,
    pub usage_count: i64,
    pub daily_breakdown: BTreeMap<NaiveDate, DayBreakdown>,
}

/// Everything around the engine: flag lookup, sticky assignments, analytics.
#[derive(Clone)]
pub struct RolloutService {
    store: Arc<dyn FlagStore>,
    cache: FlagCache,
    analytics_enabled: bool,
    default_environment: String,
}

impl RolloutService {
    pub fn new(
        store: Arc<dyn FlagStore>,
        cache: FlagCache,
        analytics_enabled: bool,
        default_environment: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            analytics_enabled,
            default_environment: default_environment.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn FlagStore> {
        &self.store
    }

    pub fn cache(&self) -> &FlagCache {
        &self.cache
    }

    pub fn default_environment(&self) -> &str {
        &self.default_environment
    }

    fn now(&self) -> DateTime<Utc> {
        self.cache.clock().now()
    }

    pub async fn is_feature_enabled(&self, name: &str, environment: &str, user: &UserContext) -> bool {
        self.check_feature(name, environment, user)
            .await
            .map(|d| d.assigned)
            .unwrap_or(false)
    }

    /// Decide and persist. Only an empty user id is surfaced as an error;
    /// every storage problem resolves to a denied decision.
    pub async fn check_feature(&self, name: &str, environment: &str, user: &UserContext) -> Result<Decision> {
        validate_user_id(&user.id)?;

        match self.evaluate(name, environment, user).await {
            Ok(decision) => Ok(decision),
            Err(e) => {
                tracing::error!(feature = name, user_id = %user.id, error = %e, "feature check failed, denying");
                Ok(Decision::denied(REASON_UPSTREAM_UNAVAILABLE))
            }
        }
    }

    async fn evaluate(&self, name: &str, environment: &str, user: &UserContext) -> Result<Decision> {
        let Some(flag) = self.get_flag(name, environment).await? else {
            tracing::warn!(feature = name, environment, "feature flag not found");
            return Ok(Decision::denied(REASON_NOT_FOUND));
        };
        let now = self.now();

        if !flag.enabled {
            let decision = decide(&flag, user, None, &[], &[], now)?;
            self.record(&flag, &user.id, EventType::Disabled, None).await;
            return Ok(decision);
        }

        // Check existing assignment first (for consistency)
        if let Some(existing) = self.store.assignment(&user.id, flag.id).await? {
            let decision = decide(&flag, user, Some(&existing), &[], &[], now)?;
            self.record(&flag, &user.id, event_for(&decision), None).await;
            return Ok(decision);
        }

        let (targeting, segments) = if flag.rollout_strategy == RolloutStrategy::Segment {
            (
                self.store.targeting_for_flag(flag.id).await?,
                self.store.list_segments().await?,
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let decision = decide(&flag, user, None, &targeting, &segments, now)?;

        // A concurrent evaluation may have stored first; its row wins
        let stored = self
            .store
            .insert_assignment(&Assignment {
                user_id: user.id.clone(),
                flag_id: flag.id,
                assigned: decision.assigned,
                reason: decision.reason.clone(),
                assigned_at: now,
            })
            .await?;
        let decision = Decision::from(&stored);

        tracing::debug!(
            feature = name,
            user_id = %user.id,
            assigned = decision.assigned,
            reason = %decision.reason,
            "new assignment"
        );

        self.record(
            &flag,
            &user.id,
            event_for(&decision),
            Some(json!({
                "strategy": flag.rollout_strategy.as_str(),
                "percentage": flag.rollout_percentage,
            })),
        )
        .await;

        Ok(decision)
    }

    // Get feature flag with caching
    async fn get_flag(&self, name: &str, environment: &str) -> Result<Option<FlagDefinition>> {
        if let Some(flag) = self.cache.get(name, environment) {
            return Ok(Some(flag));
        }

        let generation = self.cache.generation();
        let flag = self.store.flag_by_name(name, environment).await?;
        if let Some(ref f) = flag {
            if !self.cache.insert(f.clone(), generation) {
                tracing::debug!(feature = name, environment, "cache invalidated during lookup, not caching");
            }
        }
        Ok(flag)
    }

    /// Whole-flag switch, ignoring rollout strategy. Missing flags are off.
    pub async fn flag_enabled(&self, name: &str, environment: &str) -> Result<bool> {
        Ok(self
            .get_flag(name, environment)
            .await?
            .map(|flag| flag.enabled)
            .unwrap_or(false))
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    async fn record(
        &self,
        flag: &FlagDefinition,
        user_id: &str,
        event_type: EventType,
        event_data: Option<serde_json::Value>,
    ) {
        if !self.analytics_enabled {
            return;
        }

        let event = AnalyticsEvent {
            flag_id: flag.id,
            user_id: user_id.to_string(),
            event_type,
            event_data,
            timestamp: self.now(),
        };
        if let Err(e) = self.store.record_event(&event).await {
            tracing::warn!(feature = %flag.name, error = %e, "failed to record feature analytics");
        }
    }

    pub async fn list_flags(&self, environment: &str) -> Result<Vec<FlagDefinition>> {
        self.store.list_flags(environment).await
    }

    pub async fn upsert_flag(&self, flag: NewFlag) -> Result<FlagDefinition> {
        validate_rollout_percentage(flag.rollout_percentage)?;
        let environment = flag
            .environment
            .clone()
            .unwrap_or_else(|| self.default_environment.clone());

        let stored = self.store.upsert_flag(&flag, &environment).await?;
        self.cache.invalidate(&stored.name);
        tracing::info!(feature = %stored.name, environment = %stored.environment, "feature flag saved");
        Ok(stored)
    }

    pub async fn set_enabled(&self, name: &str, environment: &str, enabled: bool) -> Result<FlagDefinition> {
        let flag = self
            .store
            .set_enabled(name, environment, enabled)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("feature flag '{}'", name)))?;
        self.cache.invalidate(name);
        tracing::info!(feature = name, environment, enabled, "feature flag toggled");
        Ok(flag)
    }

    /// Existing assignments are left alone; only unassigned users see the new percentage.
    pub async fn update_rollout_percentage(
        &self,
        name: &str,
        environment: &str,
        percentage: i32,
        changed_by: &str,
    ) -> Result<FlagDefinition> {
        validate_rollout_percentage(percentage)?;
        let flag = self
            .store
            .update_rollout_percentage(name, environment, percentage, changed_by)
            .await?;
        self.cache.invalidate(name);
        tracing::info!(feature = name, environment, percentage, changed_by, "rollout percentage updated");
        Ok(flag)
    }

    /// Forget every stored assignment so the next evaluation re-buckets users.
    pub async fn reset_assignments(&self, name: &str, environment: &str) -> Result<u64> {
        let flag = self.require_flag(name, environment).await?;
        let removed = self.store.delete_assignments(flag.id).await?;
        tracing::info!(feature = name, environment, removed, "assignments reset");
        Ok(removed)
    }

    pub async fn list_segments(&self) -> Result<Vec<Segment>> {
        self.store.list_segments().await
    }

    /// Records a `used` event; returns whether analytics are on.
    pub async fn record_usage(
        &self,
        name: &str,
        environment: &str,
        user_id: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<bool> {
        validate_user_id(user_id)?;
        let flag = self.require_flag(name, environment).await?;
        self.record(&flag, user_id, EventType::Used, payload).await;
        Ok(self.analytics_enabled)
    }

    pub async fn analytics(&self, name: &str, environment: &str, days: i64) -> Result<AnalyticsSummary> {
        if !(1..=MAX_ANALYTICS_DAYS).contains(&days) {
            return Err(ServiceError::InvalidArgument(format!(
                "days must be between 1 and {}, got {}",
                MAX_ANALYTICS_DAYS, days
            )));
        }
        let flag = self.require_flag(name, environment).await?;
        let since = TimeDelta::try_days(days)
            .and_then(|window| self.now().checked_sub_signed(window))
            .ok_or_else(|| ServiceError::InvalidArgument(format!("analytics window of {} days is out of range", days)))?;

        let counts = self.store.daily_counts(flag.id, since).await?;
        let total_users = self.store.distinct_users(flag.id, since).await?;

        let mut summary = AnalyticsSummary {
            total_users,
            enabled_count: 0,
            disabled_count: 0,
            usage_count: 0,
            daily_breakdown: BTreeMap::new(),
        };
        for row in counts {
            let day = summary.daily_breakdown.entry(row.date).or_default();
            match row.event_type {
                EventType::Enabled => {
                    summary.enabled_count += row.count;
                    day.enabled = row.count;
                }
                EventType::Disabled => {
                    summary.disabled_count += row.count;
                    day.disabled = row.count;
                }
                EventType::Used => {
                    summary.usage_count += row.count;
                    day.used = row.count;
                }
            }
        }

        Ok(summary)
    }

    /// Emergency kill switch: disable every flag and drop all cached snapshots.
    pub async fn kill_switch(&self) -> Result<u64> {
        let disabled = self.store.disable_all().await?;
        self.cache.clear();
        tracing::warn!(disabled, "EMERGENCY: all features have been disabled");
        Ok(disabled)
    }

    async fn require_flag(&self, name: &str, environment: &str) -> Result<FlagDefinition> {
        self.store
            .flag_by_name(name, environment)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("feature flag '{}'", name)))
    }
}

fn event_for(decision: &Decision) -> EventType {
    if decision.assigned {
        EventType::Enabled
    } else {
        EventType::Disabled
    }
}
