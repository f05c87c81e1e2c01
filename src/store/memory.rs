use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::{AnalyticsEvent, DailyCount, EventType, FlagStore, NewFlag};
use crate::cache::Clock;
use crate::error::{Result, ServiceError};
use crate::evaluation::{
    Assignment, CustomRule, FlagDefinition, RolloutStrategy, RuleOperator, Segment, SegmentCriteria,
    Targeting,
};

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub flag_id: Uuid,
    pub old_percentage: i32,
    pub new_percentage: i32,
    pub changed_by: String,
}

#[derive(Default)]
struct Inner {
    flags: Vec<FlagDefinition>,
    segments: Vec<Segment>,
    targeting: Vec<Targeting>,
    assignments: HashMap<(String, Uuid), Assignment>,
    events: Vec<AnalyticsEvent>,
    history: Vec<HistoryEntry>,
}

/// Process-local store used when no database is configured, and by tests.
pub struct InMemoryFlagStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    #[cfg(test)]
    unavailable: AtomicBool,
}

impl InMemoryFlagStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            #[cfg(test)]
            unavailable: AtomicBool::new(false),
        }
    }

    /// Store preloaded with a handful of demo flags and segments.
    pub fn with_sample_data(clock: Arc<dyn Clock>) -> Self {
        let store = Self::new(clock);

        let flags = [
            ("new_dashboard", "New user dashboard", true, 25, RolloutStrategy::Percentage),
            ("payment_v2", "New payment processing", true, 10, RolloutStrategy::Gradual),
            ("beta_search", "Beta search", true, 50, RolloutStrategy::Segment),
            ("dark_mode", "Dark mode theme", true, 75, RolloutStrategy::Percentage),
            ("advanced_analytics", "Advanced analytics", false, 0, RolloutStrategy::Percentage),
            // whole-route switches behind the gated endpoints
            ("user-registration", "User registration", true, 100, RolloutStrategy::Default),
            ("payment-gateway", "Payment processing", false, 100, RolloutStrategy::Default),
            ("email-notifications", "Email notification system", true, 100, RolloutStrategy::Default),
            ("beta-features", "Beta features for testing", false, 100, RolloutStrategy::Default),
        ];
        for (name, description, enabled, pct, strategy) in flags {
            store.insert_flag(name, Some(description), enabled, pct, strategy, "production");
        }

        store.add_segment(
            "premium_users",
            SegmentCriteria {
                role: Some(vec!["premium".to_string(), "enterprise".to_string()]),
                ..Default::default()
            },
        );
        let beta = store.add_segment(
            "beta_testers",
            SegmentCriteria {
                custom_rules: vec![CustomRule {
                    field: "beta_tester".to_string(),
                    operator: RuleOperator::Equals,
                    value: json!(true),
                }],
                ..Default::default()
            },
        );
        store.add_segment(
            "power_users",
            SegmentCriteria {
                custom_rules: vec![CustomRule {
                    field: "login_count".to_string(),
                    operator: RuleOperator::GreaterThan,
                    value: json!(50),
                }],
                ..Default::default()
            },
        );

        let beta_search = store.inner.lock().flags.iter().find(|f| f.name == "beta_search").map(|f| f.id);
        if let Some(flag_id) = beta_search {
            store.add_targeting(flag_id, beta.id, true, 100);
        }

        store
    }

    pub fn insert_flag(
        &self,
        name: &str,
        description: Option<&str>,
        enabled: bool,
        rollout_percentage: i32,
        rollout_strategy: RolloutStrategy,
        environment: &str,
    ) -> FlagDefinition {
        let now = self.clock.now();
        let flag = FlagDefinition {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.map(str::to_string),
            enabled,
            rollout_percentage,
            rollout_strategy,
            environment: environment.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().flags.push(flag.clone());
        flag
    }

    pub fn add_segment(&self, name: &str, criteria: SegmentCriteria) -> Segment {
        let segment = Segment {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            criteria,
            created_at: self.clock.now(),
        };
        self.inner.lock().segments.push(segment.clone());
        segment
    }

    pub fn add_targeting(&self, flag_id: Uuid, segment_id: Uuid, enabled: bool, rollout_percentage: i32) -> Targeting {
        let targeting = Targeting {
            id: Uuid::new_v4(),
            flag_id,
            segment_id,
            enabled,
            rollout_percentage,
            created_at: self.clock.now(),
        };
        self.inner.lock().targeting.push(targeting.clone());
        targeting
    }

    #[cfg(test)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.inner.lock().events.clone()
    }

    #[cfg(test)]
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.lock().history.clone()
    }

    #[cfg(test)]
    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ServiceError::UpstreamUnavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FlagStore for InMemoryFlagStore {
    async fn flag_by_name(&self, name: &str, environment: &str) -> Result<Option<FlagDefinition>> {
        self.check()?;
        let inner = self.inner.lock();
        Ok(inner
            .flags
            .iter()
            .find(|f| f.name == name && f.environment == environment)
            .cloned())
    }

    async fn list_flags(&self, environment: &str) -> Result<Vec<FlagDefinition>> {
        self.check()?;
        let mut flags: Vec<FlagDefinition> = self
            .inner
            .lock()
            .flags
            .iter()
            .filter(|f| f.environment == environment)
            .cloned()
            .collect();
        flags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flags)
    }

    async fn upsert_flag(&self, flag: &NewFlag, environment: &str) -> Result<FlagDefinition> {
        self.check()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if let Some(existing) = inner
            .flags
            .iter_mut()
            .find(|f| f.name == flag.name && f.environment == environment)
        {
            existing.description = flag.description.clone();
            existing.enabled = flag.enabled;
            existing.rollout_percentage = flag.rollout_percentage;
            existing.rollout_strategy = flag.rollout_strategy;
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let created = FlagDefinition {
            id: Uuid::new_v4(),
            name: flag.name.clone(),
            description: flag.description.clone(),
            enabled: flag.enabled,
            rollout_percentage: flag.rollout_percentage,
            rollout_strategy: flag.rollout_strategy,
            environment: environment.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.flags.push(created.clone());
        Ok(created)
    }

    async fn set_enabled(&self, name: &str, environment: &str, enabled: bool) -> Result<Option<FlagDefinition>> {
        self.check()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        Ok(inner
            .flags
            .iter_mut()
            .find(|f| f.name == name && f.environment == environment)
            .map(|f| {
                f.enabled = enabled;
                f.updated_at = now;
                f.clone()
            }))
    }

    async fn update_rollout_percentage(
        &self,
        name: &str,
        environment: &str,
        percentage: i32,
        changed_by: &str,
    ) -> Result<FlagDefinition> {
        self.check()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let flag = inner
            .flags
            .iter_mut()
            .find(|f| f.name == name && f.environment == environment)
            .ok_or_else(|| ServiceError::NotFound(format!("feature flag '{}'", name)))?;

        let entry = HistoryEntry {
            flag_id: flag.id,
            old_percentage: flag.rollout_percentage,
            new_percentage: percentage,
            changed_by: changed_by.to_string(),
        };
        flag.rollout_percentage = percentage;
        flag.updated_at = now;
        let updated = flag.clone();

        inner.history.push(entry);
        Ok(updated)
    }

    async fn targeting_for_flag(&self, flag_id: Uuid) -> Result<Vec<Targeting>> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .targeting
            .iter()
            .filter(|t| t.flag_id == flag_id)
            .cloned()
            .collect())
    }

    async fn list_segments(&self) -> Result<Vec<Segment>> {
        self.check()?;
        let mut segments = self.inner.lock().segments.clone();
        segments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(segments)
    }

    async fn assignment(&self, user_id: &str, flag_id: Uuid) -> Result<Option<Assignment>> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .assignments
            .get(&(user_id.to_string(), flag_id))
            .cloned())
    }

    async fn insert_assignment(&self, assignment: &Assignment) -> Result<Assignment> {
        self.check()?;
        let mut inner = self.inner.lock();
        let stored = inner
            .assignments
            .entry((assignment.user_id.clone(), assignment.flag_id))
            .or_insert_with(|| assignment.clone());
        Ok(stored.clone())
    }

    async fn delete_assignments(&self, flag_id: Uuid) -> Result<u64> {
        self.check()?;
        let mut inner = self.inner.lock();
        let before = inner.assignments.len();
        inner.assignments.retain(|(_, id), _| *id != flag_id);
        Ok((before - inner.assignments.len()) as u64)
    }

    async fn record_event(&self, event: &AnalyticsEvent) -> Result<()> {
        self.check()?;
        self.inner.lock().events.push(event.clone());
        Ok(())
    }

    async fn daily_counts(&self, flag_id: Uuid, since: DateTime<Utc>) -> Result<Vec<DailyCount>> {
        self.check()?;
        let inner = self.inner.lock();

        let mut counts: BTreeMap<(NaiveDate, &'static str), (EventType, i64)> = BTreeMap::new();
        for event in inner
            .events
            .iter()
            .filter(|e| e.flag_id == flag_id && e.timestamp >= since)
        {
            let key = (event.timestamp.date_naive(), event.event_type.as_str());
            counts.entry(key).or_insert((event.event_type, 0)).1 += 1;
        }

        // newest day first, event types alphabetical within a day
        let mut rows: Vec<DailyCount> = counts
            .into_iter()
            .map(|((date, _), (event_type, count))| DailyCount { date, event_type, count })
            .collect();
        rows.sort_by(|a, b| b.date.cmp(&a.date).then(a.event_type.as_str().cmp(b.event_type.as_str())));
        Ok(rows)
    }

    async fn distinct_users(&self, flag_id: Uuid, since: DateTime<Utc>) -> Result<i64> {
        self.check()?;
        let inner = self.inner.lock();
        let users: HashSet<&str> = inner
            .events
            .iter()
            .filter(|e| e.flag_id == flag_id && e.timestamp >= since)
            .map(|e| e.user_id.as_str())
            .collect();
        Ok(users.len() as i64)
    }

    async fn disable_all(&self) -> Result<u64> {
        self.check()?;
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let mut changed = 0;
        for flag in inner.flags.iter_mut().filter(|f| f.enabled) {
            flag.enabled = false;
            flag.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SystemClock;

    fn store() -> InMemoryFlagStore {
        InMemoryFlagStore::new(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_insert_assignment_keeps_first() {
        let store = store();
        let flag = store.insert_flag("dark_mode", None, true, 50, RolloutStrategy::Percentage, "production");
        let first = Assignment {
            user_id: "user123".to_string(),
            flag_id: flag.id,
            assigned: true,
            reason: "percentage_rollout_50".to_string(),
            assigned_at: Utc::now(),
        };
        let second = Assignment {
            assigned: false,
            reason: "percentage_rollout_0".to_string(),
            ..first.clone()
        };

        assert_eq!(store.insert_assignment(&first).await.unwrap(), first);
        assert_eq!(store.insert_assignment(&second).await.unwrap(), first);
        assert_eq!(store.delete_assignments(flag.id).await.unwrap(), 1);
        assert!(store.assignment("user123", flag.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_rollout_records_history() {
        let store = store();
        store.insert_flag("payment_v2", None, true, 10, RolloutStrategy::Gradual, "production");

        let updated = store
            .update_rollout_percentage("payment_v2", "production", 40, "admin")
            .await
            .unwrap();
        assert_eq!(updated.rollout_percentage, 40);

        let history = store.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_percentage, 10);
        assert_eq!(history[0].new_percentage, 40);
        assert_eq!(history[0].changed_by, "admin");

        assert!(matches!(
            store.update_rollout_percentage("missing", "production", 40, "admin").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sample_data_is_wired() {
        let store = InMemoryFlagStore::with_sample_data(Arc::new(SystemClock));
        let flags = store.list_flags("production").await.unwrap();
        assert_eq!(flags.len(), 9);
        assert_eq!(flags[0].name, "advanced_analytics");

        let beta = store.flag_by_name("beta_search", "production").await.unwrap().unwrap();
        assert_eq!(store.targeting_for_flag(beta.id).await.unwrap().len(), 1);
        assert_eq!(store.list_segments().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = store();
        store.set_unavailable(true);
        assert!(matches!(
            store.list_flags("production").await,
            Err(ServiceError::UpstreamUnavailable(_))
        ));
    }
}
