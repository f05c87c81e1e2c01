use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{AnalyticsEvent, DailyCount, EventType, FlagStore, NewFlag};
use crate::error::{Result, ServiceError};
use crate::evaluation::{Assignment, FlagDefinition, Segment, SegmentCriteria, Targeting};

// Database row types

#[derive(Debug, sqlx::FromRow)]
struct FlagRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    enabled: bool,
    rollout_percentage: i32,
    rollout_strategy: String,
    environment: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<FlagRow> for FlagDefinition {
    fn from(row: FlagRow) -> Self {
        FlagDefinition {
            id: row.id,
            name: row.name,
            description: row.description,
            enabled: row.enabled,
            rollout_percentage: row.rollout_percentage,
            rollout_strategy: row.rollout_strategy.as_str().into(),
            environment: row.environment,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TargetingRow {
    id: Uuid,
    feature_flag_id: Uuid,
    segment_id: Uuid,
    enabled: bool,
    rollout_percentage: i32,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct SegmentRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    criteria: Json<SegmentCriteria>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct AssignmentRow {
    user_id: String,
    feature_flag_id: Uuid,
    assigned: bool,
    assignment_reason: String,
    assigned_at: DateTime<Utc>,
}

impl From<AssignmentRow> for Assignment {
    fn from(row: AssignmentRow) -> Self {
        Assignment {
            user_id: row.user_id,
            flag_id: row.feature_flag_id,
            assigned: row.assigned,
            reason: row.assignment_reason,
            assigned_at: row.assigned_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DailyCountRow {
    date: NaiveDate,
    event_type: String,
    count: i64,
}

const FLAG_COLUMNS: &str = "id, name, description, enabled, rollout_percentage, rollout_strategy, environment, created_at, updated_at";

#[derive(Clone)]
pub struct PgFlagStore {
    db: PgPool,
}

impl PgFlagStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FlagStore for PgFlagStore {
    async fn flag_by_name(&self, name: &str, environment: &str) -> Result<Option<FlagDefinition>> {
        let row = sqlx::query_as::<_, FlagRow>(&format!(
            "SELECT {FLAG_COLUMNS} FROM feature_flags WHERE name = $1 AND environment = $2"
        ))
        .bind(name)
        .bind(environment)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(FlagDefinition::from))
    }

    async fn list_flags(&self, environment: &str) -> Result<Vec<FlagDefinition>> {
        let rows = sqlx::query_as::<_, FlagRow>(&format!(
            "SELECT {FLAG_COLUMNS} FROM feature_flags WHERE environment = $1 ORDER BY name"
        ))
        .bind(environment)
        .fetch_all(&self.db)
        .await?;

        Ok(rows.into_iter().map(FlagDefinition::from).collect())
    }

    async fn upsert_flag(&self, flag: &NewFlag, environment: &str) -> Result<FlagDefinition> {
        let row = sqlx::query_as::<_, FlagRow>(&format!(
            r#"
            INSERT INTO feature_flags (name, description, enabled, rollout_percentage, rollout_strategy, environment, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name, environment)
            DO UPDATE SET
                description = EXCLUDED.description,
                enabled = EXCLUDED.enabled,
                rollout_percentage = EXCLUDED.rollout_percentage,
                rollout_strategy = EXCLUDED.rollout_strategy,
                updated_at = NOW()
            RETURNING {FLAG_COLUMNS}
            "#
        ))
        .bind(&flag.name)
        .bind(&flag.description)
        .bind(flag.enabled)
        .bind(flag.rollout_percentage)
        .bind(flag.rollout_strategy.as_str())
        .bind(environment)
        .bind(&flag.created_by)
        .fetch_one(&self.db)
        .await?;

        Ok(row.into())
    }

    async fn set_enabled(&self, name: &str, environment: &str, enabled: bool) -> Result<Option<FlagDefinition>> {
        let row = sqlx::query_as::<_, FlagRow>(&format!(
            r#"
            UPDATE feature_flags
            SET enabled = $3, updated_at = NOW()
            WHERE name = $1 AND environment = $2
            RETURNING {FLAG_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(environment)
        .bind(enabled)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(FlagDefinition::from))
    }

    async fn update_rollout_percentage(
        &self,
        name: &str,
        environment: &str,
        percentage: i32,
        changed_by: &str,
    ) -> Result<FlagDefinition> {
        let mut tx = self.db.begin().await?;

        let current = sqlx::query_as::<_, FlagRow>(&format!(
            "SELECT {FLAG_COLUMNS} FROM feature_flags WHERE name = $1 AND environment = $2 FOR UPDATE"
        ))
        .bind(name)
        .bind(environment)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("feature flag '{}'", name)))?;

        let updated = sqlx::query_as::<_, FlagRow>(&format!(
            r#"
            UPDATE feature_flags
            SET rollout_percentage = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {FLAG_COLUMNS}
            "#
        ))
        .bind(current.id)
        .bind(percentage)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO feature_flag_history (feature_flag_id, action, old_values, new_values, changed_by)
            VALUES ($1, 'rollout_updated', $2, $3, $4)
            "#,
        )
        .bind(current.id)
        .bind(Json(serde_json::json!({ "rollout_percentage": current.rollout_percentage })))
        .bind(Json(serde_json::json!({ "rollout_percentage": percentage })))
        .bind(changed_by)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(updated.into())
    }

    async fn targeting_for_flag(&self, flag_id: Uuid) -> Result<Vec<Targeting>> {
        let rows = sqlx::query_as::<_, TargetingRow>(
            r#"
            SELECT id, feature_flag_id, segment_id, enabled, rollout_percentage, created_at
            FROM feature_targeting
            WHERE feature_flag_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(flag_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|t| Targeting {
                id: t.id,
                flag_id: t.feature_flag_id,
                segment_id: t.segment_id,
                enabled: t.enabled,
                rollout_percentage: t.rollout_percentage,
                created_at: t.created_at,
            })
            .collect())
    }

    async fn list_segments(&self) -> Result<Vec<Segment>> {
        let rows = sqlx::query_as::<_, SegmentRow>(
            "SELECT id, name, description, criteria, created_at FROM user_segments ORDER BY name",
        )
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|s| Segment {
                id: s.id,
                name: s.name,
                description: s.description,
                criteria: s.criteria.0,
                created_at: s.created_at,
            })
            .collect())
    }

    async fn assignment(&self, user_id: &str, flag_id: Uuid) -> Result<Option<Assignment>> {
        let row = sqlx::query_as::<_, AssignmentRow>(
            r#"
            SELECT user_id, feature_flag_id, assigned, assignment_reason, assigned_at
            FROM user_feature_assignments
            WHERE user_id = $1 AND feature_flag_id = $2
            "#,
        )
        .bind(user_id)
        .bind(flag_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(Assignment::from))
    }

    async fn insert_assignment(&self, assignment: &Assignment) -> Result<Assignment> {
        // DO NOTHING keeps the first stored decision when two evaluations race
        sqlx::query(
            r#"
            INSERT INTO user_feature_assignments (user_id, feature_flag_id, assigned, assignment_reason, assigned_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, feature_flag_id) DO NOTHING
            "#,
        )
        .bind(&assignment.user_id)
        .bind(assignment.flag_id)
        .bind(assignment.assigned)
        .bind(&assignment.reason)
        .bind(assignment.assigned_at)
        .execute(&self.db)
        .await?;

        self.assignment(&assignment.user_id, assignment.flag_id)
            .await?
            .ok_or_else(|| ServiceError::UpstreamUnavailable("assignment vanished after insert".to_string()))
    }

    async fn delete_assignments(&self, flag_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM user_feature_assignments WHERE feature_flag_id = $1")
            .bind(flag_id)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }

    async fn record_event(&self, event: &AnalyticsEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feature_analytics (feature_flag_id, user_id, event_type, event_data, occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.flag_id)
        .bind(&event.user_id)
        .bind(event.event_type.as_str())
        .bind(event.event_data.clone().map(Json))
        .bind(event.timestamp)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn daily_counts(&self, flag_id: Uuid, since: DateTime<Utc>) -> Result<Vec<DailyCount>> {
        let rows = sqlx::query_as::<_, DailyCountRow>(
            r#"
            SELECT DATE(occurred_at) AS date, event_type, COUNT(*) AS count
            FROM feature_analytics
            WHERE feature_flag_id = $1 AND occurred_at >= $2
            GROUP BY DATE(occurred_at), event_type
            ORDER BY date DESC, event_type
            "#,
        )
        .bind(flag_id)
        .bind(since)
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let event_type = EventType::parse(&r.event_type)?;
                Some(DailyCount {
                    date: r.date,
                    event_type,
                    count: r.count,
                })
            })
            .collect())
    }

    async fn distinct_users(&self, flag_id: Uuid, since: DateTime<Utc>) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(DISTINCT user_id)
            FROM feature_analytics
            WHERE feature_flag_id = $1 AND occurred_at >= $2
            "#,
        )
        .bind(flag_id)
        .bind(since)
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }

    async fn disable_all(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE feature_flags SET enabled = false, updated_at = NOW() WHERE enabled")
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.db).await?;
        Ok(())
    }
}
