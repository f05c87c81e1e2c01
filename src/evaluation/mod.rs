mod bucket;
mod segment;

pub use bucket::in_rollout;
pub use segment::{CustomRule, RuleOperator, Segment, SegmentCriteria};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, ServiceError};

/// Window over which a gradual flag ramps from 0 to its configured percentage.
pub const GRADUAL_WINDOW: Duration = Duration::days(7);

pub const REASON_DISABLED: &str = "disabled";
pub const REASON_SEGMENT: &str = "segment_based";
pub const REASON_GRADUAL: &str = "gradual_rollout";
pub const REASON_DEFAULT: &str = "default";

// User context for evaluation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub segment: Option<String>,
    #[serde(default)]
    pub registration_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_role() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStrategy {
    Percentage,
    Segment,
    Gradual,
    #[serde(other)]
    Default,
}

impl RolloutStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStrategy::Percentage => "percentage",
            RolloutStrategy::Segment => "segment",
            RolloutStrategy::Gradual => "gradual",
            RolloutStrategy::Default => "default",
        }
    }
}

/// Stored strategies outside the known set (e.g. `user_list`) fall back to `Default`.
impl From<&str> for RolloutStrategy {
    fn from(value: &str) -> Self {
        match value {
            "percentage" => RolloutStrategy::Percentage,
            "segment" => RolloutStrategy::Segment,
            "gradual" => RolloutStrategy::Gradual,
            _ => RolloutStrategy::Default,
        }
    }
}

impl fmt::Display for RolloutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Flag data needed for evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagDefinition {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub rollout_percentage: i32,
    pub rollout_strategy: RolloutStrategy,
    pub environment: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Binds a flag to a segment with its own rollout percentage inside that segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Targeting {
    pub id: Uuid,
    pub flag_id: Uuid,
    pub segment_id: Uuid,
    pub enabled: bool,
    pub rollout_percentage: i32,
    pub created_at: DateTime<Utc>,
}

/// Sticky per-user outcome; never flips once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub user_id: String,
    pub flag_id: Uuid,
    pub assigned: bool,
    pub reason: String,
    pub assigned_at: DateTime<Utc>,
}

// Flag evaluation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub assigned: bool,
    pub reason: String,
}

impl Decision {
    pub fn new(assigned: bool, reason: impl Into<String>) -> Self {
        Self {
            assigned,
            reason: reason.into(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self::new(false, reason)
    }
}

impl From<&Assignment> for Decision {
    fn from(a: &Assignment) -> Self {
        Decision::new(a.assigned, a.reason.clone())
    }
}

/// Checks if percentage number is between the number 0 to 100
pub fn validate_rollout_percentage(percentage: i32) -> Result<()> {
    if !(0..=100).contains(&percentage) {
        return Err(ServiceError::InvalidArgument(format!(
            "rollout percentage must be between 0 and 100, got {}",
            percentage
        )));
    }
    Ok(())
}

pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(ServiceError::InvalidArgument("user id cannot be empty".to_string()));
    }
    Ok(())
}

/// Decide whether `flag` is on for `user`.
///
/// Pure: the result depends only on the arguments. `targeting` and `segments`
/// are only consulted for the segment strategy, `now` only for the gradual one.
/// The caller persists the returned decision when `existing` was `None`.
pub fn decide(
    flag: &FlagDefinition,
    user: &UserContext,
    existing: Option<&Assignment>,
    targeting: &[Targeting],
    segments: &[Segment],
    now: DateTime<Utc>,
) -> Result<Decision> {
    // Step 1: a disabled flag wins over everything, including stored assignments
    if !flag.enabled {
        return Ok(Decision::denied(REASON_DISABLED));
    }

    validate_user_id(&user.id)?;
    validate_rollout_percentage(flag.rollout_percentage)?;

    // Step 2: stored assignments are returned verbatim
    if let Some(assignment) = existing {
        return Ok(Decision::from(assignment));
    }

    // Step 3: strategy dispatch
    let decision = match flag.rollout_strategy {
        RolloutStrategy::Percentage => Decision::new(
            in_rollout(&user.id, flag.rollout_percentage),
            format!("percentage_rollout_{}", flag.rollout_percentage),
        ),
        RolloutStrategy::Segment => {
            Decision::new(segment_rollout(user, targeting, segments)?, REASON_SEGMENT)
        }
        RolloutStrategy::Gradual => {
            let effective = gradual_percentage(flag.rollout_percentage, flag.created_at, now);
            Decision::new(in_rollout(&user.id, effective), REASON_GRADUAL)
        }
        RolloutStrategy::Default => Decision::new(flag.rollout_percentage >= 100, REASON_DEFAULT),
    };

    Ok(decision)
}

/// First enabled targeting row whose segment matches decides; list order is precedence.
fn segment_rollout(user: &UserContext, targeting: &[Targeting], segments: &[Segment]) -> Result<bool> {
    for target in targeting.iter().filter(|t| t.enabled) {
        let Some(segment) = segments.iter().find(|s| s.id == target.segment_id) else {
            continue;
        };

        if segment.criteria.matches(user) {
            validate_rollout_percentage(target.rollout_percentage)?;
            return Ok(in_rollout(&user.id, target.rollout_percentage));
        }
    }

    Ok(false)
}

/// Linear ramp from 0 at `started_at` to `target` after [`GRADUAL_WINDOW`].
pub fn gradual_percentage(target: i32, started_at: DateTime<Utc>, now: DateTime<Utc>) -> i32 {
    let elapsed = (now - started_at).num_milliseconds().max(0);
    let window = GRADUAL_WINDOW.num_milliseconds();

    if elapsed >= window {
        return target;
    }

    ((elapsed as i128 * target as i128) / window as i128) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn flag(strategy: RolloutStrategy, percentage: i32) -> FlagDefinition {
        FlagDefinition {
            id: Uuid::nil(),
            name: "new_checkout".to_string(),
            description: None,
            enabled: true,
            rollout_percentage: percentage,
            rollout_strategy: strategy,
            environment: "production".to_string(),
            created_at: epoch(),
            updated_at: epoch(),
        }
    }

    fn user(id: &str, role: &str) -> UserContext {
        UserContext {
            id: id.to_string(),
            role: role.to_string(),
            ..Default::default()
        }
    }

    fn segment(roles: &[&str]) -> Segment {
        Segment {
            id: Uuid::new_v4(),
            name: "premium_users".to_string(),
            description: None,
            criteria: SegmentCriteria {
                role: Some(roles.iter().map(|r| r.to_string()).collect()),
                ..Default::default()
            },
            created_at: epoch(),
        }
    }

    fn targeting(flag_id: Uuid, segment: &Segment, enabled: bool, percentage: i32) -> Targeting {
        Targeting {
            id: Uuid::new_v4(),
            flag_id,
            segment_id: segment.id,
            enabled,
            rollout_percentage: percentage,
            created_at: epoch(),
        }
    }

    fn run(flag: &FlagDefinition, user: &UserContext) -> Decision {
        decide(flag, user, None, &[], &[], epoch()).unwrap()
    }

    #[test]
    fn test_globally_disabled_flag() {
        let mut f = flag(RolloutStrategy::Percentage, 100);
        f.enabled = false;
        let existing = Assignment {
            user_id: "user123".to_string(),
            flag_id: f.id,
            assigned: true,
            reason: "percentage_rollout_100".to_string(),
            assigned_at: epoch(),
        };

        let result = decide(&f, &user("user123", "user"), Some(&existing), &[], &[], epoch()).unwrap();
        assert_eq!(result, Decision::denied("disabled"));
    }

    #[test]
    fn test_percentage_example_is_pinned() {
        // bucket("user123") == 89
        let result = run(&flag(RolloutStrategy::Percentage, 25), &user("user123", "user"));
        assert_eq!(result, Decision::new(false, "percentage_rollout_25"));

        let result = run(&flag(RolloutStrategy::Percentage, 25), &user("bob", "user"));
        assert_eq!(result, Decision::new(true, "percentage_rollout_25"));
    }

    #[test]
    fn test_percentage_boundaries() {
        for id in ["user123", "bob", "alice", "user_42"] {
            assert!(!run(&flag(RolloutStrategy::Percentage, 0), &user(id, "user")).assigned);
            assert!(run(&flag(RolloutStrategy::Percentage, 100), &user(id, "user")).assigned);
        }
    }

    #[test]
    fn test_existing_assignment_survives_percentage_change() {
        let mut f = flag(RolloutStrategy::Percentage, 100);
        let u = user("user123", "user");
        let first = run(&f, &u);
        assert!(first.assigned);

        let stored = Assignment {
            user_id: u.id.clone(),
            flag_id: f.id,
            assigned: first.assigned,
            reason: first.reason.clone(),
            assigned_at: epoch(),
        };

        f.rollout_percentage = 0;
        let again = decide(&f, &u, Some(&stored), &[], &[], epoch()).unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn test_decide_is_deterministic() {
        let f = flag(RolloutStrategy::Percentage, 50);
        for i in 0..50 {
            let u = user(&format!("user-{}", i), "user");
            assert_eq!(run(&f, &u), run(&f, &u));
        }
    }

    #[test]
    fn test_segment_no_match() {
        let f = flag(RolloutStrategy::Segment, 0);
        let seg = segment(&["premium", "enterprise"]);
        let rules = vec![targeting(f.id, &seg, true, 100)];

        let result = decide(&f, &user("user123", "user"), None, &rules, &[seg], epoch()).unwrap();
        assert_eq!(result, Decision::new(false, "segment_based"));
    }

    #[test]
    fn test_segment_match_uses_targeting_percentage() {
        let f = flag(RolloutStrategy::Segment, 0);
        let seg = segment(&["premium"]);
        let segments = vec![seg.clone()];

        let all = vec![targeting(f.id, &seg, true, 100)];
        let result = decide(&f, &user("user123", "premium"), None, &all, &segments, epoch()).unwrap();
        assert!(result.assigned);

        let none = vec![targeting(f.id, &seg, true, 0)];
        let result = decide(&f, &user("user123", "premium"), None, &none, &segments, epoch()).unwrap();
        assert!(!result.assigned);
    }

    #[test]
    fn test_segment_first_enabled_match_wins() {
        let f = flag(RolloutStrategy::Segment, 0);
        let broad = segment(&["premium", "user"]);
        let narrow = segment(&["premium"]);
        let segments = vec![broad.clone(), narrow.clone()];

        let rules = vec![
            targeting(f.id, &narrow, false, 100),
            targeting(f.id, &broad, true, 0),
            targeting(f.id, &narrow, true, 100),
        ];
        let result = decide(&f, &user("user123", "premium"), None, &rules, &segments, epoch()).unwrap();
        assert!(!result.assigned);
    }

    #[test]
    fn test_segment_skips_unknown_segment() {
        let f = flag(RolloutStrategy::Segment, 0);
        let seg = segment(&["premium"]);
        let orphan = segment(&["premium"]);
        let rules = vec![targeting(f.id, &orphan, true, 0), targeting(f.id, &seg, true, 100)];

        let result = decide(&f, &user("user123", "premium"), None, &rules, &[seg], epoch()).unwrap();
        assert!(result.assigned);
    }

    #[test]
    fn test_segment_custom_rule() {
        let f = flag(RolloutStrategy::Segment, 0);
        let mut seg = segment(&["user"]);
        seg.criteria.custom_rules.push(CustomRule {
            field: "beta_tester".to_string(),
            operator: RuleOperator::Equals,
            value: json!(true),
        });
        let rules = vec![targeting(f.id, &seg, true, 100)];
        let segments = vec![seg];

        let mut u = user("user123", "user");
        assert!(!decide(&f, &u, None, &rules, &segments, epoch()).unwrap().assigned);
        u.metadata.insert("beta_tester".to_string(), json!(true));
        assert!(decide(&f, &u, None, &rules, &segments, epoch()).unwrap().assigned);
    }

    #[test]
    fn test_gradual_ramp() {
        let f = flag(RolloutStrategy::Gradual, 100);
        let u = user("user123", "user");

        let at_start = decide(&f, &u, None, &[], &[], epoch()).unwrap();
        assert_eq!(at_start, Decision::new(false, "gradual_rollout"));

        let done = decide(&f, &u, None, &[], &[], epoch() + Duration::days(8)).unwrap();
        assert_eq!(done, Decision::new(true, "gradual_rollout"));

        assert_eq!(gradual_percentage(100, epoch(), epoch() + Duration::hours(84)), 50);
        assert_eq!(gradual_percentage(60, epoch(), epoch() + Duration::days(7)), 60);
        assert_eq!(gradual_percentage(60, epoch(), epoch() - Duration::days(1)), 0);
    }

    #[test]
    fn test_gradual_after_window_matches_percentage() {
        let gradual = flag(RolloutStrategy::Gradual, 40);
        let flat = flag(RolloutStrategy::Percentage, 40);
        let later = epoch() + GRADUAL_WINDOW;
        for i in 0..100 {
            let u = user(&format!("user-{}", i), "user");
            let g = decide(&gradual, &u, None, &[], &[], later).unwrap();
            let p = decide(&flat, &u, None, &[], &[], later).unwrap();
            assert_eq!(g.assigned, p.assigned);
        }
    }

    #[test]
    fn test_default_strategy() {
        assert_eq!(
            run(&flag(RolloutStrategy::Default, 100), &user("user123", "user")),
            Decision::new(true, "default")
        );
        assert_eq!(
            run(&flag(RolloutStrategy::Default, 99), &user("user123", "user")),
            Decision::new(false, "default")
        );
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let f = flag(RolloutStrategy::Percentage, 50);
        assert!(matches!(
            decide(&f, &user("", "user"), None, &[], &[], epoch()),
            Err(ServiceError::InvalidArgument(_))
        ));

        let bad = flag(RolloutStrategy::Percentage, 101);
        assert!(matches!(
            decide(&bad, &user("user123", "user"), None, &[], &[], epoch()),
            Err(ServiceError::InvalidArgument(_))
        ));
        assert!(validate_rollout_percentage(-1).is_err());
        assert!(validate_rollout_percentage(100).is_ok());
        assert!(validate_rollout_percentage(0).is_ok());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(RolloutStrategy::from("percentage"), RolloutStrategy::Percentage);
        assert_eq!(RolloutStrategy::from("gradual"), RolloutStrategy::Gradual);
        assert_eq!(RolloutStrategy::from("user_list"), RolloutStrategy::Default);
        let parsed: RolloutStrategy = serde_json::from_value(json!("user_list")).unwrap();
        assert_eq!(parsed, RolloutStrategy::Default);
    }
}
