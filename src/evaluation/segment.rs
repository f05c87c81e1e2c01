use chrono::{DateTime, NaiveDate, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use super::UserContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub criteria: SegmentCriteria,
    pub created_at: DateTime<Utc>,
}

/// All present criteria must hold for a user to match.
///
/// Stored as camelCase JSON (`registrationDateAfter`, `customRules`, ...);
/// snake_case keys are accepted too.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentCriteria {
    /// Role allow-list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Vec<String>>,

    /// Inclusive lower bound on the registration date
    #[serde(
        default,
        alias = "registration_date_after",
        deserialize_with = "lenient_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub registration_date_after: Option<DateTime<Utc>>,

    /// Inclusive upper bound on the registration date
    #[serde(
        default,
        alias = "registration_date_before",
        deserialize_with = "lenient_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub registration_date_before: Option<DateTime<Utc>>,

    /// Exact-match requirements on `user.metadata`
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,

    #[serde(default, alias = "custom_rules", skip_serializing_if = "Vec::is_empty")]
    pub custom_rules: Vec<CustomRule>,
}

/// RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
fn lenient_date<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };

    parse_date(&raw)
        .map(Some)
        .ok_or_else(|| de::Error::custom(format!("invalid date '{}'", raw)))
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomRule {
    pub field: String,
    pub operator: RuleOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    #[serde(other)]
    Unknown,
}

impl SegmentCriteria {
    pub fn matches(&self, user: &UserContext) -> bool {
        if let Some(ref roles) = self.role {
            if !roles.iter().any(|r| r == &user.role) {
                return false;
            }
        }

        // Date bounds only apply when the user carries a registration date
        if let Some(registered) = user.registration_date {
            if let Some(after) = self.registration_date_after {
                if registered < after {
                    return false;
                }
            }
            if let Some(before) = self.registration_date_before {
                if registered > before {
                    return false;
                }
            }
        }

        let metadata_matches = self
            .metadata
            .iter()
            .all(|(key, want)| user.metadata.get(key) == Some(want));

        metadata_matches && self.custom_rules.iter().all(|rule| rule.evaluate(user))
    }
}

impl CustomRule {
    pub fn evaluate(&self, user: &UserContext) -> bool {
        let user_value = user.metadata.get(&self.field);

        match self.operator {
            RuleOperator::Equals => user_value == Some(&self.value),
            RuleOperator::NotEquals => user_value != Some(&self.value),
            RuleOperator::Contains => match (user_value, &self.value) {
                (Some(Value::String(have)), Value::String(want)) => have.contains(want.as_str()),
                _ => false,
            },
            RuleOperator::GreaterThan => compare_numbers(user_value, &self.value, |a, b| a > b),
            RuleOperator::LessThan => compare_numbers(user_value, &self.value, |a, b| a < b),
            RuleOperator::Unknown => false,
        }
    }
}

fn compare_numbers(user_value: Option<&Value>, rule_value: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (user_value.and_then(Value::as_f64), rule_value.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn user(role: &str) -> UserContext {
        UserContext {
            id: "user123".to_string(),
            role: role.to_string(),
            ..Default::default()
        }
    }

    fn rule(field: &str, operator: RuleOperator, value: Value) -> CustomRule {
        CustomRule {
            field: field.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn test_role_allow_list() {
        let criteria = SegmentCriteria {
            role: Some(vec!["premium".to_string(), "enterprise".to_string()]),
            ..Default::default()
        };
        assert!(criteria.matches(&user("premium")));
        assert!(!criteria.matches(&user("user")));
    }

    #[test]
    fn test_empty_criteria_matches_everyone() {
        assert!(SegmentCriteria::default().matches(&user("anyone")));
    }

    #[test]
    fn test_registration_bounds_are_inclusive() {
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let before = Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap();
        let criteria = SegmentCriteria {
            registration_date_after: Some(after),
            registration_date_before: Some(before),
            ..Default::default()
        };

        let mut u = user("user");
        u.registration_date = Some(after);
        assert!(criteria.matches(&u));
        u.registration_date = Some(before);
        assert!(criteria.matches(&u));
        u.registration_date = Some(Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap());
        assert!(!criteria.matches(&u));
        u.registration_date = Some(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap());
        assert!(!criteria.matches(&u));

        // no registration date: bounds are skipped
        u.registration_date = None;
        assert!(criteria.matches(&u));
    }

    #[test]
    fn test_custom_rule_operators() {
        let mut u = user("user");
        u.metadata.insert("subscription".to_string(), json!("pro-annual"));
        u.metadata.insert("login_count".to_string(), json!(42));
        u.metadata.insert("beta_tester".to_string(), json!(true));

        assert!(rule("beta_tester", RuleOperator::Equals, json!(true)).evaluate(&u));
        assert!(!rule("beta_tester", RuleOperator::NotEquals, json!(true)).evaluate(&u));
        assert!(rule("missing", RuleOperator::NotEquals, json!("x")).evaluate(&u));
        assert!(!rule("missing", RuleOperator::Equals, json!("x")).evaluate(&u));
        assert!(rule("subscription", RuleOperator::Contains, json!("pro")).evaluate(&u));
        assert!(!rule("subscription", RuleOperator::Contains, json!("free")).evaluate(&u));
        assert!(rule("login_count", RuleOperator::GreaterThan, json!(10)).evaluate(&u));
        assert!(!rule("login_count", RuleOperator::LessThan, json!(10)).evaluate(&u));
        assert!(rule("login_count", RuleOperator::LessThan, json!(100.5)).evaluate(&u));
    }

    #[test]
    fn test_type_mismatch_is_false() {
        let mut u = user("user");
        u.metadata.insert("subscription".to_string(), json!("free"));
        u.metadata.insert("login_count".to_string(), json!(5));

        assert!(!rule("subscription", RuleOperator::GreaterThan, json!(1)).evaluate(&u));
        assert!(!rule("login_count", RuleOperator::Contains, json!("5")).evaluate(&u));
        assert!(!rule("login_count", RuleOperator::Unknown, json!(5)).evaluate(&u));
    }

    #[test]
    fn test_unknown_operator_deserializes() {
        let parsed: CustomRule =
            serde_json::from_value(json!({"field": "x", "operator": "regex", "value": ".*"})).unwrap();
        assert_eq!(parsed.operator, RuleOperator::Unknown);
    }

    #[test]
    fn test_all_rules_are_anded() {
        let criteria = SegmentCriteria {
            role: Some(vec!["user".to_string()]),
            custom_rules: vec![
                rule("beta_tester", RuleOperator::Equals, json!(true)),
                rule("login_count", RuleOperator::GreaterThan, json!(50)),
            ],
            ..Default::default()
        };
        let mut u = user("user");
        u.metadata.insert("beta_tester".to_string(), json!(true));
        u.metadata.insert("login_count".to_string(), json!(10));
        assert!(!criteria.matches(&u));
        u.metadata.insert("login_count".to_string(), json!(51));
        assert!(criteria.matches(&u));
    }

    #[test]
    fn test_stored_criteria_shapes() {
        let power: SegmentCriteria = serde_json::from_value(json!({
            "registrationDateAfter": "2024-01-01T00:00:00Z",
            "customRules": [{"field": "login_count", "operator": "greater_than", "value": 50}]
        }))
        .unwrap();
        assert_eq!(power.registration_date_after, Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        assert_eq!(power.custom_rules.len(), 1);

        let mut veteran = user("user");
        veteran.registration_date = Some(Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap());
        assert!(!power.matches(&veteran));

        let early: SegmentCriteria = serde_json::from_value(json!({"registrationDateAfter": "2024-01-01"})).unwrap();
        assert_eq!(early.registration_date_after, Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        assert!(!early.matches(&veteran));

        let legacy: SegmentCriteria =
            serde_json::from_value(json!({"registration_date_before": "2024-06-30", "custom_rules": []})).unwrap();
        assert!(legacy.registration_date_before.is_some());

        assert!(serde_json::from_value::<SegmentCriteria>(json!({"registrationDateAfter": "soon"})).is_err());
    }

    #[test]
    fn test_metadata_criteria_require_equal_values() {
        let beta: SegmentCriteria = serde_json::from_value(json!({"metadata": {"beta_tester": true}})).unwrap();

        let mut u = user("user");
        assert!(!beta.matches(&u));
        u.metadata.insert("beta_tester".to_string(), json!(false));
        assert!(!beta.matches(&u));
        u.metadata.insert("beta_tester".to_string(), json!(true));
        assert!(beta.matches(&u));
    }

    #[test]
    fn test_criteria_serialize_camel_case() {
        let criteria = SegmentCriteria {
            registration_date_after: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            custom_rules: vec![rule("login_count", RuleOperator::GreaterThan, json!(50))],
            ..Default::default()
        };
        let value = serde_json::to_value(&criteria).unwrap();
        assert!(value.get("registrationDateAfter").is_some());
        assert!(value.get("customRules").is_some());

        let back: SegmentCriteria = serde_json::from_value(value).unwrap();
        assert_eq!(back.registration_date_after, criteria.registration_date_after);
    }
}
