pub mod routes;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::evaluation::{FlagDefinition, UserContext};

// MODELS

#[derive(Debug, Deserialize)]
pub struct EnvironmentQuery {
    pub environment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub environment: Option<String>,
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub user: UserContext,
}

#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub feature: String,
    pub enabled: bool,
    pub reason: String,
    pub user: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RolloutRequest {
    pub percentage: i32,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct UsageRequest {
    pub user_id: String,
    pub event_data: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct FlagListResponse {
    pub success: bool,
    pub environment: String,
    pub count: usize,
    pub features: Vec<FlagDefinition>,
}

// HELPER FUNCTIONS

// Validating the flag name
pub fn validate_flag_name(name: &str) -> Result<(), ServiceError> {
    let invalid = |msg: &str| -> Result<(), ServiceError> {
        Err(ServiceError::InvalidArgument(msg.to_string()))
    };

    let Some(first) = name.chars().next() else {
        return invalid("Flag name cannot be empty");
    };

    if name.len() > 64 {
        return invalid("Flag name is too long (Max: 64 characters)");
    }

    if !first.is_ascii_alphabetic() {
        return invalid("Flag name must start with a letter");
    }

    if !name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        return invalid("Flag name can only contain lowercase letters, numbers, underscores, and hyphens");
    }

    Ok(())
}
