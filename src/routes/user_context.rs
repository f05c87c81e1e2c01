use axum::{extract::FromRequestParts, http::request::Parts, http::HeaderMap};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::error::ServiceError;
use crate::evaluation::UserContext;

/// User described by `x-user-*` headers, handed to handlers as a plain value.
pub struct RequestUser(pub UserContext);

impl<S> FromRequestParts<S> for RequestUser
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        user_from_headers(&parts.headers).map(RequestUser)
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn user_from_headers(headers: &HeaderMap) -> Result<UserContext, ServiceError> {
    let id = header(headers, "x-user-id")
        .ok_or_else(|| ServiceError::InvalidArgument("missing x-user-id header".to_string()))?;

    let registration_date = match header(headers, "x-user-registration") {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|_| ServiceError::InvalidArgument(format!("invalid x-user-registration '{}'", raw)))?,
        ),
        None => None,
    };

    let mut metadata: HashMap<String, Value> = HashMap::new();
    if let Some(v) = header(headers, "x-beta-tester") {
        metadata.insert("beta_tester".to_string(), json!(v == "true"));
    }
    if let Some(v) = header(headers, "x-login-count") {
        let count: i64 = v
            .parse()
            .map_err(|_| ServiceError::InvalidArgument(format!("invalid x-login-count '{}'", v)))?;
        metadata.insert("login_count".to_string(), json!(count));
    }
    if let Some(v) = header(headers, "x-subscription") {
        metadata.insert("subscription".to_string(), json!(v));
    }

    Ok(UserContext {
        id: id.to_string(),
        email: header(headers, "x-user-email").map(str::to_string),
        role: header(headers, "x-user-role").unwrap_or("user").to_string(),
        segment: header(headers, "x-user-segment").map(str::to_string),
        registration_date,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_full_header_set() {
        let user = user_from_headers(&headers(&[
            ("x-user-id", "user123"),
            ("x-user-email", "a@b.com"),
            ("x-user-role", "premium"),
            ("x-user-registration", "2024-02-01T00:00:00Z"),
            ("x-beta-tester", "true"),
            ("x-login-count", "77"),
            ("x-subscription", "pro"),
        ]))
        .unwrap();

        assert_eq!(user.id, "user123");
        assert_eq!(user.role, "premium");
        assert!(user.registration_date.is_some());
        assert_eq!(user.metadata["beta_tester"], json!(true));
        assert_eq!(user.metadata["login_count"], json!(77));
        assert_eq!(user.metadata["subscription"], json!("pro"));
    }

    #[test]
    fn test_defaults_and_rejections() {
        let user = user_from_headers(&headers(&[("x-user-id", "bob")])).unwrap();
        assert_eq!(user.role, "user");
        assert!(user.metadata.is_empty());

        assert!(user_from_headers(&headers(&[])).is_err());
        assert!(user_from_headers(&headers(&[("x-user-id", "  ")])).is_err());
        assert!(user_from_headers(&headers(&[("x-user-id", "bob"), ("x-login-count", "many")])).is_err());
        assert!(user_from_headers(&headers(&[("x-user-id", "bob"), ("x-user-registration", "yesterday")])).is_err());
    }
}
