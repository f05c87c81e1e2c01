use serde::Serialize;
use std::collections::BTreeMap;

const PREFIX: &str = "ENABLE_";

/// Deploy-time switches read from `ENABLE_*` environment variables.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StaticFlags {
    flags: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StaticSummary {
    pub total: usize,
    pub enabled: usize,
    pub disabled: usize,
}

pub fn parse_boolean(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

impl StaticFlags {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// `ENABLE_NEW_DASHBOARD=true` becomes flag `new_dashboard`.
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let flags = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let name = key.strip_prefix(PREFIX)?;
                if name.is_empty() {
                    return None;
                }
                Some((name.to_ascii_lowercase(), parse_boolean(&value)))
            })
            .collect();

        Self { flags }
    }

    /// Unknown names are off.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }

    pub fn enabled(&self) -> Vec<&str> {
        self.flags.iter().filter(|(_, on)| **on).map(|(k, _)| k.as_str()).collect()
    }

    pub fn disabled(&self) -> Vec<&str> {
        self.flags.iter().filter(|(_, on)| !**on).map(|(k, _)| k.as_str()).collect()
    }

    pub fn summary(&self) -> StaticSummary {
        let enabled = self.enabled().len();
        StaticSummary {
            total: self.flags.len(),
            enabled,
            disabled: self.flags.len() - enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_parse_boolean() {
        assert!(parse_boolean("true"));
        assert!(parse_boolean(" TRUE "));
        assert!(parse_boolean("1"));
        assert!(parse_boolean("Yes"));
        assert!(!parse_boolean("false"));
        assert!(!parse_boolean("on"));
        assert!(!parse_boolean(""));
    }

    #[test]
    fn test_from_vars() {
        let flags = StaticFlags::from_vars(vars(&[
            ("ENABLE_NEW_DASHBOARD", "true"),
            ("ENABLE_DARK_MODE", "0"),
            ("ENABLE_", "true"),
            ("DATABASE_URL", "postgres://"),
            ("ENABLE_API_LOGGING", "yes"),
        ]));

        assert!(flags.is_enabled("new_dashboard"));
        assert!(!flags.is_enabled("dark_mode"));
        assert!(!flags.is_enabled("unknown"));
        assert_eq!(flags.enabled(), vec!["api_logging", "new_dashboard"]);
        assert_eq!(flags.disabled(), vec!["dark_mode"]);
        assert_eq!(
            flags.summary(),
            StaticSummary { total: 3, enabled: 2, disabled: 1 }
        );
    }
}
