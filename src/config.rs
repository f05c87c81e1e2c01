use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} missing, it is required")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub analytics_enabled: bool,
    pub default_environment: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv().is_ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from any variable source; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = lookup("PORT").ok_or(ConfigError::Missing("PORT"))?;
        let port = parse("PORT", &port)?;

        let cache_ttl = match lookup("FEATURE_CACHE_TTL") {
            Some(v) => Duration::from_millis(parse("FEATURE_CACHE_TTL", &v)?),
            None => Duration::from_millis(300_000),
        };

        let cache_sweep_interval = match lookup("ROLLOUT_UPDATE_INTERVAL") {
            Some(v) => Duration::from_millis(parse("ROLLOUT_UPDATE_INTERVAL", &v)?),
            None => Duration::from_millis(60_000),
        };
        if cache_sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                name: "ROLLOUT_UPDATE_INTERVAL",
                value: "0".to_string(),
            });
        }

        let analytics_enabled = lookup("ENABLE_FEATURE_ANALYTICS")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            cache_ttl,
            cache_sweep_interval,
            analytics_enabled,
            default_environment: lookup("DEFAULT_ENVIRONMENT")
                .unwrap_or_else(|| "production".to_string()),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("PORT", "8080")])).unwrap();
        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.cache_sweep_interval, Duration::from_secs(60));
        assert!(!config.analytics_enabled);
        assert_eq!(config.default_environment, "production");
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "3000"),
            ("HOST", "0.0.0.0"),
            ("FEATURE_CACHE_TTL", "1000"),
            ("ENABLE_FEATURE_ANALYTICS", "TRUE"),
            ("DEFAULT_ENVIRONMENT", "staging"),
            ("DATABASE_URL", "postgres://localhost/flags"),
        ]))
        .unwrap();
        assert_eq!(config.addr(), "0.0.0.0:3000");
        assert_eq!(config.cache_ttl, Duration::from_secs(1));
        assert!(config.analytics_enabled);
        assert_eq!(config.default_environment, "staging");
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/flags"));
    }

    #[test]
    fn test_missing_and_invalid_port() {
        assert!(matches!(
            Config::from_lookup(lookup(&[])),
            Err(ConfigError::Missing("PORT"))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("PORT", "not-a-port")])),
            Err(ConfigError::Invalid { name: "PORT", .. })
        ));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        assert!(Config::from_lookup(lookup(&[("PORT", "1"), ("ROLLOUT_UPDATE_INTERVAL", "0")])).is_err());
    }
}
