use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use thiserror::Error;
use ward_core::config::SyncSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Sync(#[from] ward_core::config::ConfigError),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub audit_default_limit: usize,
    pub sync: SyncSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "WARD_API_BIND_ADDR", "127.0.0.1:8080");
        if !bind_addr.contains(':') {
            return Err(ConfigError::Invalid(
                "WARD_API_BIND_ADDR must be host:port".to_string(),
            ));
        }

        let db_path = PathBuf::from(value_or_default(&lookup, "WARD_API_DB_PATH", "ward.db"));

        let audit_default_limit = value_or_default(&lookup, "WARD_API_AUDIT_LIMIT", "50")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::Invalid("WARD_API_AUDIT_LIMIT must be an integer".to_string())
            })?;
        if audit_default_limit == 0 {
            return Err(ConfigError::Invalid(
                "WARD_API_AUDIT_LIMIT must be greater than zero".to_string(),
            ));
        }

        let sync = SyncSettings::from_lookup(&lookup)?;

        Ok(Self {
            bind_addr,
            db_path,
            audit_default_limit,
            sync,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            db_path: PathBuf::from(":memory:"),
            audit_default_limit: 50,
            sync: SyncSettings::default(),
        }
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name)
        .and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn config_defaults_without_environment() {
        let map: HashMap<&str, &str> = HashMap::new();
        let config =
            AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string())).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.db_path, PathBuf::from("ward.db"));
        assert_eq!(config.sync, SyncSettings::default());
    }

    #[test]
    fn config_rejects_invalid_values() {
        let mut map = HashMap::new();
        map.insert("WARD_API_AUDIT_LIMIT", "0");
        let err = AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("WARD_API_AUDIT_LIMIT"));

        let mut map = HashMap::new();
        map.insert("WARD_QUEUE_MAX_RETRIES", "many");
        let err = AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("WARD_QUEUE_MAX_RETRIES"));
    }

    #[test]
    fn config_reads_overrides() {
        let mut map = HashMap::new();
        map.insert("WARD_API_BIND_ADDR", "0.0.0.0:9000");
        map.insert("WARD_API_DB_PATH", " /var/lib/ward/records.db ");
        let config =
            AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string())).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.db_path, PathBuf::from("/var/lib/ward/records.db"));
    }
}
