//! Engine configuration from environment variables
//!
//! Environment variables:
//! - `STATFLOW_SOURCE_URL` (required by the REST binary)
//! - `STATFLOW_ACCESS_TOKEN` (optional bearer token)
//! - `STATFLOW_API_VERSION` (default: 59.0)
//! - `STATFLOW_REQUEST_DEADLINE_MS` (default: 25000)
//! - `STATFLOW_MAX_PAGES` (default: 200)
//! - `STATFLOW_PAGE_SIZE` (default: 2000)
//! - `STATFLOW_LOOKUP_BATCH_SIZE` (default: 200)
//! - `STATFLOW_LOOKUP_PARALLELISM` (default: 10)
//! - `STATFLOW_CACHE_TTL_SECS` (default: 900)
//! - `STATFLOW_SNAPSHOT_PATH` (default: data/snapshots.json)
//! - `STATFLOW_SNAPSHOT_BACKEND` (json | sqlite, default: json)
//! - `STATFLOW_SNAPSHOT_RETENTION` (default: 365)
//! - `STATFLOW_CONTACT_ENTITY` / `STATFLOW_PROJECT_ENTITY` / `STATFLOW_ASSIGNMENT_ENTITY`

use crate::snapshot::{JsonFileBackend, SnapshotBackend, SnapshotError, SqliteSnapshotBackend};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    MissingVariable(&'static str),
    InvalidValue { variable: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "{} must be set", var),
            ConfigError::InvalidValue { variable, value } => write!(f, "Invalid value for {}: {:?}", variable, value),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotBackendKind {
    Json,
    Sqlite,
}

impl FromStr for SnapshotBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(SnapshotBackendKind::Json),
            "sqlite" => Ok(SnapshotBackendKind::Sqlite),
            _ => Err(ConfigError::InvalidValue {
                variable: "STATFLOW_SNAPSHOT_BACKEND",
                value: s.to_string(),
            }),
        }
    }
}

/// Entity names, which differ between deployments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityNames {
    pub contact: String,
    pub project: String,
    pub assignment: String,
}

impl Default for EntityNames {
    fn default() -> Self {
        Self {
            contact: "Contact".to_string(),
            project: "Project__c".to_string(),
            assignment: "Project_Assignment__c".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub source_url: Option<String>,
    pub access_token: Option<String>,
    pub api_version: String,

    /// Budget for one report request, from its start
    pub request_deadline: Duration,
    pub max_pages: usize,
    pub page_size: usize,

    pub lookup_batch_size: usize,
    pub lookup_parallelism: usize,

    pub cache_ttl: Duration,

    pub snapshot_path: String,
    pub snapshot_backend: SnapshotBackendKind,
    pub snapshot_retention: usize,

    pub entities: EntityNames,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_url: None,
            access_token: None,
            api_version: "59.0".to_string(),
            request_deadline: Duration::from_millis(25_000),
            max_pages: 200,
            page_size: 2_000,
            lookup_batch_size: 200,
            lookup_parallelism: 10,
            cache_ttl: Duration::from_secs(900),
            snapshot_path: "data/snapshots.json".to_string(),
            snapshot_backend: SnapshotBackendKind::Json,
            snapshot_retention: 365,
            entities: EntityNames::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key → value lookup; unset or unparsable values keep
    /// their defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let snapshot_backend = match text("STATFLOW_SNAPSHOT_BACKEND") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                log::warn!("⚠️  {}, using json", e);
                SnapshotBackendKind::Json
            }),
            None => defaults.snapshot_backend,
        };

        Self {
            source_url: text("STATFLOW_SOURCE_URL"),
            access_token: text("STATFLOW_ACCESS_TOKEN"),
            api_version: text("STATFLOW_API_VERSION").unwrap_or(defaults.api_version),

            request_deadline: Duration::from_millis(parse_or(
                &lookup,
                "STATFLOW_REQUEST_DEADLINE_MS",
                defaults.request_deadline.as_millis() as u64,
            )),
            max_pages: parse_or(&lookup, "STATFLOW_MAX_PAGES", defaults.max_pages),
            page_size: parse_or(&lookup, "STATFLOW_PAGE_SIZE", defaults.page_size),

            lookup_batch_size: parse_or(&lookup, "STATFLOW_LOOKUP_BATCH_SIZE", defaults.lookup_batch_size),
            lookup_parallelism: parse_or(&lookup, "STATFLOW_LOOKUP_PARALLELISM", defaults.lookup_parallelism),

            cache_ttl: Duration::from_secs(parse_or(
                &lookup,
                "STATFLOW_CACHE_TTL_SECS",
                defaults.cache_ttl.as_secs(),
            )),

            snapshot_path: text("STATFLOW_SNAPSHOT_PATH").unwrap_or(defaults.snapshot_path),
            snapshot_backend,
            snapshot_retention: parse_or(&lookup, "STATFLOW_SNAPSHOT_RETENTION", defaults.snapshot_retention),

            entities: EntityNames {
                contact: text("STATFLOW_CONTACT_ENTITY").unwrap_or(defaults.entities.contact),
                project: text("STATFLOW_PROJECT_ENTITY").unwrap_or(defaults.entities.project),
                assignment: text("STATFLOW_ASSIGNMENT_ENTITY").unwrap_or(defaults.entities.assignment),
            },
        }
    }

    pub fn require_source_url(&self) -> Result<&str, ConfigError> {
        self.source_url
            .as_deref()
            .ok_or(ConfigError::MissingVariable("STATFLOW_SOURCE_URL"))
    }

    /// Open the configured snapshot backend
    pub fn open_snapshot_backend(&self) -> Result<Box<dyn SnapshotBackend>, SnapshotError> {
        Ok(match self.snapshot_backend {
            SnapshotBackendKind::Json => Box::new(JsonFileBackend::new(&self.snapshot_path)),
            SnapshotBackendKind::Sqlite => Box::new(SqliteSnapshotBackend::open(&self.snapshot_path)?),
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("⚠️  Invalid {}={:?}, using default {}", key, raw, default);
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> EngineConfig {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        EngineConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = from_map(&[]);

        assert_eq!(config.api_version, "59.0");
        assert_eq!(config.request_deadline, Duration::from_millis(25_000));
        assert_eq!(config.max_pages, 200);
        assert_eq!(config.lookup_batch_size, 200);
        assert_eq!(config.lookup_parallelism, 10);
        assert_eq!(config.cache_ttl, Duration::from_secs(900));
        assert_eq!(config.snapshot_backend, SnapshotBackendKind::Json);
        assert_eq!(config.snapshot_retention, 365);
        assert_eq!(config.entities, EntityNames::default());
        assert_eq!(
            config.require_source_url(),
            Err(ConfigError::MissingVariable("STATFLOW_SOURCE_URL"))
        );
    }

    #[test]
    fn test_custom_config() {
        let config = from_map(&[
            ("STATFLOW_SOURCE_URL", "https://example.my.salesforce.com"),
            ("STATFLOW_REQUEST_DEADLINE_MS", "5000"),
            ("STATFLOW_LOOKUP_PARALLELISM", "4"),
            ("STATFLOW_SNAPSHOT_BACKEND", "SQLite"),
            ("STATFLOW_ASSIGNMENT_ENTITY", "Assignment__c"),
        ]);

        assert_eq!(config.require_source_url(), Ok("https://example.my.salesforce.com"));
        assert_eq!(config.request_deadline, Duration::from_millis(5_000));
        assert_eq!(config.lookup_parallelism, 4);
        assert_eq!(config.snapshot_backend, SnapshotBackendKind::Sqlite);
        assert_eq!(config.entities.assignment, "Assignment__c");
        assert_eq!(config.entities.contact, "Contact");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_map(&[
            ("STATFLOW_MAX_PAGES", "lots"),
            ("STATFLOW_CACHE_TTL_SECS", "-5"),
            ("STATFLOW_SNAPSHOT_BACKEND", "postgres"),
            ("STATFLOW_SOURCE_URL", "   "),
        ]);

        assert_eq!(config.max_pages, 200);
        assert_eq!(config.cache_ttl, Duration::from_secs(900));
        assert_eq!(config.snapshot_backend, SnapshotBackendKind::Json);
        assert!(config.require_source_url().is_err());
    }

    #[test]
    fn test_from_env() {
        env::set_var("STATFLOW_PAGE_SIZE", "500");

        let config = EngineConfig::from_env();
        assert_eq!(config.page_size, 500);

        env::remove_var("STATFLOW_PAGE_SIZE");
    }
}
