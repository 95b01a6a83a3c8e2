//! Engine configuration.
//!
//! # Responsibility
//! - Carry the tunable versioning policy and the static type-level cache
//!   dependencies into the services at construction time.
//! - Load and validate configuration documents (JSON).
//!
//! # Invariants
//! - Every field has a default; an empty document `{}` is a valid config.
//! - A loaded config has been validated.

use crate::model::entity::ContractViolation;
use crate::service::dependency_graph::TypeDependencies;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_NEW_VERSION_AFTER_HOURS: u64 = 24;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config document: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

impl From<ContractViolation> for ConfigError {
    fn from(value: ContractViolation) -> Self {
        Self::Invalid(value.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub versioning: VersioningConfig,
    pub cache: CacheConfig,
    pub logging: Option<LoggingConfig>,
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.versioning.new_version_after_hours == 0 {
            return Err(ConfigError::Invalid(
                "versioning.new_version_after_hours must be positive".to_string(),
            ));
        }
        self.cache.type_dependencies.validate()?;
        if let Some(logging) = &self.logging {
            if logging.dir.trim().is_empty() {
                return Err(ConfigError::Invalid("logging.dir cannot be empty".to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersioningConfig {
    /// Age of the newest version after which `Guess` snapshots again.
    pub new_version_after_hours: u64,
}

impl VersioningConfig {
    pub fn new_version_after(&self) -> Duration {
        Duration::from_secs(self.new_version_after_hours.saturating_mul(60 * 60))
    }
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            new_version_after_hours: DEFAULT_NEW_VERSION_AFTER_HOURS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entities invalidated whenever any entity of the keyed type changes.
    pub type_dependencies: TypeDependencies,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    pub dir: String,
}

fn default_level() -> String {
    crate::logging::default_log_level().to_string()
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, EngineConfig};
    use crate::model::entity::EntityRef;
    use std::time::Duration;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(
            config.versioning.new_version_after(),
            Duration::from_secs(24 * 60 * 60)
        );
        assert!(config.logging.is_none());
    }

    #[test]
    fn type_dependencies_are_loaded() {
        let config = EngineConfig::from_json_str(
            r#"{
                "versioning": {"new_version_after_hours": 6},
                "cache": {"type_dependencies": {"page": [{"type": "menu", "id": 1}]}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.versioning.new_version_after_hours, 6);
        assert_eq!(
            config.cache.type_dependencies.get("page"),
            &[EntityRef::new("menu", 1)]
        );
    }

    #[test]
    fn invalid_entity_type_is_rejected() {
        let err = EngineConfig::from_json_str(
            r#"{"cache": {"type_dependencies": {"Page": []}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let err =
            EngineConfig::from_json_str(r#"{"versioning": {"new_version_after_hours": 0}}"#)
                .unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn logging_level_defaults_when_omitted() {
        let config = EngineConfig::from_json_str(r#"{"logging": {"dir": "/tmp/chainstore"}}"#)
            .unwrap();
        let logging = config.logging.unwrap();
        assert!(!logging.level.is_empty());
        assert_eq!(logging.dir, "/tmp/chainstore");
    }

    #[test]
    fn from_path_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = EngineConfig::from_path(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
