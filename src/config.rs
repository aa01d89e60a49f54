//! Ambient configuration: storage backend selection, provider selection, and
//! the scheduler work/conf/log directories (spec §6).
//!
//! Loaded the way the teacher's `Config` is loaded: an optional TOML file,
//! falling back to defaults, with environment variables layered on top for
//! the fields spec.md says are environment-driven.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BrokerError, Result};

/// Which repository backend to construct for each entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Memory,
    File,
    DynamoDb,
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Memory
    }
}

impl std::str::FromStr for StorageType {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" | "in-memory" | "in_memory" => Ok(StorageType::Memory),
            "file" | "json" => Ok(StorageType::File),
            "dynamodb" | "kv" | "ddb" => Ok(StorageType::DynamoDb),
            other => Err(BrokerError::Validation(
                crate::error::ValidationError::InvalidValue {
                    field: "STORAGE_TYPE".to_string(),
                    reason: format!("unknown storage type: {other}"),
                },
            )),
        }
    }
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub provider_type: String,
    pub storage_type: StorageType,
    pub storage_table_prefix: String,
    pub directories: SchedulerDirectories,
    pub template: TemplateManagerSettings,
    pub resilience: ResilienceSettings,
}

/// The scheduler work/conf/log directories (spec §6).
///
/// Host Factory invokes provider plugins with `HF_PROVIDER_WORKDIR`,
/// `HF_PROVIDER_CONFDIR`, and `HF_PROVIDER_LOGDIR` set; a standalone broker
/// deployment instead sets the `DEFAULT_*` family. Per the Open Question in
/// spec.md §9, `HF_*` wins when both are present (see DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerDirectories {
    pub workdir: PathBuf,
    pub confdir: PathBuf,
    pub logdir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateManagerSettings {
    pub scan_dir: PathBuf,
    pub extra_paths: Vec<PathBuf>,
    pub default_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceSettings {
    pub retry_base_ms: u64,
    pub retry_growth: f64,
    pub retry_cap_ms: u64,
    pub retry_jitter_factor: f64,
    pub retry_max_attempts: u32,
    pub circuit_failure_threshold: u32,
    pub circuit_reset_timeout_secs: u64,
    pub circuit_half_open_timeout_secs: u64,
    pub default_timeout_secs: u64,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            retry_base_ms: 1_000,
            retry_growth: 2.0,
            retry_cap_ms: 60_000,
            retry_jitter_factor: 0.1,
            retry_max_attempts: 3,
            circuit_failure_threshold: 5,
            circuit_reset_timeout_secs: 60,
            circuit_half_open_timeout_secs: 30,
            default_timeout_secs: 30,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider_type: "aws".to_string(),
            storage_type: StorageType::Memory,
            storage_table_prefix: "hf-broker".to_string(),
            directories: SchedulerDirectories {
                workdir: PathBuf::from("./work"),
                confdir: PathBuf::from("./conf"),
                logdir: PathBuf::from("./log"),
            },
            template: TemplateManagerSettings {
                scan_dir: PathBuf::from("./conf/templates"),
                extra_paths: Vec::new(),
                default_ttl_secs: 60,
            },
            resilience: ResilienceSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(p) = path {
            if p.exists() {
                let content = std::fs::read_to_string(p)?;
                toml::from_str(&content).map_err(|e| {
                    BrokerError::Validation(crate::error::ValidationError::Message(format!(
                        "failed to parse config {}: {e}",
                        p.display()
                    )))
                })?
            } else {
                AppConfig::default()
            }
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PROVIDER_TYPE") {
            self.provider_type = v;
        }
        if let Ok(v) = std::env::var("STORAGE_TYPE") {
            if let Ok(st) = v.parse() {
                self.storage_type = st;
            }
        }
        if let Ok(v) = std::env::var("STORAGE_TABLE_PREFIX") {
            self.storage_table_prefix = v;
        }

        self.directories.workdir =
            Self::resolve_dir("WORKDIR", self.directories.workdir.clone());
        self.directories.confdir =
            Self::resolve_dir("CONFDIR", self.directories.confdir.clone());
        self.directories.logdir = Self::resolve_dir("LOGDIR", self.directories.logdir.clone());
    }

    /// Resolve a directory from `HF_PROVIDER_<suffix>` or `DEFAULT_PROVIDER_<suffix>`,
    /// with `HF_*` taking precedence (see DESIGN.md for the rationale).
    fn resolve_dir(suffix: &str, fallback: PathBuf) -> PathBuf {
        let hf_key = format!("HF_PROVIDER_{suffix}");
        let default_key = format!("DEFAULT_PROVIDER_{suffix}");

        std::env::var(&hf_key)
            .or_else(|_| std::env::var(&default_key))
            .map(PathBuf::from)
            .unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn default_config_uses_memory_storage() {
        let config = AppConfig::default();
        assert_eq!(config.storage_type, StorageType::Memory);
        assert_eq!(config.resilience.retry_max_attempts, 3);
    }

    #[test]
    fn storage_type_parses_known_aliases() {
        assert_eq!("memory".parse::<StorageType>().unwrap(), StorageType::Memory);
        assert_eq!("json".parse::<StorageType>().unwrap(), StorageType::File);
        assert_eq!(
            "dynamodb".parse::<StorageType>().unwrap(),
            StorageType::DynamoDb
        );
        assert!("bogus".parse::<StorageType>().is_err());
    }

    #[test]
    fn hf_prefix_wins_over_default_prefix() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("HF_PROVIDER_WORKDIR", "/hf/work");
        std::env::set_var("DEFAULT_PROVIDER_WORKDIR", "/default/work");

        let mut config = AppConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.directories.workdir, PathBuf::from("/hf/work"));

        std::env::remove_var("HF_PROVIDER_WORKDIR");
        std::env::remove_var("DEFAULT_PROVIDER_WORKDIR");
    }

    #[test]
    fn load_missing_path_falls_back_to_default() {
        let config = AppConfig::load(Some(Path::new("/nonexistent/path.toml"))).unwrap();
        assert_eq!(config.provider_type, "aws");
    }
}
