//
// config.rs
// Dicom-Intake-rs
//
// Layered configuration: built-in defaults, an optional TOML file, then DICOM_INTAKE_* environment overrides.
//
// Thales Matheus Mendonça Santos - November 2025

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::anonymize::{self, TagRule};
use crate::validate::FileKind;

/// Prefix for environment overrides; `__` separates sections (`DICOM_INTAKE_DISPATCH__WORKERS=8`).
pub const ENV_PREFIX: &str = "DICOM_INTAKE_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(String),
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub validation: ValidationConfig,
    pub conversion: ConversionConfig,
    pub anonymizer: AnonymizerConfig,
    pub sealing: SealingConfig,
    pub dispatch: DispatchConfig,
    pub broker: BrokerConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding sealed artifacts.
    pub artifact_root: PathBuf,
    /// SQLite database holding upload, batch, metadata and audit records.
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("target/intake/artifacts"),
            database: PathBuf::from("target/intake/intake.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub max_bytes: u64,
    pub allowed_kinds: Vec<FileKind>,
    /// Most files accepted in one batch.
    pub max_batch_files: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            allowed_kinds: FileKind::ALL.to_vec(),
            max_batch_files: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Longest side of a converted image; larger inputs are downscaled. 0 keeps the original size.
    pub max_dimension: u32,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self { max_dimension: 512 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnonymizerConfig {
    pub rules: Vec<TagRule>,
}

impl Default for AnonymizerConfig {
    fn default() -> Self {
        Self {
            rules: anonymize::default_rules(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SealingConfig {
    pub encrypt: bool,
    /// 64 hex characters (AES-256). Takes precedence over `key_env`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_hex: Option<String>,
    /// Environment variable consulted when `key_hex` is unset.
    pub key_env: String,
}

impl Default for SealingConfig {
    fn default() -> Self {
        Self {
            encrypt: true,
            key_hex: None,
            key_env: "DICOM_INTAKE_SEALING_KEY".to_string(),
        }
    }
}

/// What a single failed file does to its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchPolicy {
    /// The batch completes once every file is terminal, whatever the per-file outcomes.
    #[default]
    BestEffort,
    /// The first failed file moves the batch to `failed`.
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Size of the in-process worker pool.
    pub workers: usize,
    /// Extra attempts for retryable failures (persistence errors, timeouts).
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub job_timeout_secs: u64,
    pub batch_policy: BatchPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_backoff_ms: 200,
            retry_backoff_max_ms: 5_000,
            job_timeout_secs: 120,
            batch_policy: BatchPolicy::BestEffort,
        }
    }
}

impl DispatchConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Exponential backoff before retry number `attempt` (0-based), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(millis)
    }

    /// Longest one job can keep a worker busy: every attempt times out and every backoff is slept.
    pub fn worst_case_job_time(&self) -> Duration {
        let attempts = self.max_retries.saturating_add(1);
        let backoffs = (0..self.max_retries)
            .map(|retry| self.backoff(retry))
            .fold(Duration::ZERO, Duration::saturating_add);
        self.job_timeout()
            .checked_mul(attempts)
            .unwrap_or(Duration::MAX)
            .saturating_add(backoffs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// `sqlite:<path>` of the shared job queue. Unset means in-process execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Refuse to start instead of falling back when the broker is unreachable.
    pub required: bool,
    /// Consumer threads started by `dicom-intake worker`.
    pub consumers: usize,
    pub visibility_timeout_secs: u64,
    pub max_deliveries: u32,
    pub poll_interval_ms: u64,
    /// Finished broker rows older than this are pruned.
    pub retention_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            required: false,
            consumers: 2,
            visibility_timeout_secs: 900,
            max_deliveries: 5,
            poll_interval_ms: 250,
            retention_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest HTTP request body accepted; batch uploads carry base64 so this exceeds `validation.max_bytes`.
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            max_request_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load defaults, then `path` (when given), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.display().to_string()));
            }
            figment = figment.merge(Toml::file(path));
        }

        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults, without environment overrides.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validation.max_bytes == 0 {
            return Err(ConfigError::Invalid("validation.max_bytes must be > 0".into()));
        }
        if self.validation.max_batch_files == 0 {
            return Err(ConfigError::Invalid(
                "validation.max_batch_files must be > 0".into(),
            ));
        }
        if self.validation.allowed_kinds.is_empty() {
            return Err(ConfigError::Invalid(
                "validation.allowed_kinds must not be empty".into(),
            ));
        }
        if self.dispatch.workers == 0 {
            return Err(ConfigError::Invalid("dispatch.workers must be > 0".into()));
        }
        if self.dispatch.job_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.job_timeout_secs must be > 0".into(),
            ));
        }
        if (self.server.max_request_bytes as u64) < self.validation.max_bytes {
            return Err(ConfigError::Invalid(
                "server.max_request_bytes must be >= validation.max_bytes".into(),
            ));
        }
        if self.broker.consumers == 0 {
            return Err(ConfigError::Invalid("broker.consumers must be > 0".into()));
        }
        if self.broker.max_deliveries == 0 {
            return Err(ConfigError::Invalid("broker.max_deliveries must be > 0".into()));
        }
        let worst_case = self.dispatch.worst_case_job_time();
        if Duration::from_secs(self.broker.visibility_timeout_secs) <= worst_case {
            return Err(ConfigError::Invalid(format!(
                "broker.visibility_timeout_secs must exceed the longest job run ({:.1}s)",
                worst_case.as_secs_f64()
            )));
        }
        for rule in &self.anonymizer.rules {
            rule.check().map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }
}
