use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SKYWATCH_DIR_NAME: &str = ".skywatch";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_DATABASE_PATH: &str = ".skywatch/skywatch.sqlite";
pub const DEFAULT_VERIFICATION_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_VERIFICATION_CONCURRENCY: usize = 4;
pub const DEFAULT_WINDOW_DAYS: u32 = 30;
pub const DEFAULT_TOP_LIMIT: u32 = 20;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: pretty, json"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SkywatchConfig {
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TrackerConfig {
    /// DID of the tracked account. Passed to the relation oracle and used to
    /// tell self-replies from replies to others.
    #[serde(default)]
    pub account_did: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_verification_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_verification_concurrency")]
    pub concurrency: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: DEFAULT_VERIFICATION_TIMEOUT_MS,
            concurrency: DEFAULT_VERIFICATION_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingConfig {
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default = "default_top_limit")]
    pub top_limit: u32,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_WINDOW_DAYS,
            top_limit: DEFAULT_TOP_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn skywatch_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(SKYWATCH_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    skywatch_dir(workspace_root).join(CONFIG_FILE_NAME)
}

/// Absolute database location; relative paths resolve against the workspace.
pub fn database_path(workspace_root: impl AsRef<Path>, config: &SkywatchConfig) -> PathBuf {
    let configured = Path::new(&config.storage.database_path);
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        workspace_root.as_ref().join(configured)
    }
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<SkywatchConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(SkywatchConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: SkywatchConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<SkywatchConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(skywatch_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = SkywatchConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

pub fn validate_config(config: &SkywatchConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.tracker.account_did.is_empty() {
        warnings.push(ConfigWarning {
            code: "tracker.account_did_missing",
            message: "tracker.account_did is empty; departures cannot be verified and self-replies cannot be detected".to_owned(),
        });
    } else if !config.tracker.account_did.starts_with("did:") {
        warnings.push(ConfigWarning {
            code: "tracker.account_did_format",
            message: format!(
                "tracker.account_did '{}' does not look like a DID",
                config.tracker.account_did
            ),
        });
    }

    if config.verification.enabled && config.verification.timeout_ms == 0 {
        warnings.push(ConfigWarning {
            code: "verification.timeout_zero",
            message: "verification.timeout_ms is 0; every lookup will time out and fail open"
                .to_owned(),
        });
    }

    if config.verification.enabled && config.verification.concurrency == 0 {
        warnings.push(ConfigWarning {
            code: "verification.concurrency_zero",
            message: "verification.concurrency is 0; lookups will run one at a time".to_owned(),
        });
    }

    if config.reporting.window_days == 0 {
        warnings.push(ConfigWarning {
            code: "reporting.window_zero",
            message: "reporting.window_days is 0; windowed reports will be empty".to_owned(),
        });
    }

    warnings
}

fn default_database_path() -> String {
    DEFAULT_DATABASE_PATH.to_owned()
}

fn default_true() -> bool {
    true
}

fn default_verification_timeout_ms() -> u64 {
    DEFAULT_VERIFICATION_TIMEOUT_MS
}

fn default_verification_concurrency() -> usize {
    DEFAULT_VERIFICATION_CONCURRENCY
}

fn default_window_days() -> u32 {
    DEFAULT_WINDOW_DAYS
}

fn default_top_limit() -> u32 {
    DEFAULT_TOP_LIMIT
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_owned()
}

fn normalize_config(mut config: SkywatchConfig) -> SkywatchConfig {
    config.tracker.account_did = config.tracker.account_did.trim().to_owned();

    let database_path = config.storage.database_path.trim();
    if database_path.is_empty() {
        config.storage.database_path = default_database_path();
    } else {
        config.storage.database_path = database_path.to_owned();
    }

    let level = config.logging.level.trim();
    if level.is_empty() {
        config.logging.level = default_log_level();
    } else {
        config.logging.level = level.to_owned();
    }

    config
}
