//! Configuration system for GEPA Console
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete console configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Console settings
    pub console: ConsoleSettings,

    /// Telemetry correlation settings
    pub telemetry: TelemetrySettings,

    /// Dataset settings
    pub dataset: DatasetSettings,
}

/// Console settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Telemetry correlation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Maximum telemetry records kept in memory
    pub max_records: usize,

    /// Maximum raw spans kept for inspection
    pub max_raw_spans: usize,

    /// Maximum lines in a prompt diff
    pub diff_max_lines: usize,

    /// Role used for prompt diffing when a record has none
    pub default_role: String,

    /// Span name suffixes marking internal sub-calls
    pub sub_call_suffixes: Vec<String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            max_records: 200,
            max_raw_spans: 500,
            diff_max_lines: 80,
            default_role: "default".to_string(),
            sub_call_suffixes: vec![
                ".internal".to_string(),
                ".subcall".to_string(),
                "::inner".to_string(),
            ],
        }
    }
}

/// Dataset settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    /// JSON file with dataset rows used for hydration
    pub path: Option<String>,
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path to config file (if specified via CLI)
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. GEPA_CONFIG environment variable
    /// 3. ~/.config/gepa-console/config.toml
    /// 4. /etc/gepa-console/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<ConsoleConfig> {
        let config_path = self.find_config_file();

        let mut config = if let Some(path) = config_path {
            info!("Loading configuration from: {}", path.display());
            self.load_from_file(&path)?
        } else {
            debug!("No config file found, using defaults");
            ConsoleConfig::default()
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    /// Find the config file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("GEPA_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("GEPA_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/gepa-console/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Load configuration from a TOML file
    fn load_from_file(&self, path: &Path) -> ConfigResult<ConsoleConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: ConsoleConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut ConsoleConfig) {
        if let Ok(val) = std::env::var("GEPA_LOG_LEVEL") {
            config.console.log_level = val;
        }

        if let Ok(val) = std::env::var("GEPA_MAX_RECORDS") {
            if let Ok(max) = val.parse() {
                config.telemetry.max_records = max;
            }
        }
        if let Ok(val) = std::env::var("GEPA_MAX_RAW_SPANS") {
            if let Ok(max) = val.parse() {
                config.telemetry.max_raw_spans = max;
            }
        }

        if let Ok(val) = std::env::var("GEPA_DATASET_PATH") {
            config.dataset.path = Some(val);
        }
    }

    /// Validate configuration
    fn validate(&self, config: &ConsoleConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.console.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.console.log_level, valid_levels
            )));
        }

        if config.telemetry.max_records == 0 {
            return Err(ConfigError::ValidationError(
                "telemetry.max_records must be greater than 0".to_string(),
            ));
        }

        if config.telemetry.diff_max_lines == 0 {
            return Err(ConfigError::ValidationError(
                "telemetry.diff_max_lines must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &ConsoleConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get the default config file path for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("gepa-console").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper module for platform-specific directories
mod dirs {
    use std::path::PathBuf;

    /// Get the user's config directory
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }

        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            None
        }
    }
}
