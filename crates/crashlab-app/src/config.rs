//! Configuration management
//!
//! Loads `config.toml` from the platform config directory or an explicit
//! path. A missing file yields the defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crashlab_core::{ExistingPolicy, SnapshotWriter};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config directory not found")]
    NoConfigDir,
}

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Snapshot artifact settings
    pub snapshot: SnapshotConfig,
    /// Fault gate behavior
    pub gate: GateConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Snapshot artifact settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Where artifacts go (None = current directory)
    pub output_dir: Option<PathBuf>,
    /// File name prefix, e.g. "CrashDump" or "GameCrash"
    pub prefix: String,
    /// File extension without the dot
    pub extension: String,
    /// Bound for each sanitized revision/branch component
    pub max_component_len: usize,
    /// What to do with an artifact that already exists
    pub existing: ExistingPolicy,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            prefix: "CrashDump".into(),
            extension: "dmp".into(),
            max_component_len: 128,
            existing: ExistingPolicy::Replace,
        }
    }
}

impl SnapshotConfig {
    /// Build the writer described by this section
    pub fn writer(&self) -> SnapshotWriter {
        SnapshotWriter::new()
            .with_prefix(self.prefix.as_str())
            .with_extension(self.extension.as_str())
            .with_max_component_len(self.max_component_len)
            .with_existing_policy(self.existing)
    }
}

/// How the gate asks whether to write a snapshot
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmMode {
    /// Always write (headless default)
    #[default]
    Always,
    /// Never write, diagnosis only
    Never,
    /// Ask on the console
    Prompt,
}

impl FromStr for ConfirmMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "always" | "yes" => Ok(ConfirmMode::Always),
            "never" | "no" => Ok(ConfirmMode::Never),
            "prompt" | "ask" => Ok(ConfirmMode::Prompt),
            other => Err(format!(
                "unknown confirm mode '{}' (expected always, never or prompt)",
                other
            )),
        }
    }
}

/// Fault gate behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    pub confirm: ConfirmMode,
    /// Answer used when the prompt cannot read input
    pub prompt_default: bool,
    /// Resume after a debug break instead of terminating
    pub resume_breakpoints: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            confirm: ConfirmMode::Always,
            prompt_default: true,
            resume_breakpoints: false,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// env_logger filter used when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "crashlab", "crashlab").map(|p| p.config_dir().to_path_buf())
}

/// Get the config file path
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("config.toml"))
}

/// Load configuration from the default location
pub fn load_config() -> Result<Config, ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    load_config_from(&path)
}

/// Load configuration from `path`
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        log::debug!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)?;
    let mut config: Config = toml::from_str(&content)?;

    if let Some(ref dir) = config.snapshot.output_dir {
        config.snapshot.output_dir = Some(expand_home(dir));
    }

    Ok(config)
}

/// Expand a leading `~` to the home directory
fn expand_home(path: &Path) -> PathBuf {
    let home = || std::env::var_os("HOME").map(PathBuf::from);
    if path == Path::new("~") {
        return home().unwrap_or_else(|| path.to_path_buf());
    }
    match path.strip_prefix("~") {
        Ok(rest) => home()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
