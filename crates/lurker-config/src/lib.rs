use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_LURKER_CONFIG: &str = "LURKER_CONFIG";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const MIN_POLL_INTERVAL_SECS: u64 = 5;
const MAX_POLL_INTERVAL_SECS: u64 = 3_600;
const DEFAULT_API_URL: &str = "https://api.github.com";
const DEFAULT_AGENT_BINARY: &str = "claude";
const DEFAULT_LOG_LINE_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LurkerConfig {
    /// Base directory for workdirs and state.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub github: GithubConfigToml,
    #[serde(default)]
    pub agent: AgentConfigToml,
    #[serde(default)]
    pub ui: UiConfigToml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GithubConfigToml {
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for GithubConfigToml {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfigToml {
    #[serde(default = "default_agent_binary")]
    pub binary: String,
}

impl Default for AgentConfigToml {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UiConfigToml {
    /// Per-issue log lines kept in memory and in lurker.log.
    #[serde(default = "default_log_line_limit")]
    pub log_line_limit: usize,
}

impl Default for UiConfigToml {
    fn default() -> Self {
        Self {
            log_line_limit: default_log_line_limit(),
        }
    }
}

impl Default for LurkerConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            poll_interval_secs: default_poll_interval_secs(),
            github: GithubConfigToml::default(),
            agent: AgentConfigToml::default(),
            ui: UiConfigToml::default(),
        }
    }
}

pub fn load_from_env() -> Result<LurkerConfig, ConfigError> {
    let path = config_path_from_env()?;
    load_from_path(path)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<LurkerConfig, ConfigError> {
    load_or_create_config(path.as_ref())
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = resolve_home_dir().ok_or_else(|| {
        ConfigError::configuration("Unable to resolve home directory from HOME or USERPROFILE")
    })?;
    Ok(home.join(".config").join("lurker").join("config.toml"))
}

fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_LURKER_CONFIG) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                default_config_path()
            } else {
                Ok(raw.into())
            }
        }
        Err(std::env::VarError::NotPresent) => default_config_path(),
        Err(_) => Err(ConfigError::configuration(
            "LURKER_CONFIG contained invalid UTF-8",
        )),
    }
}

fn resolve_home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("USERPROFILE")
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
}

fn default_base_dir() -> String {
    resolve_home_dir()
        .map(|home| home.join(".local").join("share").join("lurker"))
        .unwrap_or_else(|| std::env::temp_dir().join("lurker"))
        .to_string_lossy()
        .to_string()
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_owned()
}

fn default_agent_binary() -> String {
    DEFAULT_AGENT_BINARY.to_owned()
}

fn default_log_line_limit() -> usize {
    DEFAULT_LOG_LINE_LIMIT
}

fn persist_config(path: &Path, config: &LurkerConfig) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(config).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to serialize LURKER_CONFIG for {}: {err}",
            path.display()
        ))
    })?;
    std::fs::write(path, rendered.as_bytes()).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to write LURKER_CONFIG to {}: {err}",
            path.display()
        ))
    })
}

fn load_or_create_config(path: &Path) -> Result<LurkerConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|err| {
                        ConfigError::configuration(format!(
                            "Failed to create parent directory {} for LURKER_CONFIG: {err}",
                            parent.display()
                        ))
                    })?;
                }
            }
            let default_config = LurkerConfig::default();
            persist_config(path, &default_config)?;
            return Ok(default_config);
        }
        Err(err) => {
            return Err(ConfigError::configuration(format!(
                "Failed to read LURKER_CONFIG from {}: {err}",
                path.display()
            )));
        }
    };

    let mut config: LurkerConfig = toml::from_str(&raw).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to parse LURKER_CONFIG from {}: {err}",
            path.display()
        ))
    })?;

    if normalize_config(&mut config) {
        persist_config(path, &config)?;
    }
    Ok(config)
}

fn normalize_config(config: &mut LurkerConfig) -> bool {
    let mut changed = false;

    changed |= normalize_non_empty_string(&mut config.base_dir, default_base_dir());
    changed |= normalize_non_empty_string(&mut config.github.api_url, default_api_url());
    changed |= normalize_non_empty_string(&mut config.agent.binary, default_agent_binary());

    let normalized_interval = if config.poll_interval_secs == 0 {
        default_poll_interval_secs()
    } else {
        config
            .poll_interval_secs
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS)
    };
    if normalized_interval != config.poll_interval_secs {
        config.poll_interval_secs = normalized_interval;
        changed = true;
    }

    let normalized_limit = config.ui.log_line_limit.max(1);
    if normalized_limit != config.ui.log_line_limit {
        config.ui.log_line_limit = normalized_limit;
        changed = true;
    }

    changed
}

fn normalize_non_empty_string(value: &mut String, default: String) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        if *value != default {
            *value = default;
            return true;
        }
        return false;
    }
    if trimmed != value {
        *value = trimmed.to_owned();
        return true;
    }
    false
}
