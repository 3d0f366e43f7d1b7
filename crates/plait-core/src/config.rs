use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PlaitError, Result};
use crate::types::ModelProfile;

/// Top-level Plait configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default = "default_templates_dir")]
    pub templates_dir: String,
    #[serde(default)]
    pub profiles: Vec<ModelProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
            log: None,
            templates_dir: default_templates_dir(),
            profiles: Vec::new(),
        }
    }
}

/// Defaults applied when a step leaves a limit unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_context_tokens")]
    pub default_max_context_tokens: u64,
    #[serde(default = "default_max_output_tokens")]
    pub default_max_output_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_context_tokens: default_max_context_tokens(),
            default_max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// Retention policy for finished runs held by the run store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Finished runs kept before the oldest are evicted.
    #[serde(default = "default_max_finished_runs")]
    pub max_finished_runs: usize,
    /// Seconds a finished run stays readable before eviction.
    #[serde(default = "default_finished_grace_secs")]
    pub finished_grace_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_finished_runs: default_max_finished_runs(),
            finished_grace_secs: default_finished_grace_secs(),
        }
    }
}

/// JSONL event logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable event logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for `<run_id>.jsonl` files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// 1=run events, 2=+step events, 3=+stream deltas.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

fn default_max_context_tokens() -> u64 { 8_192 }
fn default_max_output_tokens() -> u32 { 1_024 }
fn default_max_finished_runs() -> usize { 256 }
fn default_finished_grace_secs() -> u64 { 600 }
fn default_log_enabled() -> bool { true }
fn default_log_dir() -> String { "logs".to_string() }
fn default_log_level() -> u8 { 2 }
fn default_templates_dir() -> String { "templates".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PlaitError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| PlaitError::Config(e.to_string()))
    }

    /// Resolve the templates directory relative to `base` unless absolute.
    pub fn templates_path(&self, base: &Path) -> PathBuf {
        resolve_path(&self.templates_dir, base)
    }

    /// Resolve the event log directory, if logging is enabled.
    pub fn log_path(&self, base: &Path) -> Option<PathBuf> {
        self.log
            .as_ref()
            .filter(|l| l.enabled)
            .map(|l| resolve_path(&l.log_dir, base))
    }

    pub fn profile(&self, id: &str) -> Option<&ModelProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }
}

fn resolve_path(raw: &str, base: &Path) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
