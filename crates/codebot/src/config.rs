//! Layered configuration: built-in defaults, then an optional TOML file,
//! then `CODEBOT_*` environment variables (`__` separates sections, e.g.
//! `CODEBOT_AGENT__TIMEOUT_SECS=120`).

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat, Map};
use serde::{Deserialize, Serialize};

use crate::executor::{ExecutorConfig, ProgressConfig, default_statuses};
use crate::prompt::PromptConfig;

pub const APP_NAME: &str = "codebot";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub agent: AgentConfig,
    pub prompt: PromptConfig,
    pub progress: ProgressSettings,
    pub formatter: FormatterConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when `RUST_LOG` is not set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Agent process settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable. `~` and `$VARS` are expanded; a bare name is looked
    /// up on `PATH`.
    pub binary: String,
    /// Per-request deadline in seconds.
    pub timeout_secs: u64,
    /// Wait between a termination request and a forced kill.
    pub grace_period_secs: u64,
    /// Working directory for users without one of their own.
    pub default_working_dir: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "~/.bun/bin/claude".to_string(),
            timeout_secs: 300,
            grace_period_secs: 5,
            default_working_dir: "~".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSettings {
    pub interval_secs: u64,
    pub max_updates: usize,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3,
            max_updates: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatterConfig {
    pub max_message_length: usize,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            max_message_length: codebot_format::DEFAULT_MAX_LENGTH,
        }
    }
}

impl AppConfig {
    /// Load from `path` (missing file is fine) and the environment.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load), reading variables from `vars` instead of
    /// the process environment when given.
    pub fn load_with_env(path: &Path, vars: Option<Map<String, String>>) -> Result<Self> {
        let defaults = AgentConfig::default();
        let built = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("agent.binary", defaults.binary)?
            .set_default("agent.timeout_secs", defaults.timeout_secs as i64)?
            .set_default("agent.grace_period_secs", defaults.grace_period_secs as i64)?
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(&env_prefix())
                    .prefix_separator("_")
                    .separator("__")
                    .source(vars)
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("loading configuration from {}", path.display()))?;

        built
            .try_deserialize()
            .context("deserializing configuration")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }

    pub fn default_working_dir(&self) -> Result<PathBuf> {
        expand_str_path(&self.agent.default_working_dir)
    }

    /// Resolved agent binary path.
    pub fn agent_binary(&self) -> Result<PathBuf> {
        let expanded = expand_str_path(&self.agent.binary)?;
        Ok(find_on_path(&expanded).unwrap_or(expanded))
    }

    pub fn executor_config(&self) -> Result<ExecutorConfig> {
        Ok(ExecutorConfig {
            agent_binary: self.agent_binary()?,
            grace_period: Duration::from_secs(self.agent.grace_period_secs),
            progress: ProgressConfig {
                interval: Duration::from_secs(self.progress.interval_secs),
                max_updates: self.progress.max_updates,
                statuses: default_statuses(),
            },
            prompt: self.prompt.clone(),
        })
    }

    /// Problems that make the configuration unusable. Empty when fine.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.agent_binary() {
            Ok(path) if !path.is_file() => {
                problems.push(format!("agent binary not found at {}", path.display()));
            }
            Ok(_) => {}
            Err(err) => problems.push(format!("agent binary path: {err:#}")),
        }

        if self.agent.timeout_secs == 0 {
            problems.push("agent.timeout_secs must be greater than zero".to_string());
        }

        if self.formatter.max_message_length < codebot_format::MIN_MAX_LENGTH {
            problems.push(format!(
                "formatter.max_message_length must be at least {}",
                codebot_format::MIN_MAX_LENGTH
            ));
        }

        if self.progress.interval_secs == 0 && self.progress.max_updates > 0 {
            problems.push("progress.interval_secs must be greater than zero".to_string());
        }

        problems
    }
}

/// A bare program name resolved against `PATH`.
fn find_on_path(program: &Path) -> Option<PathBuf> {
    if program.components().count() != 1 || program.is_absolute() {
        return None;
    }
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {APP_NAME}\n\
         # File: {}\n\
         # Every key can be overridden with {}_<SECTION>__<KEY>.\n\n",
        path.display(),
        env_prefix()
    )
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

/// `config.toml` inside the default config directory.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn env_prefix() -> String {
    APP_NAME.replace('-', "_").to_ascii_uppercase()
}
