//! Agent configuration
//!
//! Handles:
//! - Controller endpoint and host key
//! - Loop cadence (poll interval, log push throttle, settle delays)
//! - Supervisor binary and log directory
//! - Tail limits
//!
//! Sources, lowest to highest priority: defaults, the TOML file in the OS
//! config directory, positional args `<server_url> <key>`, then
//! `PMRELAY_SERVER_URL` / `PMRELAY_AGENT_KEY`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const USAGE: &str = "usage: pmrelay-agent <server_url> <key>\n\
    (or set PMRELAY_SERVER_URL and PMRELAY_AGENT_KEY, or fill [controller] in the config file)";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub controller: ControllerConfig,
    pub cadence: CadenceConfig,
    pub supervisor: SupervisorConfig,
    pub tail: TailConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub url: String,
    pub key: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub poll_interval_secs: u64,
    pub log_push_interval_secs: u64,
    /// Pause between the delete and the re-create of an `edit`.
    pub settle_delay_ms: u64,
    /// Pause after every executed command.
    pub post_command_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub binary: String,
    pub command_timeout_secs: u64,
    /// Defaults to `<home>/.pm2/logs` when unset.
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    pub max_files: usize,
    pub lines_per_file: usize,
    pub max_batch: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { url: String::new(), key: String::new(), timeout_secs: 10 }
    }
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self { poll_interval_secs: 5, log_push_interval_secs: 30, settle_delay_ms: 1000, post_command_delay_ms: 1000 }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { binary: "pm2".to_string(), command_timeout_secs: 30, log_dir: None }
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self { max_files: 10, lines_per_file: 10, max_batch: 100 }
    }
}

impl CadenceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn log_push_interval(&self) -> Duration {
        Duration::from_secs(self.log_push_interval_secs)
    }
}

impl SupervisorConfig {
    pub fn resolved_log_dir(&self) -> PathBuf {
        match &self.log_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir().unwrap_or_default().join(".pm2").join("logs"),
        }
    }
}

impl AgentConfig {
    /// Load file config, then apply CLI args and environment.
    pub async fn load(args: &[String]) -> Result<Self> {
        let path = Self::config_file_path()?;
        let mut config = Self::from_file(&path).await?;
        config.apply_overrides(args, |name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("pmrelay-agent");
        path.push("config.toml");
        Ok(path)
    }

    fn apply_overrides(&mut self, args: &[String], env: impl Fn(&str) -> Option<String>) {
        if let Some(url) = args.first() {
            self.controller.url = url.clone();
        }
        if let Some(key) = args.get(1) {
            self.controller.key = key.clone();
        }
        if let Some(url) = env("PMRELAY_SERVER_URL").filter(|v| !v.is_empty()) {
            self.controller.url = url;
        }
        if let Some(key) = env("PMRELAY_AGENT_KEY").filter(|v| !v.is_empty()) {
            self.controller.key = key;
        }
        self.controller.url = self.controller.url.trim_end_matches('/').to_string();
    }

    fn validate(&self) -> Result<()> {
        if self.controller.url.is_empty() || self.controller.key.is_empty() {
            bail!("missing controller url or key\n{USAGE}");
        }
        Ok(())
    }
}
