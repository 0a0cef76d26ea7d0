use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub listen: String,
    pub database_path: PathBuf,
    pub mailbox: MailboxConf,
    pub retention: RetentionConf,
    pub hosts: HostsConf,
    pub auth: AuthConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MailboxBackend {
    File,
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MailboxConf {
    pub backend: MailboxBackend,
    pub dir: PathBuf, // un fichier JSON par clé d'hôte
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConf {
    pub log_lines_per_process: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HostsConf {
    pub offline_after_secs: i64,
    pub check_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthConf {
    pub session_ttl_hours: i64,
    pub admin: AdminConf,
    /// Clé statique acceptée dans `x-api-key` (surchargée par `PMRELAY_API_KEY`).
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AdminConf {
    pub username: String,
    pub password: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            database_path: PathBuf::from("./data/pmrelay.db"),
            mailbox: MailboxConf::default(),
            retention: RetentionConf::default(),
            hosts: HostsConf::default(),
            auth: AuthConf::default(),
        }
    }
}

impl Default for MailboxConf {
    fn default() -> Self {
        Self { backend: MailboxBackend::File, dir: PathBuf::from("./data/commands") }
    }
}

impl Default for RetentionConf {
    fn default() -> Self {
        Self { log_lines_per_process: crate::retention::DEFAULT_KEEP }
    }
}

impl Default for HostsConf {
    fn default() -> Self {
        Self { offline_after_secs: 90, check_interval_secs: 60 }
    }
}

impl Default for AdminConf {
    fn default() -> Self {
        Self { username: "admin".into(), password: "admin-pmrelay".into() }
    }
}

impl Default for AuthConf {
    fn default() -> Self {
        Self {
            session_ttl_hours: 7 * 24,
            admin: AdminConf::default(),
            api_key: None,
        }
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("PMRELAY_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("invalid config {path}: {e}, using defaults");
            KernelConfig::default()
        })
    } else {
        info!("no {path}, using default config");
        KernelConfig::default()
    };

    if let Ok(key) = std::env::var("PMRELAY_API_KEY") {
        if !key.is_empty() {
            cfg.auth.api_key = Some(key);
        }
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config("listen: 127.0.0.1:9000\nmailbox:\n  backend: memory\n").unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert_eq!(cfg.mailbox.backend, MailboxBackend::Memory);
        assert_eq!(cfg.mailbox.dir, PathBuf::from("./data/commands"));
        assert_eq!(cfg.retention.log_lines_per_process, 100);
        assert_eq!(cfg.hosts.offline_after_secs, 90);
    }

    #[test]
    fn test_empty_file_is_default() {
        let cfg = parse_config("  \n").unwrap();
        assert_eq!(cfg.auth.session_ttl_hours, 168);
        assert!(cfg.auth.api_key.is_none());
    }
}
