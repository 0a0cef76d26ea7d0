use pmrelay_contracts::{LogKind, PendingCommand, ProcessStatus};
use serde::Serialize;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Online,
    Offline,
}

impl HostStatus {
    pub fn parse(raw: &str) -> Self {
        if raw == "online" { Self::Online } else { Self::Offline }
    }
}

/// Hôte enregistré. `unique_key` est le secret de l'agent, jamais exposé
/// dans les vues opérateur.
#[derive(Debug, Clone)]
pub struct Host {
    pub id: i64,
    pub name: String,
    pub unique_key: String,
    pub address: String,
    pub status: HostStatus,
    pub last_seen: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Serialize)]
pub struct HostView {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub status: HostStatus,
    pub last_seen: Option<String>, // RFC3339
    pub stale: bool,
    pub stale_for_seconds: Option<i64>,
    pub pending_command: Option<PendingCommand>,
    pub created_at: String,
}

pub fn to_view(h: &Host, now: i64, offline_after_secs: i64, pending: Option<PendingCommand>) -> HostView {
    let age = h.last_seen.map(|seen| (now - seen).max(0));
    HostView {
        id: h.id,
        name: h.name.clone(),
        host: h.address.clone(),
        status: h.status,
        last_seen: h.last_seen.map(rfc3339),
        stale: age.map_or(true, |a| a > offline_after_secs),
        stale_for_seconds: age,
        pending_command: pending,
        created_at: rfc3339(h.created_at),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessRecord {
    pub id: i64,
    pub server_id: i64,
    pub pm_id: i64,
    pub name: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub cpu: f64,
    pub memory: u64,
    pub uptime: u64,
    pub restarts: u32,
    pub cwd: Option<String>,
    pub script: Option<String>,
    pub last_updated: String,
}

/// Ligne du dashboard : snapshot + hôte + dernières lignes de log.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessOverview {
    #[serde(flatten)]
    pub process: ProcessRecord,
    pub server_name: String,
    pub server_status: HostStatus,
    pub last_output_message: Option<String>,
    pub last_output_timestamp: Option<String>,
    pub last_error_message: Option<String>,
    pub last_error_timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub id: i64,
    pub server_id: i64,
    pub server_name: String,
    pub process_name: String,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub host_id: Option<i64>,
    pub process_name: Option<String>,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct PrincipalRecord {
    pub id: i64,
    pub username: String,
    pub password_salt: String,
    pub password_hash: String,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn rfc3339(ts: i64) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_default()
}
