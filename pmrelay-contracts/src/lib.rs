//! Wire contracts shared by the pmrelay kernel and its host agents.
//!
//! The agent initiates every exchange: it posts an [`IngestRequest`] to the
//! kernel's agent endpoint and receives an [`IngestResponse`], which carries at
//! most one [`PendingCommand`]. Field names follow the JSON the dashboard and
//! older agents already speak (`pm_id`, `oldProcess`, ...).

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Path of the ingest endpoint, relative to the controller base URL.
pub const AGENT_PATH: &str = "/api/agent";

/// Lifecycle status of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Online,
    Stopped,
    Errored,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ProcessStatus {
    /// Maps a raw supervisor status string. Transitional states such as
    /// `launching` or `stopping` are reported as `Unknown`.
    pub fn from_supervisor(raw: &str) -> Self {
        match raw {
            "online" => Self::Online,
            "stopped" => Self::Stopped,
            "errored" => Self::Errored,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
            Self::Unknown => "unknown",
        }
    }
}

/// One managed process as seen by the supervisor at collection time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    #[serde(default)]
    pub pm_id: i64,
    pub name: String,
    #[serde(default)]
    pub status: ProcessStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub cpu: f64,
    /// Resident memory in bytes.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub memory: u64,
    /// Seconds since the process was (re)started.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub uptime: u64,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
}

/// Older agents compute counters with float arithmetic: any JSON number
/// (or null) is accepted, fractions are truncated and negatives read as 0.
fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(n) = Option::<serde_json::Number>::deserialize(deserializer)? else {
        return Ok(0);
    };
    Ok(n.as_u64().unwrap_or_else(|| n.as_f64().map_or(0, |f| f.max(0.0) as u64)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Output,
    Error,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::Error => "error",
        }
    }
}

/// A single output or error line of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub process: String,
    #[serde(rename = "type")]
    pub kind: LogKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestKind {
    Processes,
    Logs,
}

/// Body of every agent push.
///
/// `data` stays raw until the kernel has authenticated the key, so an
/// unknown host never costs more than parsing the envelope. A missing
/// `key` reads as empty and is rejected like any other unknown key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub key: String,
    #[serde(rename = "type")]
    pub kind: IngestKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Typed content of an [`IngestRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum IngestPayload {
    Processes(Vec<ProcessSnapshot>),
    Logs(Vec<LogLine>),
}

impl IngestRequest {
    pub fn processes(key: &str, processes: &[ProcessSnapshot]) -> serde_json::Result<Self> {
        Ok(Self {
            key: key.to_string(),
            kind: IngestKind::Processes,
            data: serde_json::to_value(processes)?,
        })
    }

    pub fn logs(key: &str, lines: &[LogLine]) -> serde_json::Result<Self> {
        Ok(Self {
            key: key.to_string(),
            kind: IngestKind::Logs,
            data: serde_json::to_value(lines)?,
        })
    }

    /// Decodes `data` according to `type`. A missing or null `data` is an
    /// empty batch.
    pub fn into_payload(self) -> serde_json::Result<IngestPayload> {
        let data = match self.data {
            serde_json::Value::Null => serde_json::Value::Array(Vec::new()),
            other => other,
        };
        match self.kind {
            IngestKind::Processes => Ok(IngestPayload::Processes(serde_json::from_value(data)?)),
            IngestKind::Logs => Ok(IngestPayload::Logs(serde_json::from_value(data)?)),
        }
    }
}

/// Actions an operator can queue for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Start,
    Stop,
    Restart,
    Delete,
    Create,
    Edit,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Delete => "delete",
            Self::Create => "create",
            Self::Edit => "edit",
        }
    }

    /// `create` and `edit` carry a launch specification (script, cwd).
    pub fn launches(&self) -> bool {
        matches!(self, Self::Create | Self::Edit)
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl fmt::Display for UnknownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown action: {}", self.0)
    }
}

impl std::error::Error for UnknownAction {}

impl FromStr for CommandAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "delete" => Ok(Self::Delete),
            "create" => Ok(Self::Create),
            "edit" => Ok(Self::Edit),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

/// The single command a host may have queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCommand {
    pub action: CommandAction,
    pub process: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_process: Option<String>,
    /// Unix seconds at which the operator issued the command.
    #[serde(default)]
    pub timestamp: i64,
}

impl PendingCommand {
    pub fn new(action: CommandAction, process: impl Into<String>, timestamp: i64) -> Self {
        Self {
            action,
            process: process.into(),
            script: None,
            cwd: None,
            old_process: None,
            timestamp,
        }
    }

    pub fn with_launch(mut self, script: Option<String>, cwd: Option<String>) -> Self {
        self.script = script;
        self.cwd = cwd;
        self
    }

    pub fn with_old_process(mut self, old_process: Option<String>) -> Self {
        self.old_process = old_process;
        self
    }

    /// Name to delete before re-creating on `edit`.
    pub fn previous_name(&self) -> &str {
        self.old_process.as_deref().unwrap_or(&self.process)
    }
}

/// Reply to an agent push: either a queued command or a bare acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IngestResponse {
    Command { command: PendingCommand },
    Ack { success: bool },
}

impl IngestResponse {
    pub fn ack() -> Self {
        Self::Ack { success: true }
    }

    pub fn from_pending(command: Option<PendingCommand>) -> Self {
        match command {
            Some(command) => Self::Command { command },
            None => Self::ack(),
        }
    }

    pub fn into_command(self) -> Option<PendingCommand> {
        match self {
            Self::Command { command } => Some(command),
            Self::Ack { .. } => None,
        }
    }
}

/// Structured error body returned by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
