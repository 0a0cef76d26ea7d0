//! Process telemetry collection
//!
//! Reads the supervisor's JSON listing (`pm2 jlist`) and normalizes each
//! entry into a [`ProcessSnapshot`]. Collection never fails the caller: a
//! broken supervisor simply reports no processes.

use crate::supervisor::{args, Supervisor};
use chrono::Utc;
use pmrelay_contracts::{ProcessSnapshot, ProcessStatus};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

const SHELL_WRAPPERS: [&str; 4] = ["/bin/bash", "/bin/sh", "/usr/bin/bash", "/usr/bin/sh"];

#[derive(Debug, Default, Deserialize)]
struct RawProcess {
    pm_id: Option<i64>,
    name: Option<String>,
    pid: Option<u64>,
    #[serde(default)]
    monit: RawMonit,
    #[serde(default)]
    pm2_env: RawEnv,
}

#[derive(Debug, Default, Deserialize)]
struct RawMonit {
    cpu: Option<f64>,
    memory: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    status: Option<String>,
    /// Start time, milliseconds since the epoch.
    pm_uptime: Option<f64>,
    restart_time: Option<u32>,
    pm_cwd: Option<String>,
    pm_exec_path: Option<String>,
    args: Option<Value>,
}

/// Snapshot every supervised process. Empty on any supervisor failure.
pub async fn collect<S: Supervisor>(supervisor: &S) -> Vec<ProcessSnapshot> {
    let output = match supervisor.run(&args(["jlist"])).await {
        Ok(output) => output,
        Err(e) => {
            warn!("Failed to list processes: {:#}", e);
            return Vec::new();
        }
    };
    if !output.success {
        warn!("Supervisor listing exited with {:?}: {}", output.exit_code, output.stderr.trim());
    }
    parse_listing(&output.stdout, Utc::now().timestamp_millis())
}

/// Normalize a raw listing. Unparsable input gives an empty vector; a single
/// malformed entry is skipped.
pub fn parse_listing(raw: &str, now_ms: i64) -> Vec<ProcessSnapshot> {
    let raw = raw.trim();
    if raw.is_empty() {
        debug!("Empty process listing");
        return Vec::new();
    }
    let entries: Vec<Value> = match serde_json::from_str(raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Unparsable process listing: {}", e);
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<RawProcess>(entry) {
            Ok(p) => Some(normalize(p, now_ms)),
            Err(e) => {
                debug!("Skipping malformed process entry: {}", e);
                None
            }
        })
        .collect()
}

fn normalize(p: RawProcess, now_ms: i64) -> ProcessSnapshot {
    let env = p.pm2_env;
    let uptime = env
        .pm_uptime
        .map(|started_ms| ((now_ms as f64 - started_ms) / 1000.0).max(0.0) as u64)
        .unwrap_or(0);

    ProcessSnapshot {
        pm_id: p.pm_id.unwrap_or(0),
        name: p.name.unwrap_or_else(|| "unknown".to_string()),
        status: env.status.as_deref().map(ProcessStatus::from_supervisor).unwrap_or_default(),
        pid: p.pid.filter(|&pid| pid != 0).and_then(|pid| u32::try_from(pid).ok()),
        cpu: p.monit.cpu.unwrap_or(0.0),
        memory: p.monit.memory.map(|m| m.max(0.0) as u64).unwrap_or(0),
        uptime,
        restarts: env.restart_time.unwrap_or(0),
        cwd: env.pm_cwd,
        script: script_of(env.pm_exec_path, env.args.as_ref()),
    }
}

/// `bash -c "<cmd>"` style processes report the wrapped command rather
/// than the shell binary.
fn script_of(exec_path: Option<String>, args: Option<&Value>) -> Option<String> {
    let exec_path = exec_path?;
    if !SHELL_WRAPPERS.contains(&exec_path.as_str()) {
        return Some(exec_path);
    }
    let args: Vec<&str> = args
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    match args.split_first() {
        Some((&"-c", rest)) if !rest.is_empty() => Some(rest.join(" ")),
        _ => Some(exec_path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::fake::RecordingSupervisor;

    const NOW_MS: i64 = 1_700_000_100_000;

    #[test]
    fn test_full_entry() {
        let raw = r#"[{
            "pm_id": 3, "name": "api", "pid": 4242,
            "monit": {"cpu": 2.5, "memory": 52428800},
            "pm2_env": {"status": "online", "pm_uptime": 1700000000000, "restart_time": 4,
                        "pm_cwd": "/srv/api", "pm_exec_path": "/srv/api/server.js"}
        }]"#;
        let snaps = parse_listing(raw, NOW_MS);
        assert_eq!(snaps.len(), 1);
        let s = &snaps[0];
        assert_eq!(s.pm_id, 3);
        assert_eq!(s.status, ProcessStatus::Online);
        assert_eq!(s.pid, Some(4242));
        assert_eq!(s.memory, 52_428_800);
        assert_eq!(s.uptime, 100);
        assert_eq!(s.restarts, 4);
        assert_eq!(s.script.as_deref(), Some("/srv/api/server.js"));
    }

    #[test]
    fn test_defaults_and_zero_pid() {
        let snaps = parse_listing(r#"[{"pid": 0, "pm2_env": {"status": "launching"}}]"#, NOW_MS);
        let s = &snaps[0];
        assert_eq!(s.name, "unknown");
        assert_eq!(s.pm_id, 0);
        assert_eq!(s.pid, None);
        assert_eq!(s.status, ProcessStatus::Unknown);
        assert_eq!(s.uptime, 0);
        assert!(s.cwd.is_none());
        assert!(s.script.is_none());
    }

    #[test]
    fn test_future_start_clamps_uptime() {
        let snaps = parse_listing(r#"[{"name": "a", "pm2_env": {"pm_uptime": 1800000000000}}]"#, NOW_MS);
        assert_eq!(snaps[0].uptime, 0);
    }

    #[test]
    fn test_shell_wrapper_reports_command() {
        let raw = r#"[
            {"name": "w", "pm2_env": {"pm_exec_path": "/bin/bash", "args": ["-c", "npm", "run", "start"]}},
            {"name": "x", "pm2_env": {"pm_exec_path": "/usr/bin/sh", "args": ["-c"]}},
            {"name": "y", "pm2_env": {"pm_exec_path": "/bin/sh", "args": ["script.sh"]}}
        ]"#;
        let snaps = parse_listing(raw, NOW_MS);
        assert_eq!(snaps[0].script.as_deref(), Some("npm run start"));
        assert_eq!(snaps[1].script.as_deref(), Some("/usr/bin/sh"));
        assert_eq!(snaps[2].script.as_deref(), Some("/bin/sh"));
    }

    #[test]
    fn test_garbage_is_empty() {
        assert!(parse_listing("", NOW_MS).is_empty());
        assert!(parse_listing("[PM2] Spawning PM2 daemon", NOW_MS).is_empty());
        assert!(parse_listing("{}", NOW_MS).is_empty());
        // one bad entry does not drop the others
        assert_eq!(parse_listing(r#"[{"name": 5}, {"name": "ok"}]"#, NOW_MS).len(), 1);
    }

    #[tokio::test]
    async fn test_collect_never_fails() {
        let broken = RecordingSupervisor { fail: true, ..Default::default() };
        assert!(collect(&broken).await.is_empty());

        let ok = RecordingSupervisor::with_jlist(r#"[{"name": "api"}]"#);
        assert_eq!(collect(&ok).await[0].name, "api");
        assert_eq!(ok.recorded(), vec![vec!["jlist".to_string()]]);
    }
}
