//! Execution of queued operator commands
//!
//! Maps a [`PendingCommand`] onto supervisor invocations:
//! - start / stop / restart / delete: `pm2 <verb> <process>`
//! - create: `pm2 start <script> --name <process> [--cwd <dir>]`
//! - edit: delete the previous name, wait for the supervisor to settle, create
//!
//! Failures are logged and never stop the agent loop.

use crate::config::CadenceConfig;
use crate::supervisor::{args, Supervisor};
use pmrelay_contracts::{CommandAction, PendingCommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub struct Executor {
    settle_delay: Duration,
    post_command_delay: Duration,
    home: Option<PathBuf>,
    current_dir: Option<PathBuf>,
}

impl Executor {
    pub fn new(cadence: &CadenceConfig) -> Self {
        Self {
            settle_delay: Duration::from_millis(cadence.settle_delay_ms),
            post_command_delay: Duration::from_millis(cadence.post_command_delay_ms),
            home: dirs::home_dir(),
            current_dir: std::env::current_dir().ok(),
        }
    }

    pub async fn execute<S: Supervisor>(&self, supervisor: &S, cmd: &PendingCommand) {
        info!("Executing: {} {}", cmd.action, cmd.process);
        match cmd.action {
            CommandAction::Start | CommandAction::Stop | CommandAction::Restart | CommandAction::Delete => {
                run_logged(supervisor, args([cmd.action.as_str(), cmd.process.as_str()])).await;
            }
            CommandAction::Create | CommandAction::Edit => {
                let Some(script) = cmd.script.as_deref().filter(|s| !s.trim().is_empty()) else {
                    // an edit never deletes without re-creating
                    warn!("Cannot {} {}: no script given", cmd.action, cmd.process);
                    return;
                };
                if cmd.action == CommandAction::Edit {
                    run_logged(supervisor, args(["delete", cmd.previous_name()])).await;
                    tokio::time::sleep(self.settle_delay).await;
                }
                self.create(supervisor, cmd, script).await;
            }
        }
        tokio::time::sleep(self.post_command_delay).await;
    }

    async fn create<S: Supervisor>(&self, supervisor: &S, cmd: &PendingCommand, script: &str) {
        let mut argv = args(["start", script, "--name", cmd.process.as_str()]);
        if let Some(dir) = self.resolve_cwd(cmd.cwd.as_deref()) {
            argv.push("--cwd".to_string());
            argv.push(dir);
        }
        run_logged(supervisor, argv).await;
    }

    /// Absent: the agent's own directory. Empty: no `--cwd`. `~` prefix:
    /// the home directory.
    fn resolve_cwd(&self, cwd: Option<&str>) -> Option<String> {
        match cwd {
            None => self.current_dir.as_ref().map(|d| d.to_string_lossy().into_owned()),
            Some("") => None,
            Some(dir) => match (dir.strip_prefix('~'), &self.home) {
                (Some(rest), Some(home)) => Some(format!("{}{}", home.to_string_lossy(), rest)),
                _ => Some(dir.to_string()),
            },
        }
    }
}

async fn run_logged<S: Supervisor>(supervisor: &S, argv: Vec<String>) {
    match supervisor.run(&argv).await {
        Ok(out) if out.success => info!("pm2 {} ok ({} ms)", argv.join(" "), out.execution_time_ms),
        Ok(out) => warn!("pm2 {} exited with {:?}: {}", argv.join(" "), out.exit_code, out.stderr.trim()),
        Err(e) => warn!("pm2 {} failed: {:#}", argv.join(" "), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::fake::RecordingSupervisor;

    fn executor(settle_ms: u64) -> Executor {
        Executor {
            settle_delay: Duration::from_millis(settle_ms),
            post_command_delay: Duration::ZERO,
            home: Some(PathBuf::from("/home/ops")),
            current_dir: Some(PathBuf::from("/opt/agent")),
        }
    }

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_simple_verbs() {
        let sup = RecordingSupervisor::default();
        let exec = executor(0);
        for action in [CommandAction::Start, CommandAction::Stop, CommandAction::Restart, CommandAction::Delete] {
            exec.execute(&sup, &PendingCommand::new(action, "my app", 1)).await;
        }
        assert_eq!(
            sup.recorded(),
            vec![
                strs(&["start", "my app"]),
                strs(&["stop", "my app"]),
                strs(&["restart", "my app"]),
                strs(&["delete", "my app"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_create_resolves_home() {
        let sup = RecordingSupervisor::default();
        let cmd = PendingCommand::new(CommandAction::Create, "svc", 1)
            .with_launch(Some("node app.js".into()), Some("~/svc".into()));
        executor(0).execute(&sup, &cmd).await;
        assert_eq!(sup.recorded(), vec![strs(&["start", "node app.js", "--name", "svc", "--cwd", "/home/ops/svc"])]);
    }

    #[tokio::test]
    async fn test_create_cwd_variants() {
        let exec = executor(0);
        assert_eq!(exec.resolve_cwd(None).as_deref(), Some("/opt/agent"));
        assert_eq!(exec.resolve_cwd(Some("")), None);
        assert_eq!(exec.resolve_cwd(Some("~")).as_deref(), Some("/home/ops"));
        assert_eq!(exec.resolve_cwd(Some("/srv/x")).as_deref(), Some("/srv/x"));

        let sup = RecordingSupervisor::default();
        let cmd = PendingCommand::new(CommandAction::Create, "svc", 1).with_launch(Some("app.js".into()), Some(String::new()));
        exec.execute(&sup, &cmd).await;
        assert_eq!(sup.recorded(), vec![strs(&["start", "app.js", "--name", "svc"])]);
    }

    #[tokio::test]
    async fn test_create_without_script_is_skipped() {
        let sup = RecordingSupervisor::default();
        executor(0).execute(&sup, &PendingCommand::new(CommandAction::Create, "svc", 1)).await;
        assert!(sup.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_edit_without_script_keeps_old_process() {
        let sup = RecordingSupervisor::default();
        let cmd = PendingCommand::new(CommandAction::Edit, "web2", 1).with_old_process(Some("web".into()));
        executor(0).execute(&sup, &cmd).await;
        assert!(sup.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_edit_deletes_waits_then_creates() {
        let sup = RecordingSupervisor::default();
        let cmd = PendingCommand::new(CommandAction::Edit, "web2", 1)
            .with_launch(Some("npm start".into()), None)
            .with_old_process(Some("web".into()));
        executor(50).execute(&sup, &cmd).await;

        let calls = sup.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, strs(&["delete", "web"]));
        assert_eq!(calls[1].1, strs(&["start", "npm start", "--name", "web2", "--cwd", "/opt/agent"]));
        assert!(calls[1].0 - calls[0].0 >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_supervisor_failure_is_swallowed() {
        let sup = RecordingSupervisor { fail: true, ..Default::default() };
        executor(0).execute(&sup, &PendingCommand::new(CommandAction::Stop, "api", 1)).await;
        assert_eq!(sup.recorded().len(), 1);
    }
}
