//! Process supervisor invocation
//!
//! Every call is an argument vector handed straight to the supervisor
//! binary; nothing goes through a shell. Calls are bounded by a timeout.

use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Outcome of one supervisor invocation
#[derive(Debug, Clone, Default)]
pub struct SupervisorOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

pub trait Supervisor {
    async fn run(&self, args: &[String]) -> Result<SupervisorOutput>;
}

/// The `pm2` command line
pub struct Pm2Cli {
    binary: String,
    timeout: Duration,
}

impl Pm2Cli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self { binary: binary.into(), timeout }
    }
}

impl Supervisor for Pm2Cli {
    async fn run(&self, args: &[String]) -> Result<SupervisorOutput> {
        let start_time = Instant::now();
        debug!("Running {} {:?} (timeout: {:?})", self.binary, args, self.timeout);

        let output = tokio::time::timeout(
            self.timeout,
            AsyncCommand::new(&self.binary)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .context("Supervisor command timed out")?
        .with_context(|| format!("Failed to execute {}", self.binary))?;

        Ok(SupervisorOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }
}

/// Shorthand for building argument vectors.
pub fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_binary_with_argument_vector() {
        let cli = Pm2Cli::new("echo", Duration::from_secs(5));
        let out = cli.run(&args(["hello", "my app; rm -rf /"])).await.unwrap();
        assert!(out.success);
        // no shell: the semicolon stays literal
        assert_eq!(out.stdout.trim(), "hello my app; rm -rf /");
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let cli = Pm2Cli::new("sleep", Duration::from_millis(200));
        assert!(cli.run(&args(["10"])).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_binary_is_error() {
        let cli = Pm2Cli::new("pmrelay-no-such-binary", Duration::from_secs(1));
        assert!(cli.run(&args(["jlist"])).await.is_err());
    }
}
