//! pmrelay agent - host-resident reporter for the pmrelay controller
//!
//! Every cycle the agent:
//! - snapshots the pm2 process table and pushes it to the controller
//! - pushes the latest log lines (throttled)
//! - runs the command the controller handed back, if any
//!
//! The loop is strictly sequential; a failed step is logged and the next
//! cycle is the retry.

mod collector;
mod config;
mod executor;
mod supervisor;
mod tailer;
mod transport;

use anyhow::{Context, Result};
use config::AgentConfig;
use executor::Executor;
use pmrelay_contracts::{IngestRequest, PendingCommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use supervisor::{Pm2Cli, Supervisor};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use transport::{ControllerLink, HttpLink, TransportError};

/// What one cycle did, for the summary line and for tests.
#[derive(Debug, Default, PartialEq)]
struct CycleSummary {
    processes: usize,
    log_lines: Option<usize>,
    executed: Option<String>,
}

/// Main agent state
struct Agent<S, L> {
    config: AgentConfig,
    supervisor: S,
    link: L,
    executor: Executor,
    log_dir: PathBuf,
    last_log_push: Option<Instant>,
}

impl<S: Supervisor, L: ControllerLink> Agent<S, L> {
    fn new(config: AgentConfig, supervisor: S, link: L) -> Self {
        let executor = Executor::new(&config.cadence);
        let log_dir = config.supervisor.resolved_log_dir();
        Self { config, supervisor, link, executor, log_dir, last_log_push: None }
    }

    /// Run cycles until Ctrl-C / SIGTERM.
    async fn run(&mut self) -> Result<()> {
        info!("Starting agent main loop (controller: {})", self.config.controller.url);
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            let summary = self.cycle().await;
            info!(
                "Sent {} processes{}{}",
                summary.processes,
                summary.log_lines.map(|n| format!(", {n} log lines")).unwrap_or_default(),
                summary.executed.map(|c| format!(", executed {c}")).unwrap_or_default(),
            );

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping agent");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.cadence.poll_interval()) => {}
            }
        }
    }

    async fn cycle(&mut self) -> CycleSummary {
        let processes = collector::collect(&self.supervisor).await;
        let mut summary = CycleSummary { processes: processes.len(), ..Default::default() };

        let command = match IngestRequest::processes(&self.config.controller.key, &processes) {
            Ok(request) => self.push(&request).await.and_then(|r| r.into_command()),
            Err(e) => {
                error!("Failed to encode process snapshot: {}", e);
                None
            }
        };

        if self.log_push_due() {
            let lines = tailer::tail(&self.log_dir, &processes, &self.config.tail);
            if lines.is_empty() {
                debug!("No log lines to push");
            } else {
                match IngestRequest::logs(&self.config.controller.key, &lines) {
                    // commands only ride on the processes response
                    Ok(request) => {
                        self.push(&request).await;
                    }
                    Err(e) => error!("Failed to encode log batch: {}", e),
                }
                summary.log_lines = Some(lines.len());
            }
            self.last_log_push = Some(Instant::now());
        }

        if let Some(cmd) = command {
            self.executor.execute(&self.supervisor, &cmd).await;
            summary.executed = Some(describe(&cmd));
        }
        summary
    }

    fn log_push_due(&self) -> bool {
        self.last_log_push.map_or(true, |at| at.elapsed() >= self.config.cadence.log_push_interval())
    }

    async fn push(&self, request: &IngestRequest) -> Option<pmrelay_contracts::IngestResponse> {
        match self.link.push(request).await {
            Ok(response) => Some(response),
            Err(e @ TransportError::Unauthorized(_)) => {
                error!("Push rejected, check the host key: {}", e);
                None
            }
            Err(e) => {
                warn!("Push failed: {}", e);
                None
            }
        }
    }
}

fn describe(cmd: &PendingCommand) -> String {
    format!("{} {}", cmd.action, cmd.process)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("pmrelay agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = AgentConfig::load(&args).await.context("Failed to load agent configuration")?;

    let supervisor = Pm2Cli::new(
        config.supervisor.binary.clone(),
        Duration::from_secs(config.supervisor.command_timeout_secs),
    );
    let link = HttpLink::new(&config.controller.url, Duration::from_secs(config.controller.timeout_secs))
        .context("Failed to build controller client")?;

    let mut agent = Agent::new(config, supervisor, link);
    agent.run().await.context("Agent execution failed")?;
    Ok(())
}
