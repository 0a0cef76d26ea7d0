/**
 * PMRELAY KERNEL - Point d'entrée du contrôleur
 *
 * RÔLE : Orchestration des modules : config, store SQLite, mailbox de
 * commandes, monitoring des hôtes et API HTTP (ingest agents + admin).
 *
 * ARCHITECTURE : les agents poussent (pull-on-push), le kernel ne joint
 * jamais les hôtes. Les commandes attendent dans la mailbox jusqu'à la
 * prochaine poussée de l'hôte concerné.
 */

mod auth;
mod config;
mod error;
mod health;
mod http;
mod ingest;
mod mailbox;
mod models;
mod monitor;
mod retention;
mod state;
mod store;

use crate::auth::{seed_default_principal, Sessions};
use crate::config::load_config;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::state::HostLocks;
use crate::store::Store;

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Arc::new(load_config().await);

    let store = Store::open(&cfg.database_path)
        .with_context(|| format!("failed to open database {}", cfg.database_path.display()))?;
    let store = Arc::new(store);
    info!("[kernel] database ready at {}", cfg.database_path.display());

    seed_default_principal(&store, &cfg.auth.admin.username, &cfg.auth.admin.password)
        .context("failed to seed admin principal")?;

    let mailbox = mailbox::build(&cfg.mailbox).context("failed to open command mailbox")?;
    info!("[kernel] mailbox backend: {:?}", cfg.mailbox.backend);

    // passage offline des hôtes muets
    monitor::spawn_host_monitor(store.clone(), cfg.hosts.offline_after_secs, cfg.hosts.check_interval_secs);

    let app_state = AppState {
        store,
        mailbox,
        host_locks: HostLocks::default(),
        sessions: Sessions::new(cfg.auth.session_ttl_hours),
        health_tracker: HealthTracker::new(),
        cfg: cfg.clone(),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen))?;
    info!("[kernel] listening on http://{}", cfg.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;
    info!("[kernel] stopped");
    Ok(())
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("[kernel] shutdown requested");
}
