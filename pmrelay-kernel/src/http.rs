/**
 * API REST PMRELAY - Serveur HTTP du kernel
 *
 * RÔLE :
 * Expose l'ingest des agents et l'API d'administration (hôtes, process,
 * logs, commandes). Interface entre le dashboard opérateur et le kernel.
 *
 * ROUTES :
 * - /health                                  public
 * - /api/login, /api/agent                   public (l'agent s'authentifie par sa clé)
 * - /api/servers, /api/processes, /api/logs,
 *   /api/system/health                       principal requis (Bearer ou x-api-key)
 *
 * ERREURS : toujours `{"error": "..."}` avec le code HTTP adapté (voir error.rs).
 */

use crate::auth::{login, require_principal, Sessions};
use crate::config::KernelConfig;
use crate::error::{ApiError, ApiResult};
use crate::health::{HealthTracker, KernelHealth};
use crate::ingest::agent_ingest;
use crate::mailbox::SharedMailbox;
use crate::models::{now_unix, to_view, HostView, LogFilter, LogRecord, ProcessOverview, ProcessRecord};
use crate::state::HostLocks;
use crate::store::Store;
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use pmrelay_contracts::{CommandAction, PendingCommand, AGENT_PATH};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

const DEFAULT_LOG_LIMIT: u32 = 100;
const MAX_LOG_LIMIT: u32 = 1000;
const ERROR_WINDOW_SECS: i64 = 3600;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub mailbox: SharedMailbox,
    pub host_locks: HostLocks,
    pub sessions: Sessions,
    pub health_tracker: HealthTracker,
    pub cfg: Arc<KernelConfig>,
}

pub fn build_router(app_state: AppState) -> Router {
    let admin = Router::new()
        .route("/servers", get(get_servers).post(create_server))
        .route("/servers/{id}", delete(delete_server))
        .route("/processes", get(get_processes))
        .route("/processes/server/{id}", get(get_server_processes))
        .route("/processes/{host_id}/{action}", post(issue_command))
        .route("/logs", get(get_logs))
        .route("/system/health", get(get_system_health))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), require_principal));

    let api = Router::new().route("/login", post(login)).merge(admin);

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route(AGENT_PATH, post(agent_ingest))
        .nest("/api", api)
        .with_state(app_state)
}

// GET /api/servers (liste + commande en attente)
async fn get_servers(State(app): State<AppState>) -> ApiResult<Json<Vec<HostView>>> {
    let now = now_unix();
    let mut views = Vec::new();
    for h in app.store.list_hosts()? {
        let pending = app.mailbox.peek(&h.unique_key)?;
        views.push(to_view(&h, now, app.cfg.hosts.offline_after_secs, pending));
    }
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
struct CreateServer {
    #[serde(default)]
    name: String,
    #[serde(default)]
    host: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedServer {
    id: i64,
    name: String,
    unique_key: String,
    host: String,
}

// POST /api/servers (enregistrement, la clé n'est renvoyée qu'ici)
async fn create_server(
    State(app): State<AppState>,
    body: Result<Json<CreateServer>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CreatedServer>)> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Name is required".into()));
    }
    let host = app.store.create_host(name, body.host.as_deref().unwrap_or("").trim())?;
    info!("[http] registered server {} (id {})", host.name, host.id);
    Ok((
        StatusCode::CREATED,
        Json(CreatedServer { id: host.id, name: host.name, unique_key: host.unique_key, host: host.address }),
    ))
}

/// Paramètres de chemin invalides → 400 JSON comme le reste de l'API.
fn path_param<T>(path: Result<Path<T>, PathRejection>) -> ApiResult<T> {
    path.map(|Path(value)| value).map_err(|e| ApiError::BadRequest(e.body_text()))
}

// DELETE /api/servers/{id}
async fn delete_server(
    State(app): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Value>> {
    let id = path_param(path)?;
    let guard = app.host_locks.for_host(id).lock_owned().await;
    let host = app.store.delete_host(id)?.ok_or(ApiError::NotFound("Server"))?;
    app.mailbox.clear(&host.unique_key)?;
    drop(guard);
    app.host_locks.forget(host.id);
    info!("[http] deleted server {} (id {})", host.name, host.id);
    Ok(Json(json!({ "success": true })))
}

// GET /api/processes (vue globale enrichie)
async fn get_processes(State(app): State<AppState>) -> ApiResult<Json<Vec<ProcessOverview>>> {
    Ok(Json(app.store.list_processes(ERROR_WINDOW_SECS)?))
}

// GET /api/processes/server/{id}
async fn get_server_processes(
    State(app): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<Vec<ProcessRecord>>> {
    let id = path_param(path)?;
    app.store.get_host(id)?.ok_or(ApiError::NotFound("Server"))?;
    Ok(Json(app.store.host_processes(id)?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueCommand {
    #[serde(default)]
    pub process_name: String,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub old_process_name: Option<String>,
}

/// Construit la commande à déposer ; `script`/`cwd` seulement pour
/// create/edit, `old_process` seulement pour edit.
pub fn build_command(action: CommandAction, body: IssueCommand, now: i64) -> PendingCommand {
    let mut cmd = PendingCommand::new(action, body.process_name, now);
    if action.launches() {
        cmd = cmd.with_launch(body.script, body.cwd);
    }
    if action == CommandAction::Edit {
        cmd = cmd.with_old_process(body.old_process_name.filter(|n| !n.is_empty()));
    }
    cmd
}

// POST /api/processes/{host_id}/{action}
async fn issue_command(
    State(app): State<AppState>,
    path: Result<Path<(i64, String)>, PathRejection>,
    body: Result<Json<IssueCommand>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let (host_id, action) = path_param(path)?;
    let action: CommandAction = action.parse().map_err(|_| ApiError::BadRequest("Invalid action".into()))?;
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if body.process_name.trim().is_empty() {
        return Err(ApiError::BadRequest("processName is required".into()));
    }
    if action.launches() && !body.script.as_deref().is_some_and(|s| !s.trim().is_empty()) {
        return Err(ApiError::BadRequest("script is required".into()));
    }

    // sous le verrou de l'hôte : une suppression concurrente ne laisse pas de commande orpheline
    let _guard = app.host_locks.for_host(host_id).lock_owned().await;
    let host = app.store.get_host(host_id)?.ok_or(ApiError::NotFound("Server"))?;

    let cmd = build_command(action, body, now_unix());
    app.mailbox.set(&host.unique_key, &cmd)?;
    info!("[http] queued {} {} for {}", cmd.action, cmd.process, host.name);
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsQuery {
    server_id: Option<i64>,
    process_name: Option<String>,
    limit: Option<u32>,
}

impl LogsQuery {
    fn into_filter(self) -> LogFilter {
        LogFilter {
            host_id: self.server_id,
            process_name: self.process_name.filter(|p| !p.is_empty()),
            limit: self.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT),
        }
    }
}

// GET /api/logs?serverId=&processName=&limit=
async fn get_logs(State(app): State<AppState>, Query(q): Query<LogsQuery>) -> ApiResult<Json<Vec<LogRecord>>> {
    Ok(Json(app.store.query_logs(&q.into_filter())?))
}

// GET /api/system/health
async fn get_system_health(State(app): State<AppState>) -> ApiResult<Json<KernelHealth>> {
    Ok(Json(app.health_tracker.get_health(&app.store)?))
}

#[cfg(test)]
impl AppState {
    pub fn for_tests() -> Self {
        let cfg = KernelConfig::default();
        Self {
            store: Arc::new(Store::open_in_memory().unwrap()),
            mailbox: Arc::new(crate::mailbox::MemoryMailbox::default()),
            host_locks: HostLocks::default(),
            sessions: Sessions::new(cfg.auth.session_ttl_hours),
            health_tracker: HealthTracker::new(),
            cfg: Arc::new(cfg),
        }
    }
}
