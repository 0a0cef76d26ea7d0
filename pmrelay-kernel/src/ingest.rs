/**
 * INGEST - Point d'entrée des agents (POST /api/agent)
 *
 * RÔLE : Authentifie l'agent par sa clé d'hôte, enregistre la poussée
 * (snapshot des process ou lignes de log) puis remet la commande en attente.
 *
 * ORDRE PAR REQUÊTE :
 * 1. clé inconnue → 401, rien n'est écrit
 * 2. verrou de l'hôte pris jusqu'à la fin de la requête
 * 3. transaction : hôte online + remplacement snapshot / insert logs + rétention
 * 4. take atomique sur la mailbox → {"command": ...} ou {"success": true}
 *
 * Si la transaction échoue, la mailbox n'est pas touchée.
 */

use crate::error::{ApiError, ApiResult};
use crate::http::AppState;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use pmrelay_contracts::{IngestPayload, IngestRequest, IngestResponse};
use tracing::{debug, info, warn};

pub async fn ingest(app: &AppState, req: IngestRequest) -> ApiResult<IngestResponse> {
    let Some(host) = app.store.find_host_by_key(&req.key)? else {
        warn!("[ingest] rejected push with unknown key");
        return Err(ApiError::InvalidKey);
    };
    let key = req.key.clone();
    let payload = req.into_payload().map_err(|e| ApiError::BadRequest(format!("invalid data: {e}")))?;

    let _guard = app.host_locks.for_host(host.id).lock_owned().await;

    match payload {
        IngestPayload::Processes(processes) => {
            app.store.record_processes(host.id, &processes)?;
            debug!("[ingest] {}: {} processes", host.name, processes.len());
        }
        IngestPayload::Logs(lines) => {
            let trimmed = app.store.record_logs(host.id, &lines, app.cfg.retention.log_lines_per_process)?;
            debug!("[ingest] {}: {} log lines ({} trimmed)", host.name, lines.len(), trimmed);
        }
    }

    let command = app.mailbox.take(&key)?;
    if let Some(cmd) = &command {
        info!("[ingest] delivering {} {} to {}", cmd.action, cmd.process, host.name);
    }
    Ok(IngestResponse::from_pending(command))
}

// POST /api/agent
pub async fn agent_ingest(
    State(app): State<AppState>,
    body: Result<Json<IngestRequest>, JsonRejection>,
) -> ApiResult<Json<IngestResponse>> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    Ok(Json(ingest(&app, req).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogFilter;
    use pmrelay_contracts::{CommandAction, IngestKind, LogKind, LogLine, PendingCommand, ProcessSnapshot};

    fn snapshot(name: &str) -> ProcessSnapshot {
        ProcessSnapshot { name: name.into(), ..Default::default() }
    }

    #[tokio::test]
    async fn test_unknown_key_writes_nothing() {
        let app = AppState::for_tests();
        let host = app.store.create_host("edge-1", "").unwrap();

        let req = IngestRequest::processes("abc123", &[snapshot("api")]).unwrap();
        let err = ingest(&app, req).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidKey));
        assert_eq!(err.to_string(), "Invalid key");
        assert!(app.store.host_processes(host.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_is_last_push_and_ack() {
        let app = AppState::for_tests();
        let host = app.store.create_host("edge-1", "").unwrap();

        for names in [vec!["a", "b", "c"], vec!["b"], vec!["d", "e"]] {
            let snaps: Vec<_> = names.iter().map(|n| snapshot(n)).collect();
            let resp = ingest(&app, IngestRequest::processes(&host.unique_key, &snaps).unwrap()).await.unwrap();
            assert_eq!(resp, IngestResponse::ack());
        }
        let names: Vec<_> = app.store.host_processes(host.id).unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["d", "e"]);
    }

    #[tokio::test]
    async fn test_command_delivered_once() {
        let app = AppState::for_tests();
        let host = app.store.create_host("edge-1", "").unwrap();
        app.mailbox
            .set(&host.unique_key, &PendingCommand::new(CommandAction::Restart, "api", 1))
            .unwrap();

        let first = ingest(&app, IngestRequest::processes(&host.unique_key, &[]).unwrap()).await.unwrap();
        let cmd = first.into_command().unwrap();
        assert_eq!(cmd.action, CommandAction::Restart);
        assert_eq!(cmd.process, "api");

        let second = ingest(&app, IngestRequest::processes(&host.unique_key, &[]).unwrap()).await.unwrap();
        assert_eq!(second, IngestResponse::ack());
    }

    #[tokio::test]
    async fn test_logs_push_is_capped() {
        let app = AppState::for_tests();
        let host = app.store.create_host("edge-1", "").unwrap();
        let lines: Vec<_> = (0..150)
            .map(|n| LogLine { process: "api".into(), kind: LogKind::Output, message: format!("l{n}") })
            .collect();

        ingest(&app, IngestRequest::logs(&host.unique_key, &lines).unwrap()).await.unwrap();
        let stored = app
            .store
            .query_logs(&LogFilter { host_id: Some(host.id), process_name: None, limit: 1000 })
            .unwrap();
        assert_eq!(stored.len(), 100);
        assert_eq!(stored[0].message, "l149");
    }

    #[tokio::test]
    async fn test_malformed_data_is_bad_request() {
        let app = AppState::for_tests();
        let host = app.store.create_host("edge-1", "").unwrap();
        app.mailbox
            .set(&host.unique_key, &PendingCommand::new(CommandAction::Stop, "api", 1))
            .unwrap();

        let req = IngestRequest { key: host.unique_key.clone(), kind: IngestKind::Processes, data: serde_json::json!({"oops": 1}) };
        assert!(matches!(ingest(&app, req).await, Err(ApiError::BadRequest(_))));
        // la commande reste en attente
        assert!(app.mailbox.peek(&host.unique_key).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_float_uptime_is_stored() {
        let app = AppState::for_tests();
        let host = app.store.create_host("edge-1", "").unwrap();
        let req: IngestRequest = serde_json::from_value(serde_json::json!({
            "key": host.unique_key,
            "type": "processes",
            "data": [{"pm_id": 0, "name": "api", "status": "online", "uptime": 12.5, "memory": 2048.0}]
        }))
        .unwrap();

        ingest(&app, req).await.unwrap();
        let stored = app.store.host_processes(host.id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].uptime, 12);
        assert_eq!(stored[0].memory, 2048);
    }

    #[tokio::test]
    async fn test_missing_key_is_unauthorized() {
        let app = AppState::for_tests();
        let req: IngestRequest = serde_json::from_value(serde_json::json!({"type": "processes", "data": []})).unwrap();

        let err = agent_ingest(State(app.clone()), Ok(Json(req))).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidKey));
        assert_eq!(err.status(), axum::http::StatusCode::UNAUTHORIZED);
    }
}
