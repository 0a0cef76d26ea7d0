/**
 * AUTH - Principals, sessions et middleware d'accès admin
 *
 * RÔLE : Vérifie les identifiants opérateur (POST /api/login), émet des
 * tokens de session opaques et protège les routes /api admin.
 *
 * ACCÈS ACCEPTÉS :
 * - `Authorization: Bearer <token>` issu de /api/login (TTL configurable)
 * - `x-api-key` statique si configuré (service à service)
 *
 * STOCKAGE : mot de passe = sha256(salt || password) en hex, salt aléatoire
 * par principal. Les sessions vivent en mémoire (perdues au redémarrage).
 */

use crate::error::{ApiError, ApiResult};
use crate::http::AppState;
use crate::models::now_unix;
use crate::state::{new_state, Shared};
use crate::store::{Store, StoreError};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, Clone)]
struct Session {
    principal: Principal,
    expires_at: i64,
}

#[derive(Clone)]
pub struct Sessions {
    inner: Shared<HashMap<String, Session>>,
    ttl_secs: i64,
}

impl Sessions {
    pub fn new(ttl_hours: i64) -> Self {
        Self { inner: new_state(HashMap::new()), ttl_secs: ttl_hours * 3600 }
    }

    pub fn issue(&self, principal: Principal) -> String {
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        let expires_at = now_unix() + self.ttl_secs;
        let mut map = self.inner.lock();
        prune(&mut map, now_unix());
        map.insert(token.clone(), Session { principal, expires_at });
        token
    }

    pub fn resolve(&self, token: &str) -> Option<Principal> {
        self.resolve_at(token, now_unix())
    }

    fn resolve_at(&self, token: &str, now: i64) -> Option<Principal> {
        let mut map = self.inner.lock();
        match map.get(token) {
            Some(s) if s.expires_at > now => Some(s.principal.clone()),
            Some(_) => {
                map.remove(token);
                None
            }
            None => None,
        }
    }
}

fn prune(map: &mut HashMap<String, Session>, now: i64) {
    map.retain(|_, s| s.expires_at > now);
}

pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Crée le compte admin de la config s'il n'existe pas encore.
pub fn seed_default_principal(store: &Store, username: &str, password: &str) -> Result<bool, StoreError> {
    let salt = new_salt();
    let created = store.insert_principal(username, &salt, &hash_password(&salt, password))?;
    if created {
        info!("[auth] seeded principal {username}");
    }
    Ok(created)
}

pub fn verify(store: &Store, username: &str, password: &str) -> Result<Option<Principal>, StoreError> {
    let Some(record) = store.find_principal(username)? else { return Ok(None) };
    let candidate = hash_password(&record.password_salt, password);
    if constant_time_eq(candidate.as_bytes(), record.password_hash.as_bytes()) {
        Ok(Some(Principal { id: record.id, username: record.username }))
    } else {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: Principal,
}

// POST /api/login
pub async fn login(
    State(app): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<Json<LoginResponse>> {
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    match verify(&app.store, &body.username, &body.password)? {
        Some(user) => {
            info!("[auth] login ok for {}", user.username);
            let token = app.sessions.issue(user.clone());
            Ok(Json(LoginResponse { token, user }))
        }
        None => {
            warn!("[auth] failed login for {:?}", body.username);
            Err(ApiError::InvalidCredentials)
        }
    }
}

/// Middleware : résout le principal et l'insère dans les extensions.
pub async fn require_principal(State(app): State<AppState>, mut req: Request, next: Next) -> ApiResult<Response> {
    let headers = req.headers();

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if let Some(principal) = bearer.and_then(|t| app.sessions.resolve(t)) {
        req.extensions_mut().insert(principal);
        return Ok(next.run(req).await);
    }

    let api_key_ok = match (&app.cfg.auth.api_key, headers.get("x-api-key").and_then(|v| v.to_str().ok())) {
        (Some(expected), Some(given)) => !expected.is_empty() && constant_time_eq(expected.as_bytes(), given.as_bytes()),
        _ => false,
    };
    if api_key_ok {
        req.extensions_mut().insert(Principal { id: 0, username: "api-key".into() });
        return Ok(next.run(req).await);
    }

    warn!("[auth] unauthorized {} {}", req.method(), req.uri().path());
    Err(ApiError::Unauthorized)
}
