/**
 * STORE - État relationnel SQLite du kernel
 *
 * TABLES : principals, hosts, processes (snapshot courant par hôte), logs.
 * Les process et logs d'un hôte sont supprimés avec lui (ON DELETE CASCADE).
 *
 * Une seule connexion derrière un mutex ; chaque mutation multi-requêtes
 * est une transaction (un ingest passe entièrement ou pas du tout).
 */

use crate::models::{
    now_unix, rfc3339, Host, HostStatus, LogFilter, LogRecord, PrincipalRecord, ProcessOverview, ProcessRecord,
};
use crate::retention;
use parking_lot::Mutex;
use pmrelay_contracts::{LogKind, LogLine, ProcessSnapshot, ProcessStatus};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS principals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT UNIQUE NOT NULL,
    password_salt TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS hosts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    unique_key TEXT UNIQUE NOT NULL,
    address TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'offline',
    last_seen INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS processes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    pm_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    pid INTEGER,
    cpu REAL NOT NULL DEFAULT 0,
    memory INTEGER NOT NULL DEFAULT 0,
    uptime INTEGER NOT NULL DEFAULT 0,
    restarts INTEGER NOT NULL DEFAULT 0,
    cwd TEXT,
    script TEXT,
    last_updated INTEGER NOT NULL,
    UNIQUE (host_id, name)
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    process_name TEXT NOT NULL,
    kind TEXT NOT NULL,
    message TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_processes_host ON processes(host_id);
CREATE INDEX IF NOT EXISTS idx_logs_group ON logs(host_id, process_name, id);
";

const HOST_COLUMNS: &str = "id, name, unique_key, address, status, last_seen, created_at";
const PROCESS_COLUMNS: &str =
    "p.id, p.host_id, p.pm_id, p.name, p.status, p.pid, p.cpu, p.memory, p.uptime, p.restarts, p.cwd, p.script, p.last_updated";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // ---- hosts ----

    /// Enregistre un hôte et génère sa clé secrète (32 hex).
    pub fn create_host(&self, name: &str, address: &str) -> Result<Host, StoreError> {
        let key = Uuid::new_v4().simple().to_string();
        let now = now_unix();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO hosts (name, unique_key, address, status, created_at) VALUES (?1, ?2, ?3, 'offline', ?4)",
            params![name, key, address, now],
        )?;
        Ok(Host {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            unique_key: key,
            address: address.to_string(),
            status: HostStatus::Offline,
            last_seen: None,
            created_at: now,
        })
    }

    pub fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {HOST_COLUMNS} FROM hosts ORDER BY name, id"))?;
        let hosts = stmt.query_map([], host_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(hosts)
    }

    pub fn get_host(&self, id: i64) -> Result<Option<Host>, StoreError> {
        let conn = self.conn.lock();
        let host = conn
            .query_row(&format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1"), [id], host_from_row)
            .optional()?;
        Ok(host)
    }

    pub fn find_host_by_key(&self, key: &str) -> Result<Option<Host>, StoreError> {
        let conn = self.conn.lock();
        let host = conn
            .query_row(&format!("SELECT {HOST_COLUMNS} FROM hosts WHERE unique_key = ?1"), [key], host_from_row)
            .optional()?;
        Ok(host)
    }

    /// Supprime l'hôte ; snapshots et logs suivent par cascade.
    pub fn delete_host(&self, id: i64) -> Result<Option<Host>, StoreError> {
        let conn = self.conn.lock();
        let host = conn
            .query_row(&format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1"), [id], host_from_row)
            .optional()?;
        if host.is_some() {
            conn.execute("DELETE FROM hosts WHERE id = ?1", [id])?;
        }
        Ok(host)
    }

    /// Passe offline les hôtes non vus depuis `cutoff`.
    pub fn mark_stale_offline(&self, cutoff: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE hosts SET status = 'offline' WHERE status = 'online' AND (last_seen IS NULL OR last_seen < ?1)",
            [cutoff],
        )?;
        Ok(n)
    }

    /// (suivis, en ligne)
    pub fn host_counts(&self) -> Result<(u32, u32), StoreError> {
        let conn = self.conn.lock();
        let counts = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN status = 'online' THEN 1 ELSE 0 END), 0) FROM hosts",
            [],
            |r| Ok((r.get::<_, i64>(0)? as u32, r.get::<_, i64>(1)? as u32)),
        )?;
        Ok(counts)
    }

    // ---- ingest ----

    /// Hôte online + remplacement complet de son snapshot.
    pub fn record_processes(&self, host_id: i64, processes: &[ProcessSnapshot]) -> Result<(), StoreError> {
        let now = now_unix();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        touch_host(&tx, host_id, now)?;
        tx.execute("DELETE FROM processes WHERE host_id = ?1", [host_id])?;
        {
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO processes
                 (host_id, pm_id, name, status, pid, cpu, memory, uptime, restarts, cwd, script, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for p in processes {
                insert.execute(params![
                    host_id,
                    p.pm_id,
                    p.name,
                    p.status.as_str(),
                    p.pid,
                    p.cpu,
                    p.memory as i64,
                    p.uptime as i64,
                    p.restarts,
                    p.cwd,
                    p.script,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Hôte online, ajout des lignes puis rétention de chaque process touché
    /// à `keep` lignes. Renvoie le nombre de lignes supprimées.
    pub fn record_logs(&self, host_id: i64, lines: &[LogLine], keep: usize) -> Result<usize, StoreError> {
        let now = now_unix();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        touch_host(&tx, host_id, now)?;
        let mut touched = BTreeSet::new();
        {
            let mut insert = tx.prepare(
                "INSERT INTO logs (host_id, process_name, kind, message, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for line in lines {
                insert.execute(params![host_id, line.process, line.kind.as_str(), line.message, now])?;
                touched.insert(line.process.as_str());
            }
        }
        let mut trimmed = 0;
        for process in touched {
            trimmed += retention::retain_last(&tx, host_id, process, keep)?;
        }
        tx.commit()?;
        Ok(trimmed)
    }

    // ---- queries ----

    pub fn host_processes(&self, host_id: i64) -> Result<Vec<ProcessRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROCESS_COLUMNS} FROM processes p WHERE p.host_id = ?1 ORDER BY p.name"
        ))?;
        let rows = stmt.query_map([host_id], process_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Tous les snapshots avec leur hôte, la dernière ligne de sortie et la
    /// dernière erreur de moins de `error_window_secs`.
    pub fn list_processes(&self, error_window_secs: i64) -> Result<Vec<ProcessOverview>, StoreError> {
        let error_cutoff = now_unix() - error_window_secs;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROCESS_COLUMNS}, h.name, h.status
             FROM processes p JOIN hosts h ON p.host_id = h.id
             ORDER BY h.name, p.name"
        ))?;
        let base = stmt
            .query_map([], |r| Ok((process_from_row(r)?, r.get::<_, String>(13)?, r.get::<_, String>(14)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut last_line = conn.prepare_cached(
            "SELECT message, timestamp FROM logs
             WHERE host_id = ?1 AND process_name = ?2 AND kind = ?3 AND timestamp >= ?4
             ORDER BY id DESC LIMIT 1",
        )?;
        let mut out = Vec::with_capacity(base.len());
        for (process, server_name, server_status) in base {
            let output = last_line
                .query_row(params![process.server_id, process.name, "output", i64::MIN], line_from_row)
                .optional()?;
            let error = last_line
                .query_row(params![process.server_id, process.name, "error", error_cutoff], line_from_row)
                .optional()?;
            out.push(ProcessOverview {
                process,
                server_name,
                server_status: HostStatus::parse(&server_status),
                last_output_message: output.as_ref().map(|(m, _)| m.clone()),
                last_output_timestamp: output.map(|(_, ts)| rfc3339(ts)),
                last_error_message: error.as_ref().map(|(m, _)| m.clone()),
                last_error_timestamp: error.map(|(_, ts)| rfc3339(ts)),
            });
        }
        Ok(out)
    }

    /// Lignes de log filtrées, les plus récentes d'abord.
    pub fn query_logs(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, StoreError> {
        let mut sql = String::from(
            "SELECT l.id, l.host_id, h.name, l.process_name, l.kind, l.message, l.timestamp
             FROM logs l JOIN hosts h ON l.host_id = h.id",
        );
        let mut conditions = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(host_id) = filter.host_id {
            values.push(Value::Integer(host_id));
            conditions.push(format!("l.host_id = ?{}", values.len()));
        }
        if let Some(process) = &filter.process_name {
            values.push(Value::Text(process.clone()));
            conditions.push(format!("l.process_name = ?{}", values.len()));
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        values.push(Value::Integer(filter.limit as i64));
        sql.push_str(&format!(" ORDER BY l.id DESC LIMIT ?{}", values.len()));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |r| {
                Ok(LogRecord {
                    id: r.get(0)?,
                    server_id: r.get(1)?,
                    server_name: r.get(2)?,
                    process_name: r.get(3)?,
                    kind: parse_kind(&r.get::<_, String>(4)?),
                    message: r.get(5)?,
                    timestamp: rfc3339(r.get(6)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- principals ----

    pub fn find_principal(&self, username: &str) -> Result<Option<PrincipalRecord>, StoreError> {
        let conn = self.conn.lock();
        let principal = conn
            .query_row(
                "SELECT id, username, password_salt, password_hash FROM principals WHERE username = ?1",
                [username],
                |r| {
                    Ok(PrincipalRecord {
                        id: r.get(0)?,
                        username: r.get(1)?,
                        password_salt: r.get(2)?,
                        password_hash: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(principal)
    }

    /// Insère le principal sauf si le username existe déjà.
    pub fn insert_principal(&self, username: &str, salt: &str, hash: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "INSERT OR IGNORE INTO principals (username, password_salt, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![username, salt, hash, now_unix()],
        )?;
        Ok(n > 0)
    }

    #[cfg(test)]
    pub fn count_rows(&self, table: &str, host_id: i64) -> usize {
        let conn = self.conn.lock();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table} WHERE host_id = ?1"), [host_id], |r| {
            r.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }
}

fn touch_host(conn: &Connection, host_id: i64, now: i64) -> rusqlite::Result<usize> {
    conn.execute("UPDATE hosts SET status = 'online', last_seen = ?2 WHERE id = ?1", params![host_id, now])
}

fn host_from_row(r: &Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        id: r.get(0)?,
        name: r.get(1)?,
        unique_key: r.get(2)?,
        address: r.get(3)?,
        status: HostStatus::parse(&r.get::<_, String>(4)?),
        last_seen: r.get(5)?,
        created_at: r.get(6)?,
    })
}

fn process_from_row(r: &Row<'_>) -> rusqlite::Result<ProcessRecord> {
    Ok(ProcessRecord {
        id: r.get(0)?,
        server_id: r.get(1)?,
        pm_id: r.get(2)?,
        name: r.get(3)?,
        status: ProcessStatus::from_supervisor(&r.get::<_, String>(4)?),
        pid: r.get(5)?,
        cpu: r.get(6)?,
        memory: r.get::<_, i64>(7)?.max(0) as u64,
        uptime: r.get::<_, i64>(8)?.max(0) as u64,
        restarts: r.get(9)?,
        cwd: r.get(10)?,
        script: r.get(11)?,
        last_updated: rfc3339(r.get(12)?),
    })
}

fn line_from_row(r: &Row<'_>) -> rusqlite::Result<(String, i64)> {
    Ok((r.get(0)?, r.get(1)?))
}

fn parse_kind(raw: &str) -> LogKind {
    if raw == "error" { LogKind::Error } else { LogKind::Output }
}
