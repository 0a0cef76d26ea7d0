//! Rétention bornée des logs : chaque groupe (hôte, process) ne garde que
//! ses lignes les plus récentes, par ordre d'insertion (row id), tous types
//! confondus.

use rusqlite::{params, Connection};

pub const DEFAULT_KEEP: usize = 100;

/// Supprime les lignes du groupe hors des `keep` plus récentes.
pub fn retain_last(conn: &Connection, host_id: i64, process: &str, keep: usize) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM logs
         WHERE host_id = ?1 AND process_name = ?2
           AND id NOT IN (
               SELECT id FROM logs
               WHERE host_id = ?1 AND process_name = ?2
               ORDER BY id DESC
               LIMIT ?3
           )",
        params![host_id, process, keep as i64],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with_logs(rows: &[(i64, &str, &str)]) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE logs (id INTEGER PRIMARY KEY AUTOINCREMENT, host_id INTEGER, process_name TEXT, kind TEXT, message TEXT);",
        )
        .unwrap();
        for (host, process, message) in rows {
            conn.execute(
                "INSERT INTO logs (host_id, process_name, kind, message) VALUES (?1, ?2, 'output', ?3)",
                params![host, process, message],
            )
            .unwrap();
        }
        conn
    }

    #[test]
    fn test_trim_only_touches_its_group() {
        let conn = conn_with_logs(&[
            (1, "api", "a1"),
            (1, "api", "a2"),
            (1, "api", "a3"),
            (1, "worker", "w1"),
            (2, "api", "b1"),
        ]);

        let removed = retain_last(&conn, 1, "api", 2).unwrap();
        assert_eq!(removed, 1);

        let remaining: Vec<String> = conn
            .prepare("SELECT message FROM logs ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(remaining, vec!["a2", "a3", "w1", "b1"]);
    }

    #[test]
    fn test_trim_under_bound_is_noop() {
        let conn = conn_with_logs(&[(1, "api", "a1")]);
        assert_eq!(retain_last(&conn, 1, "api", DEFAULT_KEEP).unwrap(), 0);
    }
}
