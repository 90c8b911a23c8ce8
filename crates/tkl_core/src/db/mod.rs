use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::AppError;

const MIGRATIONS: [(&str, &str); 3] = [
    (
        "0001_init.sql",
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../migrations/0001_init.sql"
        )),
    ),
    (
        "0002_chunks.sql",
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../migrations/0002_chunks.sql"
        )),
    ),
    (
        "0003_embeddings.sql",
        include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../../migrations/0003_embeddings.sql"
        )),
    ),
];

fn sql_err(
    code: &'static str,
    message: impl Into<String>,
) -> impl FnOnce(rusqlite::Error) -> AppError {
    let message = message.into();
    move |e| AppError::new(code, message).with_details(e.to_string())
}

pub fn open(path: &Path) -> Result<Connection, AppError> {
    let conn = Connection::open(path).map_err(|e| {
        AppError::new("DB_OPEN_FAILED", "Failed to open SQLite database")
            .with_details(format!("path={}; err={}", path.display(), e))
    })?;
    // Writers from concurrent ingest runs wait instead of failing fast.
    conn.busy_timeout(Duration::from_secs(5))
        .map_err(sql_err("DB_OPEN_FAILED", "Failed to set busy timeout"))?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection, AppError> {
    Connection::open_in_memory().map_err(sql_err(
        "DB_OPEN_FAILED",
        "Failed to open in-memory SQLite database",
    ))
}

/// Apply pending migrations by name, each exactly once, in listed order.
/// Each migration runs inside its own transaction together with the row
/// that records it.
pub fn migrate(conn: &mut Connection) -> Result<(), AppError> {
    conn.execute_batch(
        r#"
      PRAGMA foreign_keys = ON;
      CREATE TABLE IF NOT EXISTS _migrations (
        name TEXT PRIMARY KEY NOT NULL,
        applied_at TEXT NOT NULL
      );
    "#,
    )
    .map_err(sql_err(
        "DB_MIGRATIONS_TABLE_FAILED",
        "Failed to ensure migrations table exists",
    ))?;

    let applied: HashSet<String> = {
        let mut stmt = conn.prepare("SELECT name FROM _migrations").map_err(sql_err(
            "DB_MIGRATIONS_QUERY_FAILED",
            "Failed to query applied migrations",
        ))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sql_err(
                "DB_MIGRATIONS_QUERY_FAILED",
                "Failed to read applied migrations",
            ))?;
        names.collect::<Result<_, _>>().map_err(sql_err(
            "DB_MIGRATIONS_QUERY_FAILED",
            "Failed to read applied migration row",
        ))?
    };

    for (name, sql) in MIGRATIONS {
        if applied.contains(name) {
            continue;
        }

        let tx = conn.transaction().map_err(sql_err(
            "DB_TX_FAILED",
            "Failed to start migration transaction",
        ))?;
        tx.execute_batch(sql)
            .map_err(sql_err("DB_MIGRATION_FAILED", format!("Migration {name} failed")))?;
        tx.execute(
            "INSERT INTO _migrations(name, applied_at) VALUES (?1, strftime('%Y-%m-%dT%H:%M:%fZ','now'))",
            [name],
        )
        .map_err(sql_err(
            "DB_MIGRATION_FAILED",
            format!("Failed to record migration {name}"),
        ))?;
        tx.commit().map_err(sql_err(
            "DB_TX_FAILED",
            "Failed to commit migration transaction",
        ))?;
    }

    Ok(())
}
