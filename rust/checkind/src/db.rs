use anyhow::Context;
use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE: &str = "checkin.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace.to_string_lossy()
        )
    })?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open {}", db_path.to_string_lossy()))?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            roll TEXT PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            personal_email TEXT NOT NULL DEFAULT '',
            college_email TEXT NOT NULL DEFAULT '',
            phone TEXT NOT NULL DEFAULT '',
            address TEXT NOT NULL DEFAULT '',
            section TEXT NOT NULL DEFAULT '',
            year TEXT NOT NULL DEFAULT '',
            is_hosteller INTEGER NOT NULL DEFAULT 0,
            is_registered INTEGER NOT NULL DEFAULT 0,
            present INTEGER NOT NULL DEFAULT 0,
            has_paid INTEGER NOT NULL DEFAULT 0,
            transaction_id TEXT NOT NULL DEFAULT '',
            payment_qr TEXT NOT NULL DEFAULT '',
            joined_group INTEGER NOT NULL DEFAULT 0,
            docker_skill TEXT NOT NULL DEFAULT '',
            has_used_docker INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_present ON students(present)",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn open_in_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    init_schema(&conn).expect("init schema");
    conn
}
