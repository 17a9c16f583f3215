use rusqlite::{Connection, Result};

/// Initialise the sessions table. Idempotent; safe on every startup.
///
/// `ON DELETE CASCADE` ties session lifetime to the owning user row;
/// connections must run with `PRAGMA foreign_keys = ON` for it to fire.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id           TEXT PRIMARY KEY NOT NULL,
            token_hash   TEXT NOT NULL UNIQUE,
            user_id      TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at   TEXT NOT NULL,
            last_seen_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions (user_id, created_at);",
    )
}
