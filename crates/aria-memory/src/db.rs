use rusqlite::{Connection, Result};

/// Initialise memory tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_turns_table(conn)?;
    create_facts_table(conn)?;
    create_fts_index(conn)?;
    create_retry_table(conn)?;
    Ok(())
}

fn create_turns_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS turns (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            turn_id      TEXT NOT NULL UNIQUE,
            user_id      TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            session_id   TEXT NOT NULL,
            role         TEXT NOT NULL,
            content      TEXT NOT NULL,
            tool_name    TEXT,
            tool_payload TEXT,
            token_count  INTEGER NOT NULL DEFAULT 0,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_turns_user
            ON turns (user_id, id);
        CREATE INDEX IF NOT EXISTS idx_turns_session
            ON turns (user_id, session_id, id);",
    )
}

fn create_facts_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS facts (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id        TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            source_turn_id TEXT,
            text           TEXT NOT NULL,
            importance     REAL NOT NULL DEFAULT 0.5,
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_facts_user
            ON facts (user_id, created_at);",
    )
}

/// FTS5 virtual table for full-text search across fact text.
/// content='facts' makes it an external-content table — synced manually on write.
fn create_fts_index(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts
            USING fts5(text, content='facts', content_rowid='id');",
    )
}

/// Turns whose durable write failed are parked here for a later retry.
fn create_retry_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS retry_queue (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id    TEXT NOT NULL,
            payload    TEXT NOT NULL,
            created_at TEXT NOT NULL
        );",
    )
}
