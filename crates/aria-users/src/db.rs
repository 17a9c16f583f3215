use aria_core::types::{Tier, UserRole};
use rusqlite::{Connection, Result};

use crate::types::User;

/// Map a SELECT row (column order from USER_COLUMNS) to a User.
/// Centralised here so every query in this crate stays consistent.
pub(crate) fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    use std::str::FromStr;
    let role = UserRole::from_str(&row.get::<_, String>(2)?).unwrap_or_default();
    let tier = Tier::from_str(&row.get::<_, String>(3)?).unwrap_or_default();
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        role,
        tier,
        failed_attempts: row.get::<_, i64>(4)? as u32,
        first_failed_at: row.get(5)?,
        locked_until: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

pub(crate) const USER_COLUMNS: &str =
    "id, email, role, tier, failed_attempts, first_failed_at, locked_until,
     created_at, updated_at";

/// Initialise the users table. Safe to call on every startup — CREATE IF
/// NOT EXISTS means it's idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY NOT NULL,
            email           TEXT NOT NULL UNIQUE,
            role            TEXT NOT NULL DEFAULT 'user',
            tier            TEXT NOT NULL DEFAULT 'free',
            password_hash   TEXT NOT NULL,
            salt            TEXT NOT NULL,
            iterations      INTEGER NOT NULL,
            failed_attempts INTEGER NOT NULL DEFAULT 0,
            first_failed_at TEXT,
            locked_until    TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_users_email ON users (email);",
    )
}
