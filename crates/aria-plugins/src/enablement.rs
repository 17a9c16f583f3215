//! Per-user plugin enablement, persisted in SQLite with a copy-on-write
//! in-process cache. Reads are lock-free after first access; a toggle
//! rewrites the user's cached set.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rusqlite::{params, Connection};

use crate::error::Result;

pub struct EnablementStore {
    db: Mutex<Connection>,
    /// user_id → explicit toggles (plugin → enabled). Plugins absent from
    /// the map fall back to their descriptor's `default_enabled`.
    cache: DashMap<String, Arc<HashMap<String, bool>>>,
}

impl EnablementStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
            cache: DashMap::new(),
        }
    }

    pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS plugin_enablement (
                user_id    TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                plugin     TEXT NOT NULL,
                enabled    INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, plugin)
            );",
        )
    }

    /// Record an explicit toggle. Idempotent: repeating a toggle is a no-op
    /// at the observable level.
    pub fn set(&self, user_id: &str, plugin: &str, enabled: bool) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO plugin_enablement (user_id, plugin, enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, plugin) DO UPDATE SET
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
            params![
                user_id,
                plugin,
                enabled as i32,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        drop(db);
        self.cache.remove(user_id);
        Ok(())
    }

    /// The user's explicit toggles, loaded once and shared immutably.
    pub fn toggles(&self, user_id: &str) -> Result<Arc<HashMap<String, bool>>> {
        if let Some(cached) = self.cache.get(user_id) {
            return Ok(cached.clone());
        }
        let db = self.db.lock().unwrap();
        let mut stmt =
            db.prepare("SELECT plugin, enabled FROM plugin_enablement WHERE user_id = ?1")?;
        let map: HashMap<String, bool> = stmt
            .query_map(params![user_id], |row| {
                Ok((row.get(0)?, row.get::<_, i32>(1)? != 0))
            })?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(db);

        let arc = Arc::new(map);
        self.cache.insert(user_id.to_string(), arc.clone());
        Ok(arc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> EnablementStore {
        let conn = Connection::open_in_memory().unwrap();
        EnablementStore::init_db(&conn).unwrap();
        EnablementStore::new(conn)
    }

    #[test]
    fn toggle_round_trip() {
        let store = store();
        store.set("u1", "weather", false).unwrap();
        let toggles = store.toggles("u1").unwrap();
        assert_eq!(toggles.get("weather"), Some(&false));
    }

    #[test]
    fn toggles_are_per_user() {
        let store = store();
        store.set("u1", "weather", false).unwrap();
        assert!(store.toggles("u2").unwrap().is_empty());
    }

    #[test]
    fn double_enable_is_idempotent() {
        let store = store();
        store.set("u1", "weather", true).unwrap();
        let first = store.toggles("u1").unwrap();
        store.set("u1", "weather", true).unwrap();
        let second = store.toggles("u1").unwrap();
        assert_eq!(*first, *second);
    }
}
