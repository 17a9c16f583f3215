use std::sync::Mutex;

use chrono::{Duration, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::token;
use crate::types::Session;

/// Thread-safe manager for persisted user sessions.
///
/// Wraps a single SQLite connection in a `Mutex`. For high-concurrency
/// deployments consider a connection pool, but a Mutex is sufficient for
/// the single-node target.
pub struct SessionManager {
    db: Mutex<Connection>,
    /// Idle sessions expire after this many seconds.
    ttl_s: u64,
    /// Oldest session is evicted when a user exceeds this many.
    max_per_user: usize,
}

impl SessionManager {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection, ttl_s: u64, max_per_user: usize) -> Self {
        Self {
            db: Mutex::new(conn),
            ttl_s,
            max_per_user,
        }
    }

    /// Issue a fresh session for a user. Returns the wire token (shown to
    /// the client exactly once) and the stored record. Enforces the
    /// per-user cap by evicting the oldest session.
    #[instrument(skip(self))]
    pub fn issue(&self, user_id: &str) -> Result<(String, Session)> {
        let (plaintext, digest) = token::generate()?;
        let now = Utc::now().to_rfc3339();
        let session = Session {
            id: Uuid::now_v7().to_string(),
            user_id: user_id.to_string(),
            created_at: now.clone(),
            last_seen_at: now.clone(),
        };

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO sessions (id, token_hash, user_id, created_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![session.id, digest, user_id, now],
        )?;

        // Cap enforcement: keep the newest max_per_user rows.
        db.execute(
            "DELETE FROM sessions
             WHERE user_id = ?1 AND id NOT IN (
                SELECT id FROM sessions
                WHERE user_id = ?1
                ORDER BY created_at DESC, id DESC
                LIMIT ?2
             )",
            params![user_id, self.max_per_user as i64],
        )?;

        info!(user_id, session_id = %session.id, "session issued");
        Ok((plaintext, session))
    }

    /// Resolve a wire token to its session, enforcing the idle TTL and
    /// bumping `last_seen_at` on success.
    pub fn resume(&self, wire_token: &str) -> Result<Session> {
        let digest = token::digest_hex(wire_token);
        let db = self.db.lock().unwrap();
        let session = match db.query_row(
            "SELECT id, user_id, created_at, last_seen_at
             FROM sessions WHERE token_hash = ?1",
            params![digest],
            row_to_session,
        ) {
            Ok(s) => s,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Err(SessionError::Unknown),
            Err(e) => return Err(SessionError::Database(e)),
        };

        let now = Utc::now();
        let idle_ok = chrono::DateTime::parse_from_rfc3339(&session.last_seen_at)
            .map(|t| now.signed_duration_since(t) < Duration::seconds(self.ttl_s as i64))
            .unwrap_or(false);
        if !idle_ok {
            db.execute("DELETE FROM sessions WHERE id = ?1", params![session.id])?;
            debug!(session_id = %session.id, "expired session purged");
            return Err(SessionError::Expired);
        }

        db.execute(
            "UPDATE sessions SET last_seen_at = ?2 WHERE id = ?1",
            params![session.id, now.to_rfc3339()],
        )?;
        Ok(Session {
            last_seen_at: now.to_rfc3339(),
            ..session
        })
    }

    /// List a user's sessions, newest first.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, created_at, last_seen_at
             FROM sessions
             WHERE user_id = ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id], row_to_session)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Revoke by wire token (logout path).
    pub fn revoke(&self, wire_token: &str) -> Result<()> {
        let digest = token::digest_hex(wire_token);
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "DELETE FROM sessions WHERE token_hash = ?1",
            params![digest],
        )?;
        if changed == 0 {
            return Err(SessionError::Unknown);
        }
        Ok(())
    }

    /// Revoke by session id (admin / session-management path).
    pub fn revoke_by_id(&self, session_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        if changed == 0 {
            return Err(SessionError::Unknown);
        }
        Ok(())
    }

    /// Drop every session a user holds. Called on password change.
    #[instrument(skip(self))]
    pub fn revoke_all_for_user(&self, user_id: &str) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let changed = db.execute("DELETE FROM sessions WHERE user_id = ?1", params![user_id])?;
        info!(user_id, revoked = changed, "sessions revoked");
        Ok(changed)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        created_at: row.get(2)?,
        last_seen_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(ttl_s: u64, cap: usize) -> SessionManager {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        SessionManager::new(conn, ttl_s, cap)
    }

    #[test]
    fn issue_then_resume() {
        let mgr = manager(3600, 5);
        let (token, session) = mgr.issue("u1").unwrap();
        let resumed = mgr.resume(&token).unwrap();
        assert_eq!(resumed.id, session.id);
        assert_eq!(resumed.user_id, "u1");
    }

    #[test]
    fn unknown_token_is_rejected() {
        let mgr = manager(3600, 5);
        assert!(matches!(
            mgr.resume("not-a-token").unwrap_err(),
            SessionError::Unknown
        ));
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let mgr = manager(0, 5);
        let (token, _) = mgr.issue("u1").unwrap();
        assert!(matches!(
            mgr.resume(&token).unwrap_err(),
            SessionError::Expired
        ));
        // Expired rows are purged, so a second attempt reports Unknown.
        assert!(matches!(
            mgr.resume(&token).unwrap_err(),
            SessionError::Unknown
        ));
    }

    #[test]
    fn per_user_cap_evicts_oldest() {
        let mgr = manager(3600, 2);
        let (t1, _) = mgr.issue("u1").unwrap();
        let (t2, _) = mgr.issue("u1").unwrap();
        let (t3, _) = mgr.issue("u1").unwrap();

        assert!(mgr.resume(&t1).is_err(), "oldest session must be evicted");
        assert!(mgr.resume(&t2).is_ok());
        assert!(mgr.resume(&t3).is_ok());
        assert_eq!(mgr.list_for_user("u1").unwrap().len(), 2);
    }

    #[test]
    fn cap_is_per_user() {
        let mgr = manager(3600, 1);
        let (t_a, _) = mgr.issue("alice").unwrap();
        let (t_b, _) = mgr.issue("bob").unwrap();
        assert!(mgr.resume(&t_a).is_ok());
        assert!(mgr.resume(&t_b).is_ok());
    }

    #[test]
    fn revoke_all_invalidates_everything() {
        let mgr = manager(3600, 5);
        let (t1, _) = mgr.issue("u1").unwrap();
        let (t2, _) = mgr.issue("u1").unwrap();
        assert_eq!(mgr.revoke_all_for_user("u1").unwrap(), 2);
        assert!(mgr.resume(&t1).is_err());
        assert!(mgr.resume(&t2).is_err());
    }

    #[test]
    fn logout_revokes_single_token() {
        let mgr = manager(3600, 5);
        let (t1, _) = mgr.issue("u1").unwrap();
        let (t2, _) = mgr.issue("u1").unwrap();
        mgr.revoke(&t1).unwrap();
        assert!(mgr.resume(&t1).is_err());
        assert!(mgr.resume(&t2).is_ok());
    }
}
