use std::sync::Mutex;

use aria_core::types::{Tier, UserRole};
use chrono::{Duration, Utc};
use rusqlite::{params, Connection};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::{row_to_user, USER_COLUMNS};
use crate::error::{Result, UserError};
use crate::password;
use crate::types::User;

/// Failures inside this window count toward the lockout threshold.
const FAILURE_WINDOW_MIN: i64 = 15;
/// Consecutive failures that trigger a lock.
const MAX_FAILURES: u32 = 5;
/// Lock duration once the threshold is hit.
const LOCK_MIN: i64 = 30;

/// Thread-safe store for user records and credentials.
///
/// Wraps a single SQLite connection in a `Mutex`. All mutation goes through
/// this store; transport code only ever sees the `User` struct.
pub struct UserStore {
    db: Mutex<Connection>,
}

impl UserStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            db: Mutex::new(conn),
        }
    }

    /// Create a new user with a freshly derived credential.
    #[instrument(skip(self, pass))]
    pub fn register(&self, email: &str, pass: &str) -> Result<User> {
        let derived = password::derive(pass)?;
        let now = Utc::now().to_rfc3339();
        let user = User {
            id: Uuid::now_v7().to_string(),
            email: email.to_string(),
            role: UserRole::User,
            tier: Tier::Free,
            failed_attempts: 0,
            first_failed_at: None,
            locked_until: None,
            created_at: now.clone(),
            updated_at: now.clone(),
        };

        let db = self.db.lock().unwrap();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO users
                (id, email, role, tier, password_hash, salt, iterations,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                user.id,
                user.email,
                user.role.to_string(),
                user.tier.to_string(),
                hex::encode(derived.hash),
                hex::encode(derived.salt),
                derived.iterations,
                now,
            ],
        )?;
        if inserted == 0 {
            return Err(UserError::UserExists);
        }
        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Verify credentials, enforcing the failure lockout.
    ///
    /// On success the failure counter is cleared. On failure the counter
    /// advances; crossing the threshold locks the account for 30 minutes.
    /// A locked account rejects even correct passwords until the lock
    /// expires.
    #[instrument(skip(self, pass))]
    pub fn authenticate(&self, email: &str, pass: &str) -> Result<User> {
        let db = self.db.lock().unwrap();
        let row: Option<(User, String, String, u32)> = db
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS}, password_hash, salt, iterations
                     FROM users WHERE email = ?1"
                ),
                params![email],
                |row| {
                    Ok((
                        row_to_user(row)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get::<_, i64>(11)? as u32,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(UserError::Database(other)),
            })?;

        let Some((user, hash_hex, salt_hex, iterations)) = row else {
            // Unknown email — hash anyway so timing doesn't reveal existence.
            let _ = password::derive(pass);
            return Err(UserError::InvalidCredentials);
        };

        let now = Utc::now();
        if let Some(until) = &user.locked_until {
            if chrono::DateTime::parse_from_rfc3339(until)
                .map(|t| t.with_timezone(&Utc) > now)
                .unwrap_or(false)
            {
                return Err(UserError::AccountLocked {
                    until: until.clone(),
                });
            }
        }

        let hash = hex::decode(&hash_hex)
            .map_err(|e| UserError::Crypto(format!("stored hash corrupt: {e}")))?;
        let salt = hex::decode(&salt_hex)
            .map_err(|e| UserError::Crypto(format!("stored salt corrupt: {e}")))?;

        if password::verify(pass, &salt, iterations, &hash) {
            db.execute(
                "UPDATE users
                 SET failed_attempts = 0, first_failed_at = NULL,
                     locked_until = NULL, updated_at = ?2
                 WHERE id = ?1",
                params![user.id, now.to_rfc3339()],
            )?;
            Ok(user)
        } else {
            let locked = self.record_failure(&db, &user, now)?;
            if let Some(until) = locked {
                warn!(user_id = %user.id, %until, "account locked after repeated failures");
                return Err(UserError::AccountLocked { until });
            }
            Err(UserError::InvalidCredentials)
        }
    }

    /// Load a user by primary key. Returns None instead of an error when
    /// absent so callers decide whether missing is exceptional.
    pub fn get(&self, user_id: &str) -> Result<Option<User>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![user_id],
            row_to_user,
        ) {
            Ok(u) => Ok(Some(u)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(UserError::Database(e)),
        }
    }

    /// Replace the stored credential. Callers must also revoke the user's
    /// sessions — token invalidation on password change is enforced at the
    /// gateway layer where both stores are in scope.
    #[instrument(skip(self, new_pass))]
    pub fn set_password(&self, user_id: &str, new_pass: &str) -> Result<()> {
        let derived = password::derive(new_pass)?;
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE users
             SET password_hash = ?2, salt = ?3, iterations = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                user_id,
                hex::encode(derived.hash),
                hex::encode(derived.salt),
                derived.iterations,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(UserError::NotFound {
                id: user_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_tier(&self, user_id: &str, tier: Tier) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE users SET tier = ?2, updated_at = ?3 WHERE id = ?1",
            params![user_id, tier.to_string(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(UserError::NotFound {
                id: user_id.to_string(),
            });
        }
        Ok(())
    }

    /// Delete a user. Sessions, turns, facts and plugin enablement rows
    /// cascade via foreign keys (the gateway opens connections with
    /// `PRAGMA foreign_keys = ON`).
    #[instrument(skip(self))]
    pub fn delete(&self, user_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
        if changed == 0 {
            return Err(UserError::NotFound {
                id: user_id.to_string(),
            });
        }
        info!(user_id, "user deleted");
        Ok(())
    }

    /// True when at least one admin account exists.
    pub fn admin_exists(&self) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM users WHERE role = 'admin'",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Create the bootstrap admin account. Used once, on first boot.
    pub fn create_admin(&self, email: &str, pass: &str) -> Result<User> {
        let user = self.register(email, pass)?;
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE users SET role = 'admin', tier = 'paid' WHERE id = ?1",
            params![user.id],
        )?;
        Ok(User {
            role: UserRole::Admin,
            tier: Tier::Paid,
            ..user
        })
    }

    /// Advance the failure counter; returns the lock expiry when the
    /// threshold is crossed. A stale failure window restarts the count.
    fn record_failure(
        &self,
        db: &Connection,
        user: &User,
        now: chrono::DateTime<Utc>,
    ) -> Result<Option<String>> {
        let window_start = user
            .first_failed_at
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));

        let in_window = window_start
            .map(|t| now - t < Duration::minutes(FAILURE_WINDOW_MIN))
            .unwrap_or(false);

        let (attempts, first_failed_at) = if in_window {
            (user.failed_attempts + 1, user.first_failed_at.clone())
        } else {
            (1, Some(now.to_rfc3339()))
        };

        let locked_until = if attempts >= MAX_FAILURES {
            Some((now + Duration::minutes(LOCK_MIN)).to_rfc3339())
        } else {
            None
        };

        db.execute(
            "UPDATE users
             SET failed_attempts = ?2, first_failed_at = ?3,
                 locked_until = ?4, updated_at = ?5
             WHERE id = ?1",
            params![
                user.id,
                attempts,
                first_failed_at,
                locked_until,
                now.to_rfc3339(),
            ],
        )?;
        Ok(locked_until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn store() -> UserStore {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        UserStore::new(conn)
    }

    #[test]
    fn register_and_authenticate() {
        let store = store();
        let user = store.register("a@example.com", "hunter22hunter22").unwrap();
        let authed = store
            .authenticate("a@example.com", "hunter22hunter22")
            .unwrap();
        assert_eq!(user.id, authed.id);
        assert_eq!(authed.tier, Tier::Free);
    }

    #[test]
    fn duplicate_email_rejected() {
        let store = store();
        store.register("a@example.com", "pw-one-pw-one").unwrap();
        let err = store.register("a@example.com", "pw-two-pw-two").unwrap_err();
        assert!(matches!(err, UserError::UserExists));
    }

    #[test]
    fn wrong_password_is_invalid_credentials() {
        let store = store();
        store.register("a@example.com", "right-password").unwrap();
        let err = store.authenticate("a@example.com", "wrong").unwrap_err();
        assert!(matches!(err, UserError::InvalidCredentials));
    }

    #[test]
    fn five_failures_lock_the_account() {
        let store = store();
        store.register("a@example.com", "right-password").unwrap();

        for _ in 0..4 {
            let err = store.authenticate("a@example.com", "nope").unwrap_err();
            assert!(matches!(err, UserError::InvalidCredentials));
        }
        // Fifth failure trips the lock.
        let err = store.authenticate("a@example.com", "nope").unwrap_err();
        assert!(matches!(err, UserError::AccountLocked { .. }));

        // Even the correct password is rejected while locked.
        let err = store
            .authenticate("a@example.com", "right-password")
            .unwrap_err();
        assert!(matches!(err, UserError::AccountLocked { .. }));
    }

    #[test]
    fn successful_login_clears_failure_counter() {
        let store = store();
        store.register("a@example.com", "right-password").unwrap();

        for _ in 0..3 {
            let _ = store.authenticate("a@example.com", "nope");
        }
        store
            .authenticate("a@example.com", "right-password")
            .unwrap();

        // Counter reset: four more bad attempts don't lock.
        for _ in 0..4 {
            let err = store.authenticate("a@example.com", "nope").unwrap_err();
            assert!(matches!(err, UserError::InvalidCredentials));
        }
    }

    #[test]
    fn unknown_email_is_invalid_credentials() {
        let store = store();
        let err = store.authenticate("ghost@example.com", "pw").unwrap_err();
        assert!(matches!(err, UserError::InvalidCredentials));
    }

    #[test]
    fn password_change_takes_effect() {
        let store = store();
        let user = store.register("a@example.com", "old-password").unwrap();
        store.set_password(&user.id, "new-password").unwrap();

        assert!(store.authenticate("a@example.com", "old-password").is_err());
        store.authenticate("a@example.com", "new-password").unwrap();
    }

    #[test]
    fn create_admin_sets_role_and_tier() {
        let store = store();
        assert!(!store.admin_exists().unwrap());
        let admin = store.create_admin("root@example.com", "bootstrap-pass-123").unwrap();
        assert!(admin.role.is_admin());
        assert_eq!(admin.tier, Tier::Paid);
        assert!(store.admin_exists().unwrap());
    }
}
