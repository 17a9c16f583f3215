//! Per-user sliding-window admission control.
//!
//! Counters use the two-window weighted approximation: the previous
//! window's count is scaled by how much of it still overlaps the sliding
//! window and added to the current count. The admit path is atomic-only;
//! a short per-bucket mutex guards window rollover.
//!
//! Isolation invariant: buckets are keyed `(user_id, kind)` and share no
//! mutable state, so one user's exhaustion never affects another's
//! scheduling.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::{debug, warn};

use aria_core::config::RateLimitConfig;
use aria_core::types::Tier;

/// What a bucket counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Requests,
    Tokens,
}

impl LimitKind {
    fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Requests => "requests",
            LimitKind::Tokens => "tokens",
        }
    }
}

/// Returned when an admission check fails.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimited {
    pub limit: u64,
    pub window_s: u64,
    pub retry_after_s: u64,
}

struct Bucket {
    /// Aligned window index (`now_ms / window_ms`).
    window_index: AtomicI64,
    current: AtomicU64,
    previous: AtomicU64,
    /// Guards rollover only; the hot admit path never takes it.
    roll: std::sync::Mutex<()>,
}

impl Bucket {
    fn new(window_index: i64) -> Self {
        Self {
            window_index: AtomicI64::new(window_index),
            current: AtomicU64::new(0),
            previous: AtomicU64::new(0),
            roll: std::sync::Mutex::new(()),
        }
    }
}

/// Sliding-window rate limiter, strictly partitioned per user.
pub struct RateLimiter {
    cfg: RateLimitConfig,
    buckets: DashMap<(String, LimitKind), Arc<Bucket>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            buckets: DashMap::new(),
        }
    }

    /// Admit one query for a user, charging the request counter.
    /// The token counter is checked (not charged) so a user who burned
    /// their token budget stops being admitted too.
    pub fn admit_request(&self, user_id: &str, tier: Tier) -> Result<(), RateLimited> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let token_limit = self.tokens_limit(tier);
        if self.effective(user_id, LimitKind::Tokens, now_ms) >= token_limit as f64 {
            return Err(self.rejection(token_limit, now_ms));
        }

        let limit = self.requests_limit(tier);
        self.charge(user_id, LimitKind::Requests, 1, limit, now_ms)
            .map_err(|r| {
                debug!(user_id, limit, "request rejected by rate limiter");
                r
            })
    }

    /// Record token usage after a completed query. Never rejects — the
    /// ceiling is enforced on the next admission.
    pub fn record_tokens(&self, user_id: &str, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let now_ms = chrono::Utc::now().timestamp_millis();
        let bucket = self.bucket(user_id, LimitKind::Tokens, now_ms);
        self.rollover(&bucket, now_ms);
        bucket.current.fetch_add(tokens, Ordering::Relaxed);
    }

    fn requests_limit(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Free => self.cfg.free_requests_per_month,
            Tier::Paid => self.cfg.paid_requests_per_month,
        }
    }

    fn tokens_limit(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Free => self.cfg.free_tokens_per_month,
            Tier::Paid => self.cfg.paid_tokens_per_month,
        }
    }

    /// Charge `amount` against a bucket if the sliding-window count allows.
    fn charge(
        &self,
        user_id: &str,
        kind: LimitKind,
        amount: u64,
        limit: u64,
        now_ms: i64,
    ) -> Result<(), RateLimited> {
        let bucket = self.bucket(user_id, kind, now_ms);
        self.rollover(&bucket, now_ms);

        if self.weighted(&bucket, now_ms) + amount as f64 > limit as f64 {
            return Err(self.rejection(limit, now_ms));
        }
        bucket.current.fetch_add(amount, Ordering::Relaxed);
        Ok(())
    }

    fn effective(&self, user_id: &str, kind: LimitKind, now_ms: i64) -> f64 {
        let bucket = self.bucket(user_id, kind, now_ms);
        self.rollover(&bucket, now_ms);
        self.weighted(&bucket, now_ms)
    }

    fn bucket(&self, user_id: &str, kind: LimitKind, now_ms: i64) -> Arc<Bucket> {
        let index = now_ms / self.window_ms();
        self.buckets
            .entry((user_id.to_string(), kind))
            .or_insert_with(|| Arc::new(Bucket::new(index)))
            .clone()
    }

    /// Lazily shift windows when time has moved past the stored index.
    fn rollover(&self, bucket: &Bucket, now_ms: i64) {
        let index = now_ms / self.window_ms();
        let stored = bucket.window_index.load(Ordering::Acquire);
        if index == stored {
            return;
        }
        let _guard = bucket.roll.lock().unwrap();
        let stored = bucket.window_index.load(Ordering::Acquire);
        if index == stored {
            return;
        }
        if index == stored + 1 {
            let cur = bucket.current.swap(0, Ordering::AcqRel);
            bucket.previous.store(cur, Ordering::Release);
        } else {
            bucket.current.store(0, Ordering::Release);
            bucket.previous.store(0, Ordering::Release);
        }
        bucket.window_index.store(index, Ordering::Release);
    }

    /// previous × overlap + current.
    fn weighted(&self, bucket: &Bucket, now_ms: i64) -> f64 {
        let window_ms = self.window_ms();
        let elapsed = (now_ms % window_ms) as f64 / window_ms as f64;
        let prev = bucket.previous.load(Ordering::Relaxed) as f64;
        let cur = bucket.current.load(Ordering::Relaxed) as f64;
        prev * (1.0 - elapsed) + cur
    }

    fn rejection(&self, limit: u64, now_ms: i64) -> RateLimited {
        let window_ms = self.window_ms();
        let until_boundary_s = ((window_ms - (now_ms % window_ms)) / 1000).max(1) as u64;
        RateLimited {
            limit,
            window_s: self.cfg.window_s,
            // The weighted count decays continuously, so the boundary is a
            // conservative upper bound; clients may retry sooner.
            retry_after_s: until_boundary_s.min(self.cfg.window_s),
        }
    }

    fn window_ms(&self) -> i64 {
        (self.cfg.window_s as i64).max(1) * 1000
    }

    // ── persistence (best-effort across restarts) ────────────────────────────

    pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rate_counters (
                user_id      TEXT NOT NULL,
                kind         TEXT NOT NULL,
                window_index INTEGER NOT NULL,
                current      INTEGER NOT NULL,
                previous     INTEGER NOT NULL,
                PRIMARY KEY (user_id, kind)
            );",
        )
    }

    /// Restore counters written by a previous run. Stale windows are
    /// discarded by the normal rollover logic on first use.
    pub fn load(&self, conn: &Connection) {
        let result: rusqlite::Result<Vec<(String, String, i64, u64, u64)>> = conn
            .prepare("SELECT user_id, kind, window_index, current, previous FROM rate_counters")
            .and_then(|mut stmt| {
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get::<_, i64>(3)? as u64,
                        row.get::<_, i64>(4)? as u64,
                    ))
                })?;
                Ok(rows.filter_map(|r| r.ok()).collect())
            });

        match result {
            Ok(rows) => {
                for (user_id, kind, index, current, previous) in rows {
                    let kind = match kind.as_str() {
                        "requests" => LimitKind::Requests,
                        "tokens" => LimitKind::Tokens,
                        _ => continue,
                    };
                    let bucket = Arc::new(Bucket::new(index));
                    bucket.current.store(current, Ordering::Relaxed);
                    bucket.previous.store(previous, Ordering::Relaxed);
                    self.buckets.insert((user_id, kind), bucket);
                }
            }
            Err(e) => warn!(error = %e, "rate counter restore failed, starting fresh"),
        }
    }

    /// Snapshot counters for the next boot. Failures are logged only.
    pub fn save(&self, conn: &Connection) {
        for entry in self.buckets.iter() {
            let (user_id, kind) = entry.key();
            let bucket = entry.value();
            let result = conn.execute(
                "INSERT INTO rate_counters (user_id, kind, window_index, current, previous)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id, kind) DO UPDATE SET
                    window_index = excluded.window_index,
                    current = excluded.current,
                    previous = excluded.previous",
                params![
                    user_id,
                    kind.as_str(),
                    bucket.window_index.load(Ordering::Relaxed),
                    bucket.current.load(Ordering::Relaxed) as i64,
                    bucket.previous.load(Ordering::Relaxed) as i64,
                ],
            );
            if let Err(e) = result {
                warn!(user_id, error = %e, "rate counter snapshot failed");
            }
        }
    }
}
