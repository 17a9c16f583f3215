use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rusqlite::{params, Connection};
use tracing::{debug, instrument, warn};

use aria_core::config::MemoryConfig;
use aria_core::types::TurnRole;

use crate::context;
use crate::error::{MemoryError, Result};
use crate::types::{ContextBundle, ConversationTurn, Fact, MemoryTier};

/// Upper bound on rows fetched when reconstructing the short-term tail.
/// The wall-clock and token bounds trim further; this just caps the scan.
const TAIL_SCAN_LIMIT: usize = 200;

/// Per-user tiered conversation memory.
///
/// The SQLite connection is the durable log (long-term facts, full turn
/// history); short- and mid-term views are reconstructed from it on read,
/// so a crash costs nothing but cache warmth.
///
/// Concurrency: every mutation for a user runs under that user's async
/// lock. Cross-user operations never contend on anything but the
/// underlying connection mutex.
pub struct MemoryStore {
    db: Mutex<Connection>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Explicit `reset(Short)` floors: turns older than the floor are
    /// excluded from the short-term tail. In-process only; short-term is
    /// not durable state.
    short_floor: DashMap<String, DateTime<Utc>>,
    /// Explicit `reset(Mid)` floors, same mechanism for the daily window.
    mid_floor: DashMap<String, DateTime<Utc>>,
    cfg: MemoryConfig,
}

impl MemoryStore {
    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn new(conn: Connection, cfg: MemoryConfig) -> Self {
        Self {
            db: Mutex::new(conn),
            locks: DashMap::new(),
            short_floor: DashMap::new(),
            mid_floor: DashMap::new(),
            cfg,
        }
    }

    /// The per-user write lock. Entry API keeps one Arc per user alive.
    fn user_lock(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Append one turn to the durable log.
    #[instrument(skip(self, turn), fields(user_id = %turn.user_id, role = %turn.role))]
    pub async fn append_turn(&self, turn: &ConversationTurn) -> Result<()> {
        let lock = self.user_lock(&turn.user_id);
        let _guard = lock.lock().await;

        let payload = turn
            .tool_payload
            .as_ref()
            .map(|v| v.to_string());
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO turns
                (turn_id, user_id, session_id, role, content, tool_name,
                 tool_payload, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                turn.turn_id,
                turn.user_id,
                turn.session_id,
                turn.role.to_string(),
                turn.content,
                turn.tool_name,
                payload,
                turn.token_count,
                turn.created_at,
            ],
        )
        .map_err(|e| MemoryError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Assemble prompt context for a query within `budget_tokens`.
    ///
    /// Composition: top-k long-term facts matching the query, today's
    /// extracted facts, and the short-term tail of the active session,
    /// newest last. Never fails — a storage error yields an empty bundle
    /// so the orchestrator can still answer without memory.
    ///
    /// Every SQL path predicates on `user_id`; that predicate is the sole
    /// authorization check for memory reads.
    pub async fn load_context(
        &self,
        user_id: &str,
        session_id: &str,
        query: &str,
        budget_tokens: u32,
    ) -> ContextBundle {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let tail = match self.short_term_tail(user_id, session_id) {
            Ok(tail) => tail,
            Err(e) => {
                warn!(user_id, error = %e, "memory read failed, continuing with empty context");
                return ContextBundle::default();
            }
        };
        let long_term = self
            .search_facts_inner(user_id, query, self.cfg.fact_search_k)
            .unwrap_or_else(|e| {
                warn!(user_id, error = %e, "fact search failed");
                Vec::new()
            });
        let day_facts = self.day_facts(user_id).unwrap_or_else(|e| {
            warn!(user_id, error = %e, "day fact load failed");
            Vec::new()
        });

        let bundle = context::compose(tail, long_term, day_facts, budget_tokens);
        debug!(
            user_id,
            turns = bundle.turns.len(),
            facts = bundle.facts.len(),
            tokens = bundle.token_total,
            "context loaded"
        );
        bundle
    }

    /// Store a long-term fact and sync the FTS index.
    #[instrument(skip(self, text))]
    pub async fn add_fact(
        &self,
        user_id: &str,
        source_turn_id: Option<&str>,
        text: &str,
        importance: f64,
    ) -> Result<Fact> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO facts (user_id, source_turn_id, text, importance, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, source_turn_id, text, importance.clamp(0.0, 1.0), now],
        )
        .map_err(|e| MemoryError::WriteFailed(e.to_string()))?;
        let id = db.last_insert_rowid();
        db.execute(
            "INSERT INTO facts_fts(rowid, text) VALUES (?1, ?2)",
            params![id, text],
        )
        .map_err(|e| MemoryError::WriteFailed(e.to_string()))?;

        Ok(Fact {
            id,
            user_id: user_id.to_string(),
            source_turn_id: source_turn_id.map(String::from),
            text: text.to_string(),
            importance: importance.clamp(0.0, 1.0),
            created_at: now,
        })
    }

    /// Search long-term facts by query keywords, best match first.
    pub async fn search_facts(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<Fact>> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        self.search_facts_inner(user_id, query, k)
    }

    /// Discard a tier for one user.
    ///
    /// Short/Mid set an in-process floor (both views are derived from the
    /// durable log, so there is nothing durable to delete). Long deletes
    /// fact rows permanently.
    #[instrument(skip(self))]
    pub async fn reset(&self, user_id: &str, tier: MemoryTier) -> Result<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        match tier {
            MemoryTier::Short => {
                self.short_floor.insert(user_id.to_string(), Utc::now());
            }
            MemoryTier::Mid => {
                self.mid_floor.insert(user_id.to_string(), Utc::now());
            }
            MemoryTier::Long => {
                let db = self.db.lock().unwrap();
                let mut stmt =
                    db.prepare("SELECT id, text FROM facts WHERE user_id = ?1")?;
                let rows: Vec<(i64, String)> = stmt
                    .query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .filter_map(|r| r.ok())
                    .collect();
                drop(stmt);
                for (id, text) in rows {
                    db.execute(
                        "INSERT INTO facts_fts(facts_fts, rowid, text)
                         VALUES('delete', ?1, ?2)",
                        params![id, text],
                    )?;
                }
                db.execute("DELETE FROM facts WHERE user_id = ?1", params![user_id])?;
            }
        }
        Ok(())
    }

    /// Remove a single turn. Used to roll back a query that was cancelled
    /// after its user turn was appended — per-turn writes are atomic, so a
    /// cancelled query leaves no trace.
    pub async fn delete_turn(&self, user_id: &str, turn_id: &str) -> Result<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;
        let db = self.db.lock().unwrap();
        db.execute(
            "DELETE FROM turns WHERE user_id = ?1 AND turn_id = ?2",
            params![user_id, turn_id],
        )?;
        Ok(())
    }

    /// Page through a user's turn history, newest first.
    pub async fn history(
        &self,
        user_id: &str,
        limit: usize,
        before_turn_id: Option<&str>,
    ) -> Result<Vec<ConversationTurn>> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT turn_id, user_id, session_id, role, content, tool_name,
                    tool_payload, token_count, created_at
             FROM turns
             WHERE user_id = ?1
               AND (?2 IS NULL OR id < (SELECT id FROM turns WHERE turn_id = ?2))
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![user_id, before_turn_id, limit as i64],
            row_to_turn,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Park a turn whose durable write failed so it can be retried later.
    /// Best-effort: if even this insert fails, the loss is logged and the
    /// request continues.
    pub fn mark_turn_for_retry(&self, turn: &ConversationTurn) {
        let payload = match serde_json::to_string(turn) {
            Ok(p) => p,
            Err(e) => {
                warn!(user_id = %turn.user_id, error = %e, "retry payload serialization failed");
                return;
            }
        };
        let db = self.db.lock().unwrap();
        if let Err(e) = db.execute(
            "INSERT INTO retry_queue (user_id, payload, created_at) VALUES (?1, ?2, ?3)",
            params![turn.user_id, payload, Utc::now().to_rfc3339()],
        ) {
            warn!(user_id = %turn.user_id, error = %e, "retry enqueue failed, turn dropped");
        }
    }

    // ── private helpers ──────────────────────────────────────────────────────

    /// Short-term tail for the active session: bounded by the wall-clock
    /// window anchored at the newest turn AND the short-term token ceiling,
    /// whichever is tighter. Returned oldest → newest.
    fn short_term_tail(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<Vec<ConversationTurn>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT turn_id, user_id, session_id, role, content, tool_name,
                    tool_payload, token_count, created_at
             FROM turns
             WHERE user_id = ?1 AND session_id = ?2
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let mut newest_first: Vec<ConversationTurn> = stmt
            .query_map(params![user_id, session_id, TAIL_SCAN_LIMIT as i64], row_to_turn)?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let Some(newest) = newest_first.first() else {
            return Ok(Vec::new());
        };
        let anchor = parse_ts(&newest.created_at).unwrap_or_else(Utc::now);
        let window_start = anchor - Duration::minutes(self.cfg.short_term_minutes);
        let floor = self.short_floor.get(user_id).map(|f| *f);

        let mut budget = self.cfg.short_term_tokens;
        let mut kept: Vec<ConversationTurn> = Vec::new();
        for turn in newest_first.drain(..) {
            let ts = parse_ts(&turn.created_at).unwrap_or(window_start);
            if ts < window_start {
                break;
            }
            if floor.map(|f| ts < f).unwrap_or(false) {
                break;
            }
            let cost = turn.token_count.max(1);
            if cost > budget {
                break;
            }
            budget -= cost;
            kept.push(turn);
        }
        kept.reverse();
        Ok(kept)
    }

    /// Facts extracted since the configured day boundary (mid-term view).
    fn day_facts(&self, user_id: &str) -> Result<Vec<Fact>> {
        let day_start = self.day_start();
        let floor = self
            .mid_floor
            .get(user_id)
            .map(|f| (*f).max(day_start))
            .unwrap_or(day_start);

        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, user_id, source_turn_id, text, importance, created_at
             FROM facts
             WHERE user_id = ?1 AND created_at >= ?2
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id, floor.to_rfc3339()], row_to_fact)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// FTS5 keyword match with a LIKE-substring fallback for queries the
    /// FTS tokenizer can't use.
    fn search_facts_inner(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<Fact>> {
        let keywords = context::query_keywords(query);
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let db = self.db.lock().unwrap();
        let match_expr = keywords
            .iter()
            .map(|w| format!("\"{}\"", w.replace('"', "")))
            .collect::<Vec<_>>()
            .join(" OR ");

        let fts: rusqlite::Result<Vec<Fact>> = db
            .prepare(
                "SELECT f.id, f.user_id, f.source_turn_id, f.text, f.importance, f.created_at
                 FROM facts f
                 JOIN facts_fts ft ON f.id = ft.rowid
                 WHERE f.user_id = ?1 AND facts_fts MATCH ?2
                 ORDER BY rank, f.importance DESC
                 LIMIT ?3",
            )
            .and_then(|mut stmt| {
                let rows = stmt.query_map(params![user_id, match_expr, k as i64], row_to_fact)?;
                Ok(rows.filter_map(|r| r.ok()).collect())
            });

        match fts {
            Ok(facts) if !facts.is_empty() => Ok(facts),
            _ => {
                // Substring fallback, one keyword at a time, importance-ranked.
                let mut out: Vec<Fact> = Vec::new();
                let mut stmt = db.prepare(
                    "SELECT id, user_id, source_turn_id, text, importance, created_at
                     FROM facts
                     WHERE user_id = ?1 AND text LIKE ?2
                     ORDER BY importance DESC, created_at DESC
                     LIMIT ?3",
                )?;
                for word in &keywords {
                    let pattern = format!("%{}%", word);
                    let rows = stmt.query_map(params![user_id, pattern, k as i64], row_to_fact)?;
                    for fact in rows.filter_map(|r| r.ok()) {
                        if !out.iter().any(|f| f.id == fact.id) {
                            out.push(fact);
                        }
                    }
                    if out.len() >= k {
                        break;
                    }
                }
                out.truncate(k);
                Ok(out)
            }
        }
    }

    /// Start of the current "day" honoring the configured UTC offset.
    fn day_start(&self) -> DateTime<Utc> {
        let offset = Duration::minutes(self.cfg.day_boundary_offset_min as i64);
        let local = Utc::now() + offset;
        let midnight = local
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc();
        midnight - offset
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationTurn> {
    use std::str::FromStr;
    let role_str: String = row.get(3)?;
    let payload: Option<String> = row.get(6)?;
    Ok(ConversationTurn {
        turn_id: row.get(0)?,
        user_id: row.get(1)?,
        session_id: row.get(2)?,
        role: TurnRole::from_str(&role_str).unwrap_or(TurnRole::User),
        content: row.get(4)?,
        tool_name: row.get(5)?,
        tool_payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        token_count: row.get::<_, i64>(7)? as u32,
        created_at: row.get(8)?,
    })
}

fn row_to_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fact> {
    Ok(Fact {
        id: row.get(0)?,
        user_id: row.get(1)?,
        source_turn_id: row.get(2)?,
        text: row.get(3)?,
        importance: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        MemoryStore::new(conn, MemoryConfig::default())
    }

    fn turn(user: &str, session: &str, role: TurnRole, content: &str) -> ConversationTurn {
        ConversationTurn::new(user, session, role, content)
    }

    #[tokio::test]
    async fn append_and_load_round_trip() {
        let store = store();
        store
            .append_turn(&turn("u1", "s1", TurnRole::User, "hello"))
            .await
            .unwrap();
        store
            .append_turn(&turn("u1", "s1", TurnRole::Assistant, "hi there"))
            .await
            .unwrap();

        let ctx = store.load_context("u1", "s1", "hello", 4096).await;
        assert_eq!(ctx.turns.len(), 2);
        assert_eq!(ctx.turns[0].content, "hello");
        assert_eq!(ctx.turns[1].content, "hi there");
    }

    #[tokio::test]
    async fn users_never_see_each_other() {
        let store = store();
        store
            .append_turn(&turn("u1", "s1", TurnRole::User, "my secret is xyzzy"))
            .await
            .unwrap();
        store
            .add_fact("u1", None, "u1 lives in Warsaw", 0.9)
            .await
            .unwrap();

        let ctx = store.load_context("u2", "s2", "secret Warsaw xyzzy", 4096).await;
        assert!(ctx.is_empty(), "u2 must not see u1 data: {ctx:?}");

        let facts = store.search_facts("u2", "Warsaw", 5).await.unwrap();
        assert!(facts.is_empty());
    }

    #[tokio::test]
    async fn turns_outside_wall_clock_window_drop_from_tail() {
        let store = store();
        let mut old = turn("u1", "s1", TurnRole::User, "ancient history");
        old.created_at = (Utc::now() - Duration::minutes(90)).to_rfc3339();
        store.append_turn(&old).await.unwrap();
        store
            .append_turn(&turn("u1", "s1", TurnRole::User, "recent message"))
            .await
            .unwrap();

        let ctx = store.load_context("u1", "s1", "", 4096).await;
        assert_eq!(ctx.turns.len(), 1);
        assert_eq!(ctx.turns[0].content, "recent message");
    }

    #[tokio::test]
    async fn token_ceiling_bounds_the_tail() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        let cfg = MemoryConfig {
            short_term_tokens: 50,
            ..MemoryConfig::default()
        };
        let store = MemoryStore::new(conn, cfg);

        for i in 0..5 {
            let mut t = turn("u1", "s1", TurnRole::User, &format!("message {i}"));
            t.token_count = 20;
            store.append_turn(&t).await.unwrap();
        }

        let ctx = store.load_context("u1", "s1", "", 4096).await;
        // 50-token ceiling at 20 tokens each keeps only the 2 newest.
        assert_eq!(ctx.turns.len(), 2);
        assert_eq!(ctx.turns[1].content, "message 4");
    }

    #[tokio::test]
    async fn fact_search_finds_substrings() {
        let store = store();
        store
            .add_fact("u1", None, "User programuje w Pythonie", 0.8)
            .await
            .unwrap();
        store
            .add_fact("u1", None, "User mieszka w Warszawie", 0.8)
            .await
            .unwrap();

        let hits = store.search_facts("u1", "Czy znasz Warszawie?", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("Warszawie"));
    }

    #[tokio::test]
    async fn reset_long_deletes_facts() {
        let store = store();
        store.add_fact("u1", None, "temporary fact", 0.5).await.unwrap();
        store.reset("u1", MemoryTier::Long).await.unwrap();
        let hits = store.search_facts("u1", "temporary fact", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn reset_short_floors_the_tail() {
        let store = store();
        store
            .append_turn(&turn("u1", "s1", TurnRole::User, "before reset"))
            .await
            .unwrap();
        store.reset("u1", MemoryTier::Short).await.unwrap();

        let mut after = turn("u1", "s1", TurnRole::User, "after reset");
        after.created_at = (Utc::now() + Duration::seconds(1)).to_rfc3339();
        store.append_turn(&after).await.unwrap();

        let ctx = store.load_context("u1", "s1", "", 4096).await;
        assert_eq!(ctx.turns.len(), 1);
        assert_eq!(ctx.turns[0].content, "after reset");
    }

    #[tokio::test]
    async fn history_pages_newest_first() {
        let store = store();
        for i in 0..5 {
            store
                .append_turn(&turn("u1", "s1", TurnRole::User, &format!("m{i}")))
                .await
                .unwrap();
        }
        let page = store.history("u1", 2, None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "m4");

        let older = store.history("u1", 2, Some(&page[1].turn_id)).await.unwrap();
        assert_eq!(older[0].content, "m2");
    }

    #[tokio::test]
    async fn day_facts_enter_context() {
        let store = store();
        store
            .add_fact("u1", None, "learned today: user likes tea", 0.6)
            .await
            .unwrap();
        let ctx = store.load_context("u1", "s1", "unrelated query words", 4096).await;
        assert_eq!(ctx.facts.len(), 1);
    }
}
