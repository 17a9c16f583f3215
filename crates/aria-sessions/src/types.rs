use serde::{Deserialize, Serialize};

/// A persisted session record. The bearer token itself is never stored —
/// only its SHA-256 digest — so this struct is safe to list back to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Stable row id (UUIDv7), used for listing and revocation by id.
    pub id: String,
    pub user_id: String,
    pub created_at: String,
    pub last_seen_at: String,
}
