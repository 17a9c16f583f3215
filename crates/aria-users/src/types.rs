use aria_core::types::{Tier, UserRole};
use serde::{Deserialize, Serialize};

/// A registered user. Credential material (salt/hash) never leaves the
/// store; this struct is safe to hand to transport and orchestration code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: UserRole,
    pub tier: Tier,
    pub failed_attempts: u32,
    pub first_failed_at: Option<String>,
    pub locked_until: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
