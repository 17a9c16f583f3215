use aria_core::types::TurnRole;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry in a user's conversation log. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// UUIDv7 — ordering within a user's log is total and monotonic.
    pub turn_id: String,
    pub user_id: String,
    pub session_id: String,
    pub role: TurnRole,
    pub content: String,
    /// Function name, for tool-role turns.
    pub tool_name: Option<String>,
    /// Argument/result payload, for tool-role turns.
    pub tool_payload: Option<serde_json::Value>,
    pub token_count: u32,
    pub created_at: String,
}

impl ConversationTurn {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        role: TurnRole,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let token_count = estimate_tokens(&content);
        Self {
            turn_id: Uuid::now_v7().to_string(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            role,
            content,
            tool_name: None,
            tool_payload: None,
            token_count,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, payload: serde_json::Value) -> Self {
        self.tool_name = Some(name.into());
        self.tool_payload = Some(payload);
        self
    }
}

/// A durable long-term fact about a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub user_id: String,
    pub source_turn_id: Option<String>,
    pub text: String,
    /// 0.0–1.0; higher-importance facts win when the budget is tight.
    pub importance: f64,
    pub created_at: String,
}

/// The three retention tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTier {
    Short,
    Mid,
    Long,
}

/// Prompt context assembled by `load_context`: relevant facts plus the
/// short-term turn tail, newest last, within the token budget.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub facts: Vec<Fact>,
    pub turns: Vec<ConversationTurn>,
    pub token_total: u32,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty() && self.turns.is_empty()
    }
}

/// Rough token estimate for budget arithmetic: 1 token ≈ 4 chars.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32 / 4).max(1)
}
