use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → Server frames.
///
/// Wire: `{ "type": "ai_query", "correlation_id": "c1", "query": "..." }`
///
/// The `type` discriminator selects the variant; unknown fields are ignored
/// so newer clients can send extra hints without breaking older servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Authenticate the connection when no bearer header was sent on upgrade.
    Auth { token: String },
    AiQuery {
        correlation_id: String,
        query: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
    },
    PluginToggle {
        plugin: String,
        action: ToggleAction,
    },
    PluginList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToggleAction {
    Enable,
    Disable,
}

/// Server → Client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AiResponse {
        correlation_id: String,
        text: String,
        metadata: QueryMetadata,
    },
    /// Optional per-tool progress, emitted before the final `ai_response`.
    FunctionResult {
        correlation_id: String,
        function: String,
        result: Value,
    },
    PluginList {
        plugins: serde_json::Map<String, Value>,
    },
    PluginToggled {
        plugin: String,
        status: ToggleStatus,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_seconds: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToggleStatus {
    Enabled,
    Disabled,
}

/// Metadata attached to every `ai_response`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMetadata {
    pub model: String,
    pub used_tools: Vec<UsedTool>,
    pub latency_ms: u64,
    pub from_fallback: bool,
}

/// One tool invocation recorded during a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsedTool {
    pub name: String,
    pub ok: bool,
}

impl ServerFrame {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_seconds: u64) -> Self {
        Self::Error {
            code: "RATE_LIMITED".to_string(),
            message: message.into(),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }

    /// Serialize for the wire. Frames are built from our own types, so
    /// serialization cannot fail in practice; an empty string is returned
    /// (and dropped by the sender) if it ever does.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
