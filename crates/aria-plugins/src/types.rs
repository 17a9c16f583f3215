//! Plugin descriptors, function schemas and the handler trait.
//!
//! A plugin bundles one handler with an ordered list of function schemas.
//! The registry validates schemas at registration time; on the call path
//! everything is a plain trait-object dispatch — no reflection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use aria_core::types::Tier;

/// Static description of a plugin, registered at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Minimum tier required to see or invoke this plugin's functions.
    #[serde(default)]
    pub tier_required: Tier,
    /// Whether the plugin is on for users who never toggled it.
    #[serde(default = "bool_true")]
    pub default_enabled: bool,
    pub functions: Vec<FunctionSchema>,
}

fn bool_true() -> bool {
    true
}

/// One callable function a plugin exposes to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSchema {
    /// Globally unique across all registered plugins.
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    pub fn json_type(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }
}

impl FunctionSchema {
    /// Render as the JSON-schema object providers expect.
    pub fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required: Vec<Value> = Vec::new();
        for param in &self.parameters {
            properties.insert(
                param.name.clone(),
                serde_json::json!({
                    "type": param.kind.json_type(),
                    "description": param.description,
                }),
            );
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Flattened tool definition offered to the LLM on a user's turn.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One invocation, fully owned so it can cross task boundaries.
#[derive(Debug, Clone)]
pub struct PluginCall {
    pub user_id: String,
    pub session_id: String,
    pub function: String,
    pub args: Value,
    /// Cooperative cancellation — long-running handlers should poll this.
    pub cancel: CancellationToken,
}

/// Handler return payload, reported back to the model verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub ok: bool,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Value>,
}

impl ToolOutcome {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            ok: true,
            content: content.into(),
            artifacts: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            content: message.into(),
            artifacts: None,
        }
    }

    pub fn with_artifacts(mut self, artifacts: Value) -> Self {
        self.artifacts = Some(artifacts);
        self
    }
}

/// Trait all plugin handlers implement. One handler serves every function
/// its descriptor declares; `call.function` selects the operation.
///
/// Handlers must be reentrant. They receive validated arguments and must
/// not reach back into the LLM gateway — tools are leaves. Returning `Err`
/// converts to `ToolFailed` and is reflected to the model, never fatal.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    async fn call(&self, call: PluginCall) -> std::result::Result<ToolOutcome, String>;
}
