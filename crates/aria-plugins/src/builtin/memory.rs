//! Memory plugin — lets the model read and write the user's long-term
//! facts. The only builtin that touches system state; it goes through the
//! same per-user serialization as every other memory path.

use std::sync::Arc;

use async_trait::async_trait;

use aria_core::types::Tier;
use aria_memory::MemoryStore;

use crate::types::{
    FunctionSchema, ParamKind, ParamSpec, PluginCall, PluginDescriptor, PluginHandler,
    ToolOutcome,
};

pub const PLUGIN_NAME: &str = "memory";
pub const FN_REMEMBER: &str = "remember_fact";
pub const FN_SEARCH: &str = "search_facts";

const DEFAULT_IMPORTANCE: f64 = 0.6;
const DEFAULT_SEARCH_K: usize = 5;

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor {
        name: PLUGIN_NAME.to_string(),
        version: "1.0.0".to_string(),
        description: "Store and recall long-term facts about the user".to_string(),
        tier_required: Tier::Free,
        default_enabled: true,
        functions: vec![
            FunctionSchema {
                name: FN_REMEMBER.to_string(),
                description: "Save a short fact worth remembering about the user".to_string(),
                parameters: vec![
                    ParamSpec {
                        name: "text".to_string(),
                        kind: ParamKind::String,
                        description: "The fact, one sentence".to_string(),
                        required: true,
                    },
                    ParamSpec {
                        name: "importance".to_string(),
                        kind: ParamKind::Number,
                        description: "0.0–1.0, how important this is to keep".to_string(),
                        required: false,
                    },
                ],
            },
            FunctionSchema {
                name: FN_SEARCH.to_string(),
                description: "Search previously stored facts about the user".to_string(),
                parameters: vec![
                    ParamSpec {
                        name: "query".to_string(),
                        kind: ParamKind::String,
                        description: "Keywords to search for".to_string(),
                        required: true,
                    },
                    ParamSpec {
                        name: "k".to_string(),
                        kind: ParamKind::Integer,
                        description: "Max results (default 5)".to_string(),
                        required: false,
                    },
                ],
            },
        ],
    }
}

pub struct MemoryHandler {
    store: Arc<MemoryStore>,
}

impl MemoryHandler {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PluginHandler for MemoryHandler {
    async fn call(&self, call: PluginCall) -> Result<ToolOutcome, String> {
        match call.function.as_str() {
            FN_REMEMBER => {
                let text = call
                    .args
                    .get("text")
                    .and_then(|v| v.as_str())
                    .ok_or("text missing")?;
                let importance = call
                    .args
                    .get("importance")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(DEFAULT_IMPORTANCE);
                let fact = self
                    .store
                    .add_fact(&call.user_id, None, text, importance)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(ToolOutcome::success(format!("remembered: {}", fact.text)))
            }
            FN_SEARCH => {
                let query = call
                    .args
                    .get("query")
                    .and_then(|v| v.as_str())
                    .ok_or("query missing")?;
                let k = call
                    .args
                    .get("k")
                    .and_then(|v| v.as_u64())
                    .map(|k| k as usize)
                    .unwrap_or(DEFAULT_SEARCH_K);
                let facts = self
                    .store
                    .search_facts(&call.user_id, query, k)
                    .await
                    .map_err(|e| e.to_string())?;
                if facts.is_empty() {
                    return Ok(ToolOutcome::success("no matching facts"));
                }
                let listing = facts
                    .iter()
                    .map(|f| format!("- {}", f.text))
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(ToolOutcome::success(listing))
            }
            other => Err(format!("unknown function: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aria_core::config::MemoryConfig;
    use rusqlite::Connection;
    use tokio_util::sync::CancellationToken;

    fn handler() -> MemoryHandler {
        let conn = Connection::open_in_memory().unwrap();
        aria_memory::db::init_db(&conn).unwrap();
        MemoryHandler::new(Arc::new(MemoryStore::new(conn, MemoryConfig::default())))
    }

    fn call(user: &str, function: &str, args: serde_json::Value) -> PluginCall {
        PluginCall {
            user_id: user.to_string(),
            session_id: "s1".to_string(),
            function: function.to_string(),
            args,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn remember_then_search() {
        let handler = handler();
        handler
            .call(call(
                "u1",
                FN_REMEMBER,
                serde_json::json!({ "text": "User lives in Warsaw" }),
            ))
            .await
            .unwrap();

        let outcome = handler
            .call(call(
                "u1",
                FN_SEARCH,
                serde_json::json!({ "query": "Warsaw" }),
            ))
            .await
            .unwrap();
        assert!(outcome.content.contains("Warsaw"));
    }

    #[tokio::test]
    async fn search_respects_user_boundary() {
        let handler = handler();
        handler
            .call(call(
                "u1",
                FN_REMEMBER,
                serde_json::json!({ "text": "User lives in Warsaw" }),
            ))
            .await
            .unwrap();

        let outcome = handler
            .call(call(
                "u2",
                FN_SEARCH,
                serde_json::json!({ "query": "Warsaw" }),
            ))
            .await
            .unwrap();
        assert_eq!(outcome.content, "no matching facts");
    }
}
