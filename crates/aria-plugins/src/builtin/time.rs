//! Clock plugin — tells the model the current date and time.

use async_trait::async_trait;
use chrono::{Duration, Utc};

use aria_core::types::Tier;

use crate::types::{
    FunctionSchema, ParamKind, ParamSpec, PluginCall, PluginDescriptor, PluginHandler,
    ToolOutcome,
};

pub const PLUGIN_NAME: &str = "time";
pub const FN_CURRENT_TIME: &str = "current_time";

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor {
        name: PLUGIN_NAME.to_string(),
        version: "1.0.0".to_string(),
        description: "Current date and time".to_string(),
        tier_required: Tier::Free,
        default_enabled: true,
        functions: vec![FunctionSchema {
            name: FN_CURRENT_TIME.to_string(),
            description: "Get the current date and time, optionally offset from UTC".to_string(),
            parameters: vec![ParamSpec {
                name: "utc_offset_minutes".to_string(),
                kind: ParamKind::Integer,
                description: "Minutes east of UTC (default 0)".to_string(),
                required: false,
            }],
        }],
    }
}

pub struct TimeHandler;

#[async_trait]
impl PluginHandler for TimeHandler {
    async fn call(&self, call: PluginCall) -> Result<ToolOutcome, String> {
        if call.function != FN_CURRENT_TIME {
            return Err(format!("unknown function: {}", call.function));
        }
        let offset_min = call
            .args
            .get("utc_offset_minutes")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let now = Utc::now() + Duration::minutes(offset_min);
        Ok(ToolOutcome::success(
            now.format("%Y-%m-%d %H:%M:%S").to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn returns_a_timestamp() {
        let outcome = TimeHandler
            .call(PluginCall {
                user_id: "u1".to_string(),
                session_id: "s1".to_string(),
                function: FN_CURRENT_TIME.to_string(),
                args: serde_json::json!({}),
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert!(outcome.ok);
        // YYYY-MM-DD HH:MM:SS
        assert_eq!(outcome.content.len(), 19);
    }
}
