//! Function-calling dispatcher — the core agentic loop.
//!
//! Flow: prompt → LLM → if tool calls → execute via the registry → inject
//! results → LLM → repeat. Stops when the model answers with text, the
//! depth cap is hit, or infrastructure fails.
//!
//! Tool-level failures are never fatal: the error payload goes back to the
//! model as the tool result so it can recover or apologize. Within one run
//! the transcript of (tool-calls, tool-results, assistant text) is totally
//! ordered; callers persist it verbatim.

use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aria_core::types::Tier;
use aria_plugins::{PluginError, PluginRegistry};

use crate::gateway::{GatewayError, LlmGateway};
use crate::provider::{ChatRequest, ToolCall};

/// Reply text when the loop cap is hit with no assistant text to fall
/// back on.
const LOOP_EXCEEDED_APOLOGY: &str =
    "I wasn't able to finish working through that request. Could you try rephrasing it?";

/// One entry in the ordered dispatch transcript.
#[derive(Debug, Clone)]
pub enum TranscriptEntry {
    AssistantToolCalls { calls: Vec<ToolCall> },
    ToolResult {
        call_id: String,
        function: String,
        payload: Value,
        ok: bool,
    },
    AssistantText { text: String },
}

/// A tool invocation recorded for reply metadata.
#[derive(Debug, Clone)]
pub struct UsedTool {
    pub name: String,
    pub ok: bool,
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub text: String,
    pub transcript: Vec<TranscriptEntry>,
    pub used_tools: Vec<UsedTool>,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub loop_exceeded: bool,
}

pub struct DispatchParams<'a> {
    pub user_id: &'a str,
    pub session_id: &'a str,
    pub tier: Tier,
    pub max_depth: usize,
    pub fanout: usize,
}

/// Run the dispatcher loop to completion.
pub async fn run_dispatch(
    gateway: &LlmGateway,
    plugins: &PluginRegistry,
    base_request: ChatRequest,
    params: DispatchParams<'_>,
    cancel: &CancellationToken,
) -> Result<DispatchOutcome, GatewayError> {
    let DispatchParams {
        user_id,
        session_id,
        tier,
        max_depth,
        fanout,
    } = params;

    let mut raw_messages: Vec<Value> = if let Some(ref raw) = base_request.raw_messages {
        raw.clone()
    } else {
        base_request
            .messages
            .iter()
            .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
            .collect()
    };

    let mut transcript: Vec<TranscriptEntry> = Vec::new();
    let mut used_tools: Vec<UsedTool> = Vec::new();
    let mut last_text: Option<String> = None;
    let mut prompt_tokens: u64 = 0;
    let mut completion_tokens: u64 = 0;
    let mut model = gateway.model().to_string();

    for depth in 0..max_depth {
        let mut req = base_request.clone();
        req.raw_messages = Some(raw_messages.clone());

        debug!(depth, "dispatcher iteration");
        let reply = gateway.chat(req, tier, cancel).await?;
        prompt_tokens += reply.usage.prompt_tokens as u64;
        completion_tokens += reply.usage.completion_tokens as u64;
        model = reply.usage.model.clone();

        if reply.tool_calls.is_empty() {
            info!(depth, "dispatch complete — final text");
            transcript.push(TranscriptEntry::AssistantText {
                text: reply.text.clone(),
            });
            return Ok(DispatchOutcome {
                text: reply.text,
                transcript,
                used_tools,
                model,
                prompt_tokens,
                completion_tokens,
                loop_exceeded: false,
            });
        }

        if !reply.text.is_empty() {
            last_text = Some(reply.text.clone());
        }

        // Assistant turn: any text plus the tool_use blocks, in order.
        let mut assistant_content: Vec<Value> = Vec::new();
        if !reply.text.is_empty() {
            assistant_content.push(serde_json::json!({
                "type": "text",
                "text": reply.text,
            }));
        }
        for call in &reply.tool_calls {
            assistant_content.push(serde_json::json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.input,
            }));
        }
        raw_messages.push(serde_json::json!({
            "role": "assistant",
            "content": assistant_content,
        }));
        transcript.push(TranscriptEntry::AssistantToolCalls {
            calls: reply.tool_calls.clone(),
        });

        // Execute this step's calls concurrently (capped fan-out).
        // `buffered` keeps completion order equal to the model's declared
        // order, so reassembly is free.
        let executed: Vec<(ToolCall, Result<aria_plugins::ToolOutcome, PluginError>)> =
            stream::iter(reply.tool_calls.into_iter().map(|call| {
                let cancel = cancel.clone();
                async move {
                    let result = plugins
                        .invoke(
                            user_id,
                            session_id,
                            tier,
                            &call.name,
                            call.input.clone(),
                            cancel,
                        )
                        .await;
                    (call, result)
                }
            }))
            .buffered(fanout.max(1))
            .collect()
            .await;

        if cancel.is_cancelled() {
            // Partial results are discarded along with the whole run.
            return Err(GatewayError::Cancelled);
        }

        let mut tool_result_content: Vec<Value> = Vec::new();
        for (call, result) in executed {
            let (payload, ok) = match result {
                Ok(outcome) => {
                    let ok = outcome.ok;
                    (serde_json::to_value(&outcome).unwrap_or(Value::Null), ok)
                }
                Err(PluginError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(e) => {
                    warn!(function = %call.name, error = %e, "tool error reflected to model");
                    (
                        serde_json::json!({
                            "error": format!("{}: {}", e.kind(), e),
                        }),
                        false,
                    )
                }
            };

            let content = payload
                .get("content")
                .and_then(|c| c.as_str())
                .map(String::from)
                .unwrap_or_else(|| payload.to_string());

            tool_result_content.push(serde_json::json!({
                "type": "tool_result",
                "tool_use_id": call.id,
                "content": content,
                "is_error": !ok,
            }));
            used_tools.push(UsedTool {
                name: call.name.clone(),
                ok,
            });
            transcript.push(TranscriptEntry::ToolResult {
                call_id: call.id,
                function: call.name,
                payload,
                ok,
            });
        }

        raw_messages.push(serde_json::json!({
            "role": "user",
            "content": tool_result_content,
        }));
    }

    warn!(
        max_depth = max_depth,
        user_id = user_id,
        "ToolLoopExceeded — returning best-effort reply"
    );
    let text = last_text.unwrap_or_else(|| LOOP_EXCEEDED_APOLOGY.to_string());
    transcript.push(TranscriptEntry::AssistantText { text: text.clone() });
    Ok(DispatchOutcome {
        text,
        transcript,
        used_tools,
        model,
        prompt_tokens,
        completion_tokens,
        loop_exceeded: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatProvider, ChatReply, ChatRequest, Message, ProviderError, Role};
    use aria_core::config::{AiConfig, PluginsConfig};
    use aria_plugins::{
        FunctionSchema, ParamKind, ParamSpec, PluginCall, PluginDescriptor, PluginHandler,
        ToolOutcome,
    };
    use async_trait::async_trait;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Provider that replays a script and records every request it sees.
    struct ScriptedProvider {
        calls: AtomicU32,
        script: Vec<ChatReply>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<ChatReply>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                script,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, req: &ChatRequest) -> Result<ChatReply, ProviderError> {
            self.seen.lock().unwrap().push(req.clone());
            let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let reply = self
                .script
                .get(idx)
                .cloned()
                .unwrap_or_else(|| text_reply("done"));
            Ok(reply)
        }
    }

    fn text_reply(text: &str) -> ChatReply {
        ChatReply {
            content: text.to_string(),
            model: "test-model".to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            stop_reason: "stop".to_string(),
            tool_calls: vec![],
        }
    }

    fn tool_reply(calls: Vec<(&str, &str, Value)>) -> ChatReply {
        ChatReply {
            content: String::new(),
            model: "test-model".to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            stop_reason: "tool_use".to_string(),
            tool_calls: calls
                .into_iter()
                .map(|(id, name, input)| ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    input,
                })
                .collect(),
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl PluginHandler for EchoHandler {
        async fn call(&self, call: PluginCall) -> Result<ToolOutcome, String> {
            Ok(ToolOutcome::success(format!(
                "echo:{}",
                call.args["location"].as_str().unwrap_or("?")
            )))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl PluginHandler for AlwaysFails {
        async fn call(&self, _call: PluginCall) -> Result<ToolOutcome, String> {
            Err("deliberate failure".to_string())
        }
    }

    fn registry_with(name: &str, function: &str, handler: Arc<dyn PluginHandler>) -> PluginRegistry {
        let conn = Connection::open_in_memory().unwrap();
        aria_plugins::enablement::EnablementStore::init_db(&conn).unwrap();
        let reg = PluginRegistry::new(PluginsConfig::default(), conn);
        reg.register(
            PluginDescriptor {
                name: name.to_string(),
                version: "1.0.0".to_string(),
                description: String::new(),
                tier_required: aria_core::types::Tier::Free,
                default_enabled: true,
                functions: vec![FunctionSchema {
                    name: function.to_string(),
                    description: String::new(),
                    parameters: vec![ParamSpec {
                        name: "location".to_string(),
                        kind: ParamKind::String,
                        description: String::new(),
                        required: true,
                    }],
                }],
            },
            handler,
        )
        .unwrap();
        reg
    }

    fn gateway(provider: ScriptedProvider) -> (LlmGateway, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        struct Shared(Arc<ScriptedProvider>);
        #[async_trait]
        impl ChatProvider for Shared {
            fn name(&self) -> &str {
                self.0.name()
            }
            async fn send(&self, req: &ChatRequest) -> Result<ChatReply, ProviderError> {
                self.0.send(req).await
            }
        }
        (
            LlmGateway::new(Box::new(Shared(provider.clone())), AiConfig::default()),
            provider,
        )
    }

    fn base_request() -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            system: "assistant".to_string(),
            messages: vec![Message {
                role: Role::User,
                content: "what's the weather in Warsaw?".to_string(),
            }],
            max_tokens: 4096,
            tools: vec![],
            raw_messages: None,
        }
    }

    fn params() -> DispatchParams<'static> {
        DispatchParams {
            user_id: "u1",
            session_id: "s1",
            tier: Tier::Paid,
            max_depth: 5,
            fanout: 4,
        }
    }

    #[tokio::test]
    async fn plain_text_reply_passes_through() {
        let (gw, _) = gateway(ScriptedProvider::new(vec![text_reply("sunny today")]));
        let reg = registry_with("weather", "get_weather", Arc::new(EchoHandler));

        let outcome = run_dispatch(&gw, &reg, base_request(), params(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.text, "sunny today");
        assert!(outcome.used_tools.is_empty());
        assert!(!outcome.loop_exceeded);
    }

    #[tokio::test]
    async fn tool_call_result_feeds_next_llm_call() {
        let (gw, provider) = gateway(ScriptedProvider::new(vec![
            tool_reply(vec![(
                "t1",
                "get_weather",
                serde_json::json!({"location": "Warsaw"}),
            )]),
            text_reply("It is echo weather."),
        ]));
        let reg = registry_with("weather", "get_weather", Arc::new(EchoHandler));

        let outcome = run_dispatch(&gw, &reg, base_request(), params(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.text, "It is echo weather.");
        assert_eq!(outcome.used_tools.len(), 1);
        assert!(outcome.used_tools[0].ok);

        // The second request must carry the tool result back to the model.
        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let second = seen[1].raw_messages.as_ref().unwrap();
        let tool_result = second
            .iter()
            .flat_map(|m| m["content"].as_array().into_iter().flatten())
            .find(|b| b["type"] == "tool_result")
            .expect("tool_result block present");
        assert_eq!(tool_result["content"], "echo:Warsaw");
        assert_eq!(tool_result["is_error"], false);
    }

    #[tokio::test]
    async fn parallel_calls_reassemble_in_declared_order() {
        let (gw, provider) = gateway(ScriptedProvider::new(vec![
            tool_reply(vec![
                ("t1", "get_weather", serde_json::json!({"location": "Warsaw"})),
                ("t2", "get_weather", serde_json::json!({"location": "Krakow"})),
                ("t3", "get_weather", serde_json::json!({"location": "Gdansk"})),
            ]),
            text_reply("done"),
        ]));
        let reg = registry_with("weather", "get_weather", Arc::new(EchoHandler));

        let outcome = run_dispatch(&gw, &reg, base_request(), params(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.used_tools.len(), 3);

        let seen = provider.seen.lock().unwrap();
        let second = seen[1].raw_messages.as_ref().unwrap();
        let results: Vec<&str> = second
            .last()
            .unwrap()["content"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["content"].as_str().unwrap())
            .collect();
        assert_eq!(results, vec!["echo:Warsaw", "echo:Krakow", "echo:Gdansk"]);
    }

    #[tokio::test]
    async fn failing_tool_is_reflected_not_fatal() {
        let (gw, provider) = gateway(ScriptedProvider::new(vec![
            tool_reply(vec![(
                "t1",
                "get_weather",
                serde_json::json!({"location": "Warsaw"}),
            )]),
            text_reply("Sorry, the weather service is down."),
        ]));
        let reg = registry_with("weather", "get_weather", Arc::new(AlwaysFails));

        let outcome = run_dispatch(&gw, &reg, base_request(), params(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.text, "Sorry, the weather service is down.");
        assert_eq!(outcome.used_tools.len(), 1);
        assert!(!outcome.used_tools[0].ok);

        let seen = provider.seen.lock().unwrap();
        let second = seen[1].raw_messages.as_ref().unwrap();
        let block = second
            .iter()
            .flat_map(|m| m["content"].as_array().into_iter().flatten())
            .find(|b| b["type"] == "tool_result")
            .unwrap();
        assert_eq!(block["is_error"], true);
        assert!(block["content"].as_str().unwrap().contains("ToolFailed"));
    }

    #[tokio::test]
    async fn invalid_arguments_are_reflected() {
        let (gw, _) = gateway(ScriptedProvider::new(vec![
            tool_reply(vec![("t1", "get_weather", serde_json::json!({"location": 5}))]),
            text_reply("I passed bad arguments, let me apologize."),
        ]));
        let reg = registry_with("weather", "get_weather", Arc::new(EchoHandler));

        let outcome = run_dispatch(&gw, &reg, base_request(), params(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.used_tools[0].ok);
        assert!(!outcome.loop_exceeded);
    }

    #[tokio::test]
    async fn depth_cap_yields_apology_and_flag() {
        // Model that never stops calling tools.
        let endless: Vec<ChatReply> = (0..10)
            .map(|i| {
                tool_reply(vec![(
                    &format!("t{i}"),
                    "get_weather",
                    serde_json::json!({"location": "Warsaw"}),
                )])
            })
            .collect();
        let (gw, provider) = gateway(ScriptedProvider::new(endless));
        let reg = registry_with("weather", "get_weather", Arc::new(EchoHandler));

        let outcome = run_dispatch(&gw, &reg, base_request(), params(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.loop_exceeded);
        assert_eq!(outcome.text, LOOP_EXCEEDED_APOLOGY);
        // Exactly max_depth LLM calls were made.
        assert_eq!(provider.seen.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn transcript_order_matches_execution() {
        let (gw, _) = gateway(ScriptedProvider::new(vec![
            tool_reply(vec![(
                "t1",
                "get_weather",
                serde_json::json!({"location": "Warsaw"}),
            )]),
            text_reply("final"),
        ]));
        let reg = registry_with("weather", "get_weather", Arc::new(EchoHandler));

        let outcome = run_dispatch(&gw, &reg, base_request(), params(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.transcript.len(), 3);
        assert!(matches!(
            outcome.transcript[0],
            TranscriptEntry::AssistantToolCalls { .. }
        ));
        assert!(matches!(
            outcome.transcript[1],
            TranscriptEntry::ToolResult { .. }
        ));
        assert!(matches!(
            outcome.transcript[2],
            TranscriptEntry::AssistantText { .. }
        ));
    }
}
