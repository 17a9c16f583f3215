//! The query orchestrator: one entry point, `handle_query`, gluing memory,
//! plugins, the LLM gateway and the dispatcher into a single turn.
//!
//! Step order matters and is load-bearing for the persistence invariants:
//! append user turn → load context → collect schemas → dispatch → persist
//! the dispatch transcript in order → meter tokens → reply.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use aria_core::config::{DispatcherConfig, MemoryConfig};
use aria_core::types::{Tier, TurnRole};
use aria_limits::RateLimiter;
use aria_memory::{ConversationTurn, Fact, MemoryStore};
use aria_plugins::PluginRegistry;

use crate::dispatcher::{self, DispatchParams, TranscriptEntry, UsedTool};
use crate::gateway::{GatewayError, LlmGateway};
use crate::provider::{ChatRequest, Message, Role, ToolDefinition};

/// Reply when the provider is unreachable after all retries.
const FALLBACK_TEXT: &str =
    "I'm having trouble reaching my language model right now. Please try again in a moment.";

const SYSTEM_PREAMBLE: &str = "You are Aria, a helpful voice assistant. Reply concisely — \
    your answers may be spoken aloud. Use the provided tools when they help.";

/// Importance assigned to facts mined from user turns.
const MINED_FACT_IMPORTANCE: f64 = 0.55;

#[derive(Debug, Clone)]
pub struct ReplyMetadata {
    pub model: String,
    pub used_tools: Vec<UsedTool>,
    pub latency_ms: u64,
    pub from_fallback: bool,
    pub tokens_charged: u64,
}

/// A tool invocation surfaced to the transport for progress frames.
#[derive(Debug, Clone)]
pub struct ToolEvent {
    pub function: String,
    pub result: Value,
}

#[derive(Debug)]
pub struct QueryReply {
    pub text: String,
    pub metadata: ReplyMetadata,
    pub tool_events: Vec<ToolEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("server overloaded")]
    Overloaded,

    #[error("language model unavailable: {0}")]
    Unavailable(String),

    #[error("query cancelled")]
    Cancelled,
}

pub struct OrchestratorSettings {
    pub memory: MemoryConfig,
    pub dispatcher: DispatcherConfig,
    /// When false, free-tier users get an error instead of the fallback
    /// reply while the provider is down.
    pub fallback_for_free_tier: bool,
}

pub struct Orchestrator {
    gateway: LlmGateway,
    plugins: Arc<PluginRegistry>,
    memory: Arc<MemoryStore>,
    limits: Arc<RateLimiter>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        gateway: LlmGateway,
        plugins: Arc<PluginRegistry>,
        memory: Arc<MemoryStore>,
        limits: Arc<RateLimiter>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            gateway,
            plugins,
            memory,
            limits,
            settings,
        }
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// Append the user turn for a query that is about to run.
    ///
    /// Transports call this in frame-acceptance order (before spawning the
    /// query task) so the persisted user-turn sequence matches the order
    /// frames were accepted, even when queries complete out of order.
    /// A write failure is logged and parked for retry; the query still runs.
    pub async fn append_user_turn(&self, turn: &ConversationTurn) {
        if let Err(e) = self.memory.append_turn(turn).await {
            error!(user_id = %turn.user_id, error = %e, "MemoryWriteFailure: user turn not persisted");
            self.memory.mark_turn_for_retry(turn);
        }
    }

    /// Run one user query to completion (append + dispatch).
    pub async fn handle_query(
        &self,
        user_id: &str,
        tier: Tier,
        session_id: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<QueryReply, QueryError> {
        let user_turn = ConversationTurn::new(user_id, session_id, TurnRole::User, text);
        self.append_user_turn(&user_turn).await;
        self.run_prepared(user_turn, tier, cancel).await
    }

    /// Run a query whose user turn was already appended via
    /// `append_user_turn`.
    pub async fn run_prepared(
        &self,
        user_turn: ConversationTurn,
        tier: Tier,
        cancel: &CancellationToken,
    ) -> Result<QueryReply, QueryError> {
        let started = Instant::now();
        let user_id = user_turn.user_id.as_str();
        let session_id = user_turn.session_id.as_str();
        let text = user_turn.content.as_str();

        // 2. Load context within the budget, minus the reply reservation.
        let budget = self
            .settings
            .memory
            .context_budget_tokens
            .saturating_sub(self.settings.memory.reserved_reply_tokens);
        let ctx = self
            .memory
            .load_context(user_id, session_id, text, budget)
            .await;

        // 3. Tool schemas for this user's enabled, tier-visible plugins.
        let tools: Vec<ToolDefinition> = self
            .plugins
            .schemas_for(user_id, tier)
            .unwrap_or_else(|e| {
                warn!(user_id, error = %e, "schema lookup failed, continuing without tools");
                Vec::new()
            })
            .into_iter()
            .map(|s| ToolDefinition {
                name: s.name,
                description: s.description,
                input_schema: s.input_schema,
            })
            .collect();

        let request = self.build_request(&ctx.facts, &ctx.turns, text, tier, tools);

        // 4. Dispatch.
        let params = DispatchParams {
            user_id,
            session_id,
            tier,
            max_depth: self.settings.dispatcher.max_depth,
            fanout: self.settings.dispatcher.fanout,
        };
        let outcome =
            match dispatcher::run_dispatch(&self.gateway, &self.plugins, request, params, cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(GatewayError::Cancelled) => {
                    // A cancelled query leaves no trace.
                    let _ = self.memory.delete_turn(user_id, &user_turn.turn_id).await;
                    return Err(QueryError::Cancelled);
                }
                Err(GatewayError::Overloaded) => return Err(QueryError::Overloaded),
                Err(e @ (GatewayError::Transient { .. }
                | GatewayError::Fatal { .. }
                | GatewayError::Timeout)) => {
                    return self.fallback_reply(user_id, tier, session_id, started, e).await;
                }
            };

        // 5. Persist the dispatch transcript in its exact order.
        for entry in &outcome.transcript {
            let turn = transcript_turn(user_id, session_id, entry);
            if let Err(e) = self.memory.append_turn(&turn).await {
                error!(user_id, error = %e, "MemoryWriteFailure: transcript turn not persisted");
                self.memory.mark_turn_for_retry(&turn);
            }
        }

        // 6. Meter usage.
        let tokens = outcome.prompt_tokens + outcome.completion_tokens;
        self.limits.record_tokens(user_id, tokens);

        // Mine self-descriptions from the user turn into long-term memory.
        for fact_text in crate::facts::mine_facts(text) {
            if let Err(e) = self
                .memory
                .add_fact(
                    user_id,
                    Some(&user_turn.turn_id),
                    &fact_text,
                    MINED_FACT_IMPORTANCE,
                )
                .await
            {
                warn!(user_id, error = %e, "fact write failed");
            }
        }

        let tool_events = outcome
            .transcript
            .iter()
            .filter_map(|entry| match entry {
                TranscriptEntry::ToolResult {
                    function, payload, ..
                } => Some(ToolEvent {
                    function: function.clone(),
                    result: payload.clone(),
                }),
                _ => None,
            })
            .collect();

        info!(
            user_id,
            session_id,
            model = %outcome.model,
            tools = outcome.used_tools.len(),
            tokens,
            "query complete"
        );

        Ok(QueryReply {
            text: outcome.text,
            metadata: ReplyMetadata {
                model: outcome.model,
                used_tools: outcome.used_tools,
                latency_ms: started.elapsed().as_millis() as u64,
                from_fallback: outcome.loop_exceeded,
                tokens_charged: tokens,
            },
            tool_events,
        })
    }

    /// Graceful degradation when every retry failed: a synthesized reply,
    /// zero tokens charged.
    async fn fallback_reply(
        &self,
        user_id: &str,
        tier: Tier,
        session_id: &str,
        started: Instant,
        cause: GatewayError,
    ) -> Result<QueryReply, QueryError> {
        warn!(user_id, error = %cause, "LLM unreachable, serving fallback");
        if tier == Tier::Free && !self.settings.fallback_for_free_tier {
            return Err(QueryError::Unavailable(cause.to_string()));
        }

        let turn = ConversationTurn::new(user_id, session_id, TurnRole::Assistant, FALLBACK_TEXT);
        if let Err(e) = self.memory.append_turn(&turn).await {
            error!(user_id, error = %e, "MemoryWriteFailure: fallback turn not persisted");
            self.memory.mark_turn_for_retry(&turn);
        }

        Ok(QueryReply {
            text: FALLBACK_TEXT.to_string(),
            metadata: ReplyMetadata {
                model: self.gateway.model().to_string(),
                used_tools: Vec::new(),
                latency_ms: started.elapsed().as_millis() as u64,
                from_fallback: true,
                tokens_charged: 0,
            },
            tool_events: Vec::new(),
        })
    }

    fn build_request(
        &self,
        facts: &[Fact],
        turns: &[ConversationTurn],
        current_text: &str,
        tier: Tier,
        tools: Vec<ToolDefinition>,
    ) -> ChatRequest {
        let mut system = String::from(SYSTEM_PREAMBLE);
        if !facts.is_empty() {
            system.push_str("\n\nWhat you know about this user:\n");
            for fact in facts {
                system.push_str("- ");
                system.push_str(&fact.text);
                system.push('\n');
            }
        }

        // Only user/assistant text turns re-enter the prompt; tool turns
        // were intermediate steps whose outcome is in the assistant text.
        let mut messages: Vec<Message> = turns
            .iter()
            .filter(|t| !t.content.is_empty())
            .filter_map(|t| {
                let role = match t.role {
                    TurnRole::User => Role::User,
                    TurnRole::Assistant => Role::Assistant,
                    TurnRole::Tool => return None,
                };
                Some(Message {
                    role,
                    content: t.content.clone(),
                })
            })
            .collect();

        // The freshly appended user turn is normally the context tail; if
        // memory was unavailable it isn't, so restore it.
        let current_present = messages
            .last()
            .map(|m| m.role == Role::User && m.content == current_text)
            .unwrap_or(false);
        if !current_present {
            messages.push(Message {
                role: Role::User,
                content: current_text.to_string(),
            });
        }

        ChatRequest {
            model: self.gateway.model().to_string(),
            system,
            messages,
            max_tokens: self.gateway.max_output_tokens(tier),
            tools,
            raw_messages: None,
        }
    }
}

/// Map a transcript entry to its persisted turn.
fn transcript_turn(user_id: &str, session_id: &str, entry: &TranscriptEntry) -> ConversationTurn {
    match entry {
        TranscriptEntry::AssistantToolCalls { calls } => {
            ConversationTurn::new(user_id, session_id, TurnRole::Assistant, "").with_tool(
                "tool_calls",
                serde_json::json!({
                    "tool_calls": calls,
                }),
            )
        }
        TranscriptEntry::ToolResult {
            call_id,
            function,
            payload,
            ok,
        } => {
            let content = payload
                .get("content")
                .and_then(|c| c.as_str())
                .map(String::from)
                .unwrap_or_else(|| payload.to_string());
            ConversationTurn::new(user_id, session_id, TurnRole::Tool, content).with_tool(
                function.clone(),
                serde_json::json!({
                    "call_id": call_id,
                    "ok": ok,
                    "result": payload,
                }),
            )
        }
        TranscriptEntry::AssistantText { text } => {
            ConversationTurn::new(user_id, session_id, TurnRole::Assistant, text.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatProvider, ChatReply, ProviderError, ToolCall};
    use aria_core::config::{AiConfig, PluginsConfig, RateLimitConfig};
    use async_trait::async_trait;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider that proves what context it saw: replies with every user
    /// message concatenated.
    struct ContextEchoProvider;

    #[async_trait]
    impl ChatProvider for ContextEchoProvider {
        fn name(&self) -> &str {
            "context-echo"
        }

        async fn send(&self, req: &ChatRequest) -> Result<ChatReply, ProviderError> {
            let mut seen = vec![req.system.clone()];
            if let Some(ref raw) = req.raw_messages {
                for msg in raw {
                    if msg["role"] == "user" {
                        if let Some(text) = msg["content"].as_str() {
                            seen.push(text.to_string());
                        }
                    }
                }
            }
            Ok(ChatReply {
                content: seen.join(" | "),
                model: "test-model".to_string(),
                prompt_tokens: 10,
                completion_tokens: 5,
                stop_reason: "stop".to_string(),
                tool_calls: vec![],
            })
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ChatProvider for FailingProvider {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _req: &ChatRequest) -> Result<ChatReply, ProviderError> {
            Err(ProviderError::Api {
                status: 503,
                message: "down".to_string(),
            })
        }
    }

    /// Calls one tool on the first request, then answers with text.
    struct OneToolProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChatProvider for OneToolProvider {
        fn name(&self) -> &str {
            "one-tool"
        }

        async fn send(&self, _req: &ChatRequest) -> Result<ChatReply, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ChatReply {
                    content: String::new(),
                    model: "test-model".to_string(),
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    stop_reason: "tool_use".to_string(),
                    tool_calls: vec![ToolCall {
                        id: "t1".to_string(),
                        name: "get_weather".to_string(),
                        input: serde_json::json!({"location": "Warsaw"}),
                    }],
                })
            } else {
                Ok(ChatReply {
                    content: "It's 12°C in Warsaw.".to_string(),
                    model: "test-model".to_string(),
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    stop_reason: "stop".to_string(),
                    tool_calls: vec![],
                })
            }
        }
    }

    fn orchestrator(provider: Box<dyn ChatProvider>) -> Orchestrator {
        let memory_conn = Connection::open_in_memory().unwrap();
        aria_memory::db::init_db(&memory_conn).unwrap();
        let memory = Arc::new(MemoryStore::new(memory_conn, MemoryConfig::default()));

        let plugin_conn = Connection::open_in_memory().unwrap();
        aria_plugins::enablement::EnablementStore::init_db(&plugin_conn).unwrap();
        let plugins = Arc::new(PluginRegistry::new(PluginsConfig::default(), plugin_conn));
        plugins
            .register(
                aria_plugins::builtin::weather::descriptor(),
                Arc::new(aria_plugins::builtin::weather::WeatherHandler),
            )
            .unwrap();

        let limits = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        let gateway = LlmGateway::new(
            provider,
            AiConfig {
                max_retries: 1,
                request_timeout_s: 5,
                ..AiConfig::default()
            },
        );

        Orchestrator::new(
            gateway,
            plugins,
            memory,
            limits,
            OrchestratorSettings {
                memory: MemoryConfig::default(),
                dispatcher: aria_core::config::DispatcherConfig::default(),
                fallback_for_free_tier: true,
            },
        )
    }

    #[tokio::test]
    async fn memory_recall_across_turns() {
        let orch = orchestrator(Box::new(ContextEchoProvider));
        let cancel = CancellationToken::new();

        orch.handle_query("u1", Tier::Paid, "s1", "Nazywam się Marcin i jestem programistą", &cancel)
            .await
            .unwrap();
        orch.handle_query(
            "u1",
            Tier::Paid,
            "s1",
            "Mieszkam w Warszawie i programuję w Pythonie",
            &cancel,
        )
        .await
        .unwrap();
        let reply = orch
            .handle_query("u1", Tier::Paid, "s1", "Podsumuj co o mnie wiesz", &cancel)
            .await
            .unwrap();

        let lower = reply.text.to_lowercase();
        assert!(lower.contains("marcin"), "{}", reply.text);
        assert!(lower.contains("warszaw"), "{}", reply.text);
        assert!(lower.contains("python"), "{}", reply.text);
    }

    #[tokio::test]
    async fn users_are_isolated_end_to_end() {
        let orch = orchestrator(Box::new(ContextEchoProvider));
        let cancel = CancellationToken::new();

        orch.handle_query("u1", Tier::Paid, "s1", "Nazywam się Marcin", &cancel)
            .await
            .unwrap();
        let reply = orch
            .handle_query("u2", Tier::Paid, "s2", "Podsumuj co o mnie wiesz", &cancel)
            .await
            .unwrap();
        assert!(
            !reply.text.to_lowercase().contains("marcin"),
            "u2 reply leaked u1 data: {}",
            reply.text
        );
    }

    #[tokio::test]
    async fn gateway_failure_yields_uncharged_fallback() {
        let orch = orchestrator(Box::new(FailingProvider));
        let reply = orch
            .handle_query("u1", Tier::Paid, "s1", "hello?", &CancellationToken::new())
            .await
            .unwrap();
        assert!(reply.metadata.from_fallback);
        assert_eq!(reply.metadata.tokens_charged, 0);
        assert_eq!(reply.text, FALLBACK_TEXT);
    }

    #[tokio::test]
    async fn free_tier_fallback_can_be_disabled() {
        let mut orch = orchestrator(Box::new(FailingProvider));
        orch.settings.fallback_for_free_tier = false;
        let err = orch
            .handle_query("u1", Tier::Free, "s1", "hello?", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Unavailable(_)));
    }

    #[tokio::test]
    async fn tool_turns_are_persisted_in_order() {
        let orch = orchestrator(Box::new(OneToolProvider {
            calls: AtomicU32::new(0),
        }));
        let reply = orch
            .handle_query(
                "u1",
                Tier::Paid,
                "s1",
                "What's the weather in Warsaw?",
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(reply.tool_events.len(), 1);
        assert_eq!(reply.tool_events[0].function, "get_weather");
        assert_eq!(reply.metadata.used_tools.len(), 1);
        assert!(reply.metadata.used_tools[0].ok);

        // Storage order: user, assistant(tool_calls), tool, assistant(text).
        let history = orch.memory().history("u1", 10, None).await.unwrap();
        let roles: Vec<String> = history.iter().rev().map(|t| t.role.to_string()).collect();
        assert_eq!(roles, vec!["user", "assistant", "tool", "assistant"]);
    }

    #[tokio::test]
    async fn cancelled_query_leaves_no_turns() {
        let orch = orchestrator(Box::new(ContextEchoProvider));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orch
            .handle_query("u1", Tier::Paid, "s1", "never mind", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));

        let history = orch.memory().history("u1", 10, None).await.unwrap();
        assert!(history.is_empty(), "cancelled query must leave no turns");
    }

    #[tokio::test]
    async fn mined_facts_survive_to_later_sessions() {
        let orch = orchestrator(Box::new(ContextEchoProvider));
        let cancel = CancellationToken::new();
        orch.handle_query("u1", Tier::Paid, "s1", "I live in Warsaw", &cancel)
            .await
            .unwrap();

        // New session: the short-term tail is empty, but the fact comes
        // back through the long-term search path into the system prompt.
        let reply = orch
            .handle_query("u1", Tier::Paid, "s2", "Where do I live? Warsaw maybe?", &cancel)
            .await
            .unwrap();
        assert!(reply.text.contains("Warsaw"));
    }
}
