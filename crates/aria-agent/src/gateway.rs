//! Provider-agnostic LLM gateway.
//!
//! Wraps a `ChatProvider` with the operational envelope: bounded admission
//! (back-pressure), per-attempt timeout, retry with exponential backoff on
//! transient failures, per-tier output token ceilings, and usage tagging
//! for metering.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aria_core::config::AiConfig;
use aria_core::types::Tier;

use crate::provider::{ChatProvider, ChatRequest, ProviderError, ToolCall};

/// How long a caller may wait for an admission permit before the request
/// is rejected as overloaded.
const ADMIT_WAIT_MS: u64 = 500;
/// Base backoff between retry attempts; doubles each attempt.
const BACKOFF_BASE_MS: u64 = 250;

/// Metering tag attached to every successful gateway response.
#[derive(Debug, Clone)]
pub struct Usage {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens as u64 + self.completion_tokens as u64
    }
}

#[derive(Debug, Clone)]
pub struct GatewayReply {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: String,
    pub usage: Usage,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway admission queue full")]
    Overloaded,

    #[error("provider failed after {attempts} attempts: {last}")]
    Transient { attempts: u32, last: String },

    #[error("provider error: {message}")]
    Fatal { message: String },

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,
}

pub struct LlmGateway {
    provider: Box<dyn ChatProvider>,
    inflight: Arc<Semaphore>,
    cfg: AiConfig,
}

impl LlmGateway {
    pub fn new(provider: Box<dyn ChatProvider>, cfg: AiConfig) -> Self {
        Self {
            inflight: Arc::new(Semaphore::new(cfg.max_inflight.max(1))),
            provider,
            cfg,
        }
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Per-call output token ceiling for a tier.
    pub fn max_output_tokens(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Free => self.cfg.max_tokens_free,
            Tier::Paid => self.cfg.max_tokens_paid,
        }
    }

    /// Send one chat request through the operational envelope.
    ///
    /// Cancellation is honored while queued, between attempts, and during
    /// the in-flight call.
    pub async fn chat(
        &self,
        mut req: ChatRequest,
        tier: Tier,
        cancel: &CancellationToken,
    ) -> Result<GatewayReply, GatewayError> {
        req.max_tokens = req.max_tokens.min(self.max_output_tokens(tier));

        let _permit = tokio::select! {
            permit = tokio::time::timeout(
                Duration::from_millis(ADMIT_WAIT_MS),
                self.inflight.clone().acquire_owned(),
            ) => match permit {
                Ok(Ok(p)) => p,
                Ok(Err(_)) => return Err(GatewayError::Overloaded),
                Err(_) => {
                    warn!("gateway admission queue full");
                    return Err(GatewayError::Overloaded);
                }
            },
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        let attempts = self.cfg.max_retries + 1;
        let call_timeout = Duration::from_secs(self.cfg.request_timeout_s);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }

            let result = tokio::select! {
                result = tokio::time::timeout(call_timeout, self.provider.send(&req)) => result,
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            };

            let err = match result {
                Ok(Ok(reply)) => {
                    let usage = Usage {
                        provider: self.provider.name().to_string(),
                        model: reply.model.clone(),
                        prompt_tokens: reply.prompt_tokens,
                        completion_tokens: reply.completion_tokens,
                    };
                    info!(
                        provider = %usage.provider,
                        model = %usage.model,
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        attempt,
                        "gateway call complete"
                    );
                    return Ok(GatewayReply {
                        text: reply.content,
                        tool_calls: reply.tool_calls,
                        stop_reason: reply.stop_reason,
                        usage,
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Unavailable(format!(
                    "provider call exceeded {}s",
                    self.cfg.request_timeout_s
                )),
            };

            if !err.is_transient() {
                warn!(error = %err, "non-retryable provider error");
                return Err(GatewayError::Fatal {
                    message: err.to_string(),
                });
            }

            last_error = err.to_string();
            if attempt + 1 < attempts {
                let backoff = err
                    .retry_after_ms()
                    .unwrap_or(BACKOFF_BASE_MS << attempt)
                    .min(10_000);
                debug!(attempt, backoff_ms = backoff, error = %last_error, "retrying provider call");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                }
            }
        }

        warn!(attempts, last = %last_error, "provider failed after all retries");
        Err(GatewayError::Transient {
            attempts,
            last: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatReply, Message, Role};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted provider: pops one canned result per call.
    struct ScriptedProvider {
        calls: AtomicU32,
        script: Vec<Result<ChatReply, ProviderError>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<ChatReply, ProviderError>>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                script,
            }
        }

        fn reply(text: &str) -> ChatReply {
            ChatReply {
                content: text.to_string(),
                model: "test-model".to_string(),
                prompt_tokens: 10,
                completion_tokens: 5,
                stop_reason: "stop".to_string(),
                tool_calls: vec![],
            }
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, _req: &ChatRequest) -> Result<ChatReply, ProviderError> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.script.get(idx) {
                Some(Ok(reply)) => Ok(reply.clone()),
                Some(Err(e)) => Err(clone_error(e)),
                None => Ok(Self::reply("default")),
            }
        }
    }

    fn clone_error(e: &ProviderError) -> ProviderError {
        match e {
            ProviderError::Api { status, message } => ProviderError::Api {
                status: *status,
                message: message.clone(),
            },
            ProviderError::RateLimited { retry_after_ms } => ProviderError::RateLimited {
                retry_after_ms: *retry_after_ms,
            },
            ProviderError::Parse(m) => ProviderError::Parse(m.clone()),
            ProviderError::Unavailable(m) => ProviderError::Unavailable(m.clone()),
            ProviderError::Http(_) => ProviderError::Unavailable("http".to_string()),
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test-model".to_string(),
            system: String::new(),
            messages: vec![Message {
                role: Role::User,
                content: "hi".to_string(),
            }],
            max_tokens: 4096,
            tools: vec![],
            raw_messages: None,
        }
    }

    fn gateway(script: Vec<Result<ChatReply, ProviderError>>) -> LlmGateway {
        LlmGateway::new(
            Box::new(ScriptedProvider::new(script)),
            AiConfig {
                max_retries: 2,
                request_timeout_s: 5,
                ..AiConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let gw = gateway(vec![
            Err(ProviderError::Api {
                status: 503,
                message: "upstream busy".to_string(),
            }),
            Ok(ScriptedProvider::reply("recovered")),
        ]);
        let reply = gw
            .chat(request(), Tier::Paid, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.text, "recovered");
    }

    #[tokio::test]
    async fn fatal_errors_surface_immediately() {
        let gw = gateway(vec![
            Err(ProviderError::Api {
                status: 401,
                message: "bad key".to_string(),
            }),
            Ok(ScriptedProvider::reply("never reached")),
        ]);
        let err = gw
            .chat(request(), Tier::Paid, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Fatal { .. }));
    }

    #[tokio::test]
    async fn retries_exhaust_into_transient_error() {
        let busy = || {
            Err(ProviderError::Api {
                status: 503,
                message: "busy".to_string(),
            })
        };
        let gw = gateway(vec![busy(), busy(), busy(), busy()]);
        let err = gw
            .chat(request(), Tier::Paid, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transient { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn free_tier_output_tokens_are_capped() {
        let gw = gateway(vec![Ok(ScriptedProvider::reply("hi"))]);
        assert_eq!(gw.max_output_tokens(Tier::Free), 150);
        assert_eq!(gw.max_output_tokens(Tier::Paid), 4096);
    }

    #[tokio::test]
    async fn cancellation_wins_over_retry_sleep() {
        let gw = gateway(vec![Err(ProviderError::RateLimited {
            retry_after_ms: 5_000,
        })]);
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.cancel();
        });
        let err = gw.chat(request(), Tier::Paid, &cancel).await.unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
    }

    #[tokio::test]
    async fn usage_is_tagged_with_provider_and_model() {
        let gw = gateway(vec![Ok(ScriptedProvider::reply("tagged"))]);
        let reply = gw
            .chat(request(), Tier::Paid, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reply.usage.provider, "scripted");
        assert_eq!(reply.usage.model, "test-model");
        assert_eq!(reply.usage.total_tokens(), 15);
    }
}
