use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::provider::{ChatProvider, ChatReply, ChatRequest, ProviderError, ToolCall};

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatReply, ProviderError> {
        let body = build_request_body(req);
        let url = format!("{}/v1/chat/completions", self.base_url);

        debug!(model = %req.model, "sending request to OpenAI");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|s| s * 1000)
                .unwrap_or(5000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry,
            });
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI API error");
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        parse_response(api_resp)
    }
}

fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    // The dispatcher builds neutral content-block messages (tool_use /
    // tool_result). Convert those to OpenAI's native shape: assistant
    // tool_calls and tool-role result messages.
    let mut messages = vec![serde_json::json!({
        "role": "system",
        "content": req.system,
    })];
    if let Some(ref raw) = req.raw_messages {
        for raw_msg in raw {
            messages.extend(convert_raw_message(raw_msg));
        }
    } else {
        for m in &req.messages {
            messages.push(serde_json::json!({
                "role": m.role,
                "content": m.content,
            }));
        }
    }

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
    });

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    body
}

/// Convert one neutral raw message into the OpenAI message(s) it implies.
fn convert_raw_message(raw: &serde_json::Value) -> Vec<serde_json::Value> {
    let role = raw.get("role").and_then(|r| r.as_str()).unwrap_or("user");
    let content = raw.get("content");

    // Plain string content passes straight through.
    if let Some(text) = content.and_then(|c| c.as_str()) {
        return vec![serde_json::json!({ "role": role, "content": text })];
    }

    let Some(blocks) = content.and_then(|c| c.as_array()) else {
        return vec![];
    };

    if role == "assistant" {
        let mut text_parts: Vec<&str> = Vec::new();
        let mut tool_calls: Vec<serde_json::Value> = Vec::new();
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        text_parts.push(t);
                    }
                }
                Some("tool_use") => {
                    let arguments = block
                        .get("input")
                        .map(|i| i.to_string())
                        .unwrap_or_else(|| "{}".to_string());
                    tool_calls.push(serde_json::json!({
                        "id": block.get("id").and_then(|i| i.as_str()).unwrap_or_default(),
                        "type": "function",
                        "function": {
                            "name": block.get("name").and_then(|n| n.as_str()).unwrap_or_default(),
                            "arguments": arguments,
                        }
                    }));
                }
                _ => {}
            }
        }
        let mut msg = serde_json::json!({ "role": "assistant" });
        msg["content"] = if text_parts.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::String(text_parts.join(""))
        };
        if !tool_calls.is_empty() {
            msg["tool_calls"] = serde_json::Value::Array(tool_calls);
        }
        return vec![msg];
    }

    // User-role block lists carry tool results: one tool message each.
    let mut out = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("tool_result") => {
                out.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": block.get("tool_use_id").and_then(|i| i.as_str()).unwrap_or_default(),
                    "content": block.get("content").and_then(|c| c.as_str()).unwrap_or_default(),
                }));
            }
            Some("text") => {
                out.push(serde_json::json!({
                    "role": "user",
                    "content": block.get("text").and_then(|t| t.as_str()).unwrap_or_default(),
                }));
            }
            _ => {}
        }
    }
    out
}

fn parse_response(resp: ApiResponse) -> Result<ChatReply, ProviderError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Parse("response has no choices".to_string()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let input = serde_json::from_str(&tc.function.arguments)
                .unwrap_or(serde_json::Value::Object(Default::default()));
            ToolCall {
                id: tc.id,
                name: tc.function.name,
                input,
            }
        })
        .collect();

    Ok(ChatReply {
        content: choice.message.content.unwrap_or_default(),
        model: resp.model,
        prompt_tokens: resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
        completion_tokens: resp
            .usage
            .as_ref()
            .map(|u| u.completion_tokens)
            .unwrap_or(0),
        stop_reason: choice.finish_reason.unwrap_or_default(),
        tool_calls,
    })
}

// OpenAI API response types (private — only used for deserialization)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
