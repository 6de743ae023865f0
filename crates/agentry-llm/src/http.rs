//! OpenAI-compatible chat-completions adapter
//!
//! The runtime only sees the `ModelProvider` trait; this adapter covers any
//! endpoint speaking the chat-completions wire format (including local
//! gateways via `with_base_url`).

use crate::provider::{ModelError, ModelProvider, ModelResult};
use crate::types::{ModelOutcome, ModelRequest, Usage};
use agentry_core::{Message, Role, ToolCall};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct HttpProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl HttpProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait::async_trait]
impl ModelProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(
        &self,
        request: ModelRequest,
        cancel: Option<CancellationToken>,
    ) -> ModelResult<ModelOutcome> {
        let body = build_body(&request);
        debug!(model = %request.model, "chat-completions request");

        let send = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = match cancel {
            Some(cancel) => tokio::select! {
                response = send => response?,
                _ = cancel.cancelled() => return Err(ModelError::Canceled),
            },
            None => send.await?,
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "chat-completions error: {}", error_text);
            return Err(match status.as_u16() {
                401 => ModelError::AuthFailed(error_text),
                429 => ModelError::RateLimited {
                    retry_after_ms: 60_000,
                },
                _ => ModelError::RequestFailed(format!("{status}: {error_text}")),
            });
        }

        let parsed: WireResponse = response.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::InvalidResponse("response has no choices".into()))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall {
                id: tc.id,
                name: tc.function.name,
                args: serde_json::from_str(&tc.function.arguments).unwrap_or_default(),
            })
            .collect();

        let message = if tool_calls.is_empty() {
            Message::assistant(choice.message.content.unwrap_or_default())
        } else {
            let mut message = Message::assistant_tool_calls(tool_calls);
            message.content = choice.message.content.unwrap_or_default();
            message
        };

        Ok(ModelOutcome {
            message,
            usage: parsed.usage.map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
        })
    }
}

/// Shape a `ModelRequest` into the chat-completions wire body.
fn build_body(request: &ModelRequest) -> serde_json::Value {
    let mut messages: Vec<WireMessage> = Vec::new();
    if let Some(system) = &request.system_prompt {
        messages.push(WireMessage {
            role: "system".into(),
            content: Some(system.clone()),
            tool_calls: None,
            tool_call_id: None,
        });
    }
    for message in &request.messages {
        messages.push(to_wire(message));
    }

    let mut body = serde_json::json!({
        "model": request.model,
        "messages": messages,
    });
    if !request.tool_defs.is_empty() {
        body["tools"] = serde_json::Value::Array(
            request
                .tool_defs
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect(),
        );
    }
    if let Some(tool_choice) = &request.tool_choice {
        body["tool_choice"] = serde_json::json!(tool_choice);
    }
    if let Some(format) = &request.response_format {
        body["response_format"] = format.clone();
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = serde_json::json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = serde_json::json!(max_tokens);
    }
    if let Some(stop) = &request.stop {
        body["stop"] = serde_json::json!(stop);
    }
    body
}

fn to_wire(message: &Message) -> WireMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let tool_calls = message.tool_calls.as_ref().map(|calls| {
        calls
            .iter()
            .map(|c| WireToolCall {
                id: c.id.clone(),
                kind: "function".into(),
                function: WireFunction {
                    name: c.name.clone(),
                    arguments: c.args.to_string(),
                },
            })
            .collect()
    });
    WireMessage {
        role: role.into(),
        content: if message.content.is_empty() && tool_calls.is_some() {
            None
        } else {
            Some(message.content.clone())
        },
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
}

#[derive(Deserialize)]
struct WireChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}
