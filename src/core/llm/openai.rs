//! OpenAI-compatible `/chat/completions` streaming client.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::base::{ChatMessage, LlmChunk, LlmError, LlmProvider, LlmStream, Role, ToolCall, ToolSchema};
use crate::utils::sse::SseLineParser;

const STREAM_CHANNEL_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            max_tokens: None,
            timeout_secs: 60,
        }
    }
}

pub struct OpenAiLlm {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiLlm {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        if config.model.is_empty() {
            return Err(LlmError::Configuration("model must not be empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| LlmError::Configuration(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, messages: &[ChatMessage], tools: &[ToolSchema]) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "stream": true,
            "messages": messages.iter().map(message_to_openai).collect::<Vec<_>>(),
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
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
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

fn message_to_openai(msg: &ChatMessage) -> Value {
    let mut value = json!({
        "role": msg.role,
        "content": msg.content,
    });
    if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
        value["tool_calls"] = Value::Array(
            msg.tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.arguments},
                    })
                })
                .collect(),
        );
    }
    if let Some(id) = &msg.tool_call_id {
        value["tool_call_id"] = json!(id);
    }
    value
}

/// Tool call fragments keyed by their stream index.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<u64, ToolCall>,
}

impl ToolCallAccumulator {
    fn push(&mut self, fragment: &Value) {
        let index = fragment.get("index").and_then(Value::as_u64).unwrap_or(0);
        let call = self.calls.entry(index).or_insert_with(|| ToolCall {
            id: String::new(),
            name: String::new(),
            arguments: String::new(),
        });
        if let Some(id) = fragment.get("id").and_then(Value::as_str)
            && !id.is_empty()
        {
            call.id = id.to_string();
        }
        let function = fragment.get("function");
        if let Some(name) = function.and_then(|f| f.get("name")).and_then(Value::as_str)
            && !name.is_empty()
        {
            call.name = name.to_string();
        }
        if let Some(args) = function.and_then(|f| f.get("arguments")).and_then(Value::as_str) {
            call.arguments.push_str(args);
        }
    }

    fn finish(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
            .into_values()
            .filter(|c| !c.name.is_empty())
            .enumerate()
            .map(|(i, mut c)| {
                if c.id.is_empty() {
                    c.id = format!("call_{i}");
                }
                if c.arguments.trim().is_empty() {
                    c.arguments = "{}".to_string();
                }
                c
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    delta: Option<Value>,
    #[serde(default)]
    finish_reason: Option<String>,
}

/// Parse one `data:` payload into its text delta, folding tool call fragments
/// into `tools`.
fn parse_chunk(data: &str, tools: &mut ToolCallAccumulator) -> String {
    let chunk: CompletionChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            debug!("Skipping unparseable completion chunk: {}", e);
            return String::new();
        }
    };

    let mut text = String::new();
    for choice in chunk.choices {
        if let Some(delta) = &choice.delta {
            if let Some(content) = delta.get("content").and_then(Value::as_str) {
                text.push_str(content);
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                calls.iter().for_each(|c| tools.push(c));
            }
        }
        if let Some(reason) = &choice.finish_reason {
            debug!(finish_reason = %reason, "LLM choice finished");
        }
    }
    text
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiLlm {
    async fn stream_chat(
        &self,
        cancel: CancellationToken,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolSchema>,
    ) -> Result<LlmStream, LlmError> {
        let body = self.build_body(&messages, &tools);
        let mut request = self.client.post(self.endpoint()).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::RequestFailed("cancelled".into())),
            response = request.send() => response.map_err(|e| LlmError::RequestFailed(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_SIZE);
        let mut bytes = response.bytes_stream();

        tokio::spawn(async move {
            let mut parser = SseLineParser::new();
            let mut tool_calls = ToolCallAccumulator::default();

            'read: loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("LLM stream cancelled");
                        return;
                    }
                    chunk = bytes.next() => chunk,
                };

                let (events, eof) = match chunk {
                    Some(Ok(chunk)) => (parser.push(&chunk), false),
                    Some(Err(e)) => {
                        warn!("LLM stream read error: {}", e);
                        let _ = tx.send(Err(LlmError::Stream(e.to_string()))).await;
                        return;
                    }
                    None => (parser.flush().into_iter().collect(), true),
                };

                for event in events {
                    if event.is_done() {
                        break 'read;
                    }
                    let text = parse_chunk(&event.data, &mut tool_calls);
                    if !text.is_empty() && tx.send(Ok(LlmChunk::text(text))).await.is_err() {
                        return;
                    }
                }

                if eof {
                    break;
                }
            }

            let calls = tool_calls.finish();
            if !calls.is_empty() {
                let _ = tx.send(Ok(LlmChunk::tool_calls(calls))).await;
            }
        });

        Ok(rx)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
