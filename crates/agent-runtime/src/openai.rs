//! OpenAI-compatible Provider
//!
//! Works with OpenAI, Google's OpenAI-compatible Gemini endpoint and any
//! other backend exposing `/chat/completions`.
//!
//! Supports:
//! - Chat completions (blocking and SSE streaming)
//! - Tool calling, with streamed call fragments reassembled by index
//! - Image attachments as `image_url` data URLs
//! - Model listing, health checks and `/embeddings`

use std::collections::BTreeMap;
use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role, ToolCall},
    provider::{GenerateOptions, Model, Provider, ProviderStream, ProviderStreamSender, ToolDefinition},
    retrieval::Embedder,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::http::{self, LineBuffer};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// OpenAI-compatible provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Name reported by the provider (e.g., "openai", "gemini")
    pub name: String,

    /// API root, without a trailing slash
    pub base_url: String,

    pub api_key: String,

    /// Timeout for blocking requests in seconds
    pub timeout_secs: u64,
}

impl OpenAiConfig {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout_secs: 120,
        }
    }

    /// Read `OPENAI_API_KEY` and optionally `OPENAI_BASE_URL`
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AgentError::Config("OPENAI_API_KEY is not set".into()))?;
        let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| OPENAI_BASE_URL.into());
        Ok(Self::new("openai", base_url, api_key))
    }
}

/// Provider for OpenAI-compatible chat completion APIs
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
    model: Option<Model>,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        Ok(Self {
            client: http::client()?,
            config,
            model: None,
        })
    }

    /// OpenAI's hosted API
    pub fn openai(api_key: impl Into<String>) -> Result<Self> {
        Self::new(OpenAiConfig::new("openai", OPENAI_BASE_URL, api_key))
    }

    /// Gemini through Google's OpenAI-compatible endpoint
    pub fn gemini(api_key: impl Into<String>) -> Result<Self> {
        Self::new(OpenAiConfig::new("gemini", GEMINI_BASE_URL, api_key))
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(OpenAiConfig::from_env()?)
    }

    /// Bind a model while building
    pub fn with_model(mut self, model: Model) -> Self {
        self.model = Some(model);
        self
    }

    /// Embedder sharing this provider's endpoint and key
    pub fn embedder(&self, model: impl Into<String>) -> OpenAiEmbedder {
        OpenAiEmbedder {
            client: self.client.clone(),
            url: self.url("/embeddings"),
            api_key: self.config.api_key.clone(),
            model: model.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn request_body(&self, options: &GenerateOptions, stream: bool) -> Result<Value> {
        let model = self.bound_model()?;
        let mut body = json!({
            "model": model.id,
            "messages": to_api_messages(&options.messages).await?,
            "stream": stream,
        });
        if !options.tools.is_empty() {
            body["tools"] = json!(to_api_tools(&options.tools));
        }
        Ok(body)
    }
}

/// Convert our messages to the chat completions format
async fn to_api_messages(messages: &[Message]) -> Result<Vec<ApiMessage>> {
    let mut converted = Vec::with_capacity(messages.len());
    for m in messages {
        let content = if m.images.is_empty() {
            json!(m.content)
        } else {
            let mut parts = vec![json!({ "type": "text", "text": m.content })];
            for path in &m.images {
                let data = http::read_image(path).await?;
                parts.push(json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{};base64,{}", http::image_mime(path), data) },
                }));
            }
            Value::Array(parts)
        };

        let tool_calls = (!m.tool_calls.is_empty()).then(|| {
            m.tool_calls
                .iter()
                .map(|tc| ApiToolCall {
                    id: tc.id.clone(),
                    kind: "function".into(),
                    function: ApiFunction {
                        name: tc.name.clone(),
                        arguments: tc.arguments.clone(),
                    },
                })
                .collect()
        });

        converted.push(ApiMessage {
            role: m.role.to_string(),
            content: Some(content),
            tool_calls,
            tool_call_id: m.tool_call_id.clone(),
        });
    }
    Ok(converted)
}

fn to_api_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| json!({ "type": "function", "function": t }))
        .collect()
}

fn from_api_message(message: ApiMessage) -> Result<Message> {
    let content = match message.content {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => {
            return Err(AgentError::Provider(format!("unexpected message content: {}", other)));
        }
    };

    let tool_calls = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
        .collect();

    Ok(Message::new(Role::Assistant, content).with_tool_calls(tool_calls))
}

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

/// Folds SSE `data:` payloads into one assistant message
#[derive(Debug, Default)]
struct SseAccumulator {
    content: String,
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    /// A choice reported its `finish_reason`
    finished: bool,
    /// `[DONE]` arrived
    done: bool,
}

impl SseAccumulator {
    /// Ingest one SSE line; returns the text delta it carried, if any
    fn ingest(&mut self, line: &str) -> Result<Option<String>> {
        // Comments, event names and ids carry nothing we need
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim();
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let chunk: StreamResponse = serde_json::from_str(data)
            .map_err(|e| AgentError::Provider(format!("malformed stream chunk: {}", e)))?;
        if let Some(error) = chunk.error {
            return Err(AgentError::Provider(error.message));
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(None);
        };
        self.finished |= choice.finish_reason.is_some();

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let acc = self.tool_calls.entry(tc.index).or_default();
            if let Some(id) = tc.id {
                acc.id = id;
            }
            if let Some(function) = tc.function {
                if let Some(name) = function.name {
                    acc.name = name;
                }
                if let Some(arguments) = function.arguments {
                    acc.arguments.push_str(&arguments);
                }
            }
        }

        match choice.delta.content {
            Some(content) if !content.is_empty() => {
                self.content.push_str(&content);
                Ok(Some(content))
            }
            _ => Ok(None),
        }
    }

    /// The assembled reply; a stream cut off before completion is an error
    fn finish(self) -> Result<Message> {
        if !self.done && !self.finished {
            return Err(AgentError::Provider("stream ended before completion".into()));
        }
        let calls = self
            .tool_calls
            .into_values()
            .map(|acc| ToolCall::new(acc.id, acc.name, acc.arguments))
            .collect();
        Ok(Message::assistant(self.content).with_tool_calls(calls))
    }
}

/// Drive one streamed completion. `Ok(None)` means the consumer went away.
async fn stream_completion(
    client: Client,
    url: String,
    api_key: String,
    body: Value,
    tx: &ProviderStreamSender,
) -> Result<Option<Message>> {
    let response = client
        .post(&url)
        .bearer_auth(&api_key)
        .header("Accept", "text/event-stream")
        .json(&body)
        .send()
        .await
        .map_err(http::transport_error)?;
    let response = http::check_status(response).await?;

    let mut bytes = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut acc = SseAccumulator::default();

    while let Some(chunk) = bytes.next().await {
        let chunk = chunk.map_err(http::transport_error)?;
        for line in lines.push(&chunk) {
            if let Some(delta) = acc.ingest(&line)? {
                if !tx.delta(delta).await {
                    return Ok(None);
                }
            }
        }
        if acc.done {
            break;
        }
    }

    if let Some(rest) = lines.finish() {
        if let Some(delta) = acc.ingest(&rest)? {
            if !tx.delta(delta).await {
                return Ok(None);
            }
        }
    }
    if !acc.done {
        tracing::debug!(finished = acc.finished, "Stream ended without [DONE]");
    }
    acc.finish().map(Some)
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn bind_model(&mut self, model: Model) {
        self.model = Some(model);
    }

    fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    async fn generate(&self, options: &GenerateOptions) -> Result<Message> {
        let body = self.request_body(options, false).await?;
        tracing::debug!(provider = %self.config.name, model = %body["model"], "Sending completion request");

        let response = self
            .client
            .post(self.url("/chat/completions"))
            .timeout(self.timeout())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(http::transport_error)?;
        let response: ApiResponse = http::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("failed to parse response: {}", e)))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Provider("no choices in response".into()))?;

        from_api_message(choice.message)
    }

    async fn generate_stream(
        &self,
        options: GenerateOptions,
        cancel: CancellationToken,
    ) -> ProviderStream {
        let body = match self.request_body(&options, true).await {
            Ok(body) => body,
            Err(e) => return ProviderStream::failed(e),
        };
        tracing::debug!(provider = %self.config.name, model = %body["model"], "Sending streaming request");

        let (tx, stream) = ProviderStream::channel();
        let client = self.client.clone();
        let url = self.url("/chat/completions");
        let api_key = self.config.api_key.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Completion stream cancelled");
                    return;
                }
                outcome = stream_completion(client, url, api_key, body, &tx) => outcome,
            };

            match outcome {
                Ok(Some(message)) => {
                    tx.message(message).await;
                }
                Ok(None) => tracing::debug!("Completion stream consumer went away"),
                Err(e) => {
                    tx.error(e).await;
                }
            }
        });

        stream
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        let response = self
            .client
            .get(self.url("/models"))
            .timeout(self.timeout())
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(http::transport_error)?;
        let body: ModelsResponse = http::check_status(response)
            .await?
            .json()
            .await
            .map_err(http::transport_error)?;

        Ok(body.data.into_iter().map(|m| Model::new(m.id)).collect())
    }

    async fn health_check(&self) -> Result<bool> {
        let result = self
            .client
            .get(self.url("/models"))
            .timeout(self.timeout())
            .bearer_auth(&self.config.api_key)
            .send()
            .await;

        match result {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::warn!(provider = %self.config.name, "Health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

/// Embeddings from an OpenAI-compatible `/embeddings` endpoint
pub struct OpenAiEmbedder {
    client: Client,
    url: String,
    api_key: String,
    model: String,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        tracing::debug!(model = %self.model, count = texts.len(), "Sending embedding request");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "input": texts,
                "encoding_format": "float",
            }))
            .send()
            .await
            .map_err(http::transport_error)?;
        let mut body: EmbeddingApiResponse = http::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::VectorStore(format!("malformed embedding response: {}", e)))?;

        body.data.sort_by_key(|d| d.index);
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }
}

// --- OpenAI API types ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: ApiFunction,
}

fn function_kind() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// A single SSE `data: {...}` chunk
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call fragment; arrives incrementally across chunks
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let openai = OpenAiProvider::openai("sk-test").unwrap();
        assert_eq!(openai.name(), "openai");
        assert_eq!(openai.url("/models"), "https://api.openai.com/v1/models");

        let gemini = OpenAiProvider::gemini("key").unwrap().with_model(Model::new("gemini-2.0-flash"));
        assert_eq!(gemini.name(), "gemini");
        assert_eq!(gemini.model().map(|m| m.id.as_str()), Some("gemini-2.0-flash"));
    }

    #[tokio::test]
    async fn test_message_conversion() {
        let messages = vec![
            Message::user("What is 5 + 3?"),
            Message::assistant("").with_tool_calls(vec![ToolCall::new(
                "call_1",
                "calculator",
                r#"{"operation":"add","a":5,"b":3}"#,
            )]),
            Message::tool("call_1", "8"),
        ];

        let wire = serde_json::to_value(to_api_messages(&messages).await.unwrap()).unwrap();
        assert_eq!(wire[0]["content"], "What is 5 + 3?");
        assert_eq!(wire[1]["tool_calls"][0]["type"], "function");
        assert_eq!(wire[1]["tool_calls"][0]["function"]["arguments"], r#"{"operation":"add","a":5,"b":3}"#);
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_parses_blocking_response() {
        let response: ApiResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": { "name": "calculator", "arguments": "{\"operation\":\"add\",\"a\":5,\"b\":3}" }
                    }]
                }
            }]
        }))
        .unwrap();

        let message = from_api_message(response.choices.into_iter().next().unwrap().message).unwrap();
        assert_eq!(message.content, "");
        assert_eq!(message.tool_calls[0].id, "call_abc");
    }

    #[test]
    fn test_accumulates_sse_text_and_tool_calls() {
        let mut acc = SseAccumulator::default();
        let lines = [
            ": keep-alive",
            r#"data: {"choices":[{"delta":{"role":"assistant","content":"Let me "}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"check."}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"calculator","arguments":"{\"operation\":"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"add\",\"a\":5,\"b\":3}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "data: [DONE]",
        ];

        let deltas: Vec<String> = lines.iter().filter_map(|l| acc.ingest(l).unwrap()).collect();
        assert_eq!(deltas, vec!["Let me ", "check."]);
        assert!(acc.done);

        let message = acc.finish().unwrap();
        assert_eq!(message.content, "Let me check.");
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].id, "call_1");
        assert_eq!(message.tool_calls[0].arguments, r#"{"operation":"add","a":5,"b":3}"#);
    }

    #[test]
    fn test_sse_cut_off_is_an_error() {
        let mut acc = SseAccumulator::default();
        let delta = acc
            .ingest(r#"data: {"choices":[{"delta":{"content":"The answer is 4"}}]}"#)
            .unwrap();
        assert_eq!(delta.as_deref(), Some("The answer is 4"));

        let err = acc.finish().unwrap_err();
        assert!(matches!(err, AgentError::Provider(_)));
        assert!(err.to_string().contains("before completion"));
    }

    #[test]
    fn test_sse_finish_reason_without_done() {
        let mut acc = SseAccumulator::default();
        acc.ingest(r#"data: {"choices":[{"delta":{"content":"Blue light scatters."}}]}"#)
            .unwrap();
        acc.ingest(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#)
            .unwrap();

        assert!(!acc.done);
        assert_eq!(acc.finish().unwrap().content, "Blue light scatters.");
    }

    #[test]
    fn test_sse_error_payload() {
        let mut acc = SseAccumulator::default();
        let err = acc
            .ingest(r#"data: {"error":{"message":"context length exceeded","type":"invalid_request_error"}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("context length exceeded"));
    }

    #[tokio::test]
    async fn test_generate_requires_bound_model() {
        let provider = OpenAiProvider::openai("sk-test").unwrap();
        let err = provider.generate(&GenerateOptions::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
