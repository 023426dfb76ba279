//! Ollama LLM Provider
//!
//! Implementation of [`Provider`] for local Ollama inference over the native
//! `/api/chat` endpoint, plus an [`Embedder`] backed by `/api/embed`.

use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, ToolCall},
    provider::{GenerateOptions, Model, Provider, ProviderStream, ProviderStreamSender, ToolDefinition},
    retrieval::Embedder,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::http::{self, LineBuffer};

/// Ollama provider configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,

    /// Timeout for blocking requests in seconds
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
            timeout_secs: 120,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        let host = std::env::var("OLLAMA_HOST")
            .unwrap_or_else(|_| "http://localhost".into());
        let port = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(11434);

        Self {
            host,
            port,
            ..Default::default()
        }
    }

    fn base_url(&self) -> String {
        format!("{}:{}", self.host.trim_end_matches('/'), self.port)
    }
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: Client,
    config: OllamaConfig,
    model: Option<Model>,
}

impl OllamaProvider {
    /// Create a new Ollama provider with custom host/port
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        Self::from_config(OllamaConfig {
            host: host.into(),
            port,
            ..Default::default()
        })
    }

    /// Create from configuration
    pub fn from_config(config: OllamaConfig) -> Result<Self> {
        Ok(Self {
            client: http::client()?,
            config,
            model: None,
        })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_config(OllamaConfig::from_env())
    }

    /// Create with default localhost settings
    pub fn localhost() -> Result<Self> {
        Self::from_config(OllamaConfig::default())
    }

    /// Bind a model while building
    pub fn with_model(mut self, model: Model) -> Self {
        self.model = Some(model);
        self
    }

    /// Embedder sharing this provider's connection settings
    pub fn embedder(&self, model: impl Into<String>) -> OllamaEmbedder {
        OllamaEmbedder {
            client: self.client.clone(),
            url: self.url("/api/embed"),
            model: model.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url(), path)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn chat_request(&self, options: &GenerateOptions, stream: bool) -> Result<ChatRequest> {
        let model = self.bound_model()?;
        Ok(ChatRequest {
            model: model.id.clone(),
            messages: convert_messages(&options.messages).await?,
            tools: convert_tools(&options.tools),
            stream,
        })
    }
}

/// Convert agent messages to Ollama format, inlining images as base64
async fn convert_messages(messages: &[Message]) -> Result<Vec<WireMessage>> {
    let mut converted = Vec::with_capacity(messages.len());
    for message in messages {
        let mut images = Vec::with_capacity(message.images.len());
        for path in &message.images {
            images.push(http::read_image(path).await?);
        }

        let tool_calls = message
            .tool_calls
            .iter()
            .map(|call| WireToolCall {
                function: WireFunction {
                    name: call.name.clone(),
                    arguments: serde_json::from_str(&call.arguments)
                        .unwrap_or_else(|_| Value::Object(serde_json::Map::new())),
                },
            })
            .collect();

        converted.push(WireMessage {
            role: message.role.to_string(),
            content: message.content.clone(),
            images,
            tool_calls,
        });
    }
    Ok(converted)
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<WireTool> {
    tools
        .iter()
        .map(|t| WireTool {
            kind: "function",
            function: t.clone(),
        })
        .collect()
}

/// Ollama omits call ids, so each call gets a fresh one
fn into_tool_calls(calls: Vec<WireToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|c| {
            ToolCall::new(
                format!("call_{}", uuid::Uuid::new_v4().simple()),
                c.function.name,
                c.function.arguments.to_string(),
            )
        })
        .collect()
}

/// Folds NDJSON chat chunks into one assistant message
#[derive(Debug, Default)]
struct ChatAccumulator {
    content: String,
    tool_calls: Vec<WireToolCall>,
    done: bool,
}

impl ChatAccumulator {
    /// Ingest one line; returns the text delta it carried, if any
    fn ingest(&mut self, line: &str) -> Result<Option<String>> {
        let chunk: ChatChunk = serde_json::from_str(line)
            .map_err(|e| AgentError::Provider(format!("malformed Ollama chunk: {}", e)))?;

        if let Some(error) = chunk.error {
            return Err(AgentError::Provider(error));
        }
        self.done |= chunk.done;

        let Some(message) = chunk.message else {
            return Ok(None);
        };
        self.tool_calls.extend(message.tool_calls);
        if message.content.is_empty() {
            return Ok(None);
        }
        self.content.push_str(&message.content);
        Ok(Some(message.content))
    }

    fn finish(self) -> Result<Message> {
        if !self.done {
            return Err(AgentError::Provider("Ollama stream ended before completion".into()));
        }
        Ok(Message::assistant(self.content).with_tool_calls(into_tool_calls(self.tool_calls)))
    }
}

/// Drive one streamed chat request. `Ok(None)` means the consumer went away.
async fn stream_chat(
    client: Client,
    url: String,
    request: ChatRequest,
    tx: &ProviderStreamSender,
) -> Result<Option<Message>> {
    let response = client
        .post(&url)
        .json(&request)
        .send()
        .await
        .map_err(http::transport_error)?;
    let response = http::check_status(response).await?;

    let mut bytes = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut acc = ChatAccumulator::default();

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

    acc.finish().map(Some)
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn bind_model(&mut self, model: Model) {
        self.model = Some(model);
    }

    fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    async fn generate(&self, options: &GenerateOptions) -> Result<Message> {
        let request = self.chat_request(options, false).await?;
        tracing::debug!(model = %request.model, messages = request.messages.len(), "Sending Ollama chat request");

        let response = self
            .client
            .post(self.url("/api/chat"))
            .timeout(self.timeout())
            .json(&request)
            .send()
            .await
            .map_err(http::transport_error)?;
        let response = http::check_status(response).await?;

        let body = response.text().await.map_err(http::transport_error)?;
        let mut acc = ChatAccumulator::default();
        acc.ingest(&body)?;
        acc.finish()
    }

    async fn generate_stream(
        &self,
        options: GenerateOptions,
        cancel: CancellationToken,
    ) -> ProviderStream {
        let request = match self.chat_request(&options, true).await {
            Ok(request) => request,
            Err(e) => return ProviderStream::failed(e),
        };
        tracing::debug!(model = %request.model, messages = request.messages.len(), "Streaming Ollama chat request");

        let (tx, stream) = ProviderStream::channel();
        let client = self.client.clone();
        let url = self.url("/api/chat");

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Ollama stream cancelled");
                    return;
                }
                outcome = stream_chat(client, url, request, &tx) => outcome,
            };

            match outcome {
                Ok(Some(message)) => {
                    tx.message(message).await;
                }
                Ok(None) => tracing::debug!("Ollama stream consumer went away"),
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
            .get(self.url("/api/tags"))
            .timeout(self.timeout())
            .send()
            .await
            .map_err(http::transport_error)?;
        let tags: TagsResponse = http::check_status(response)
            .await?
            .json()
            .await
            .map_err(http::transport_error)?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| {
                let vision = m
                    .details
                    .families
                    .iter()
                    .any(|f| f == "clip" || f == "mllama");
                let model = Model {
                    name: Some(m.name.clone()),
                    ..Model::new(m.name)
                };
                if vision { model.with_vision() } else { model }
            })
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.get(self.url("/api/tags")).timeout(self.timeout()).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::warn!("Ollama health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

/// Embeddings from a local Ollama model
pub struct OllamaEmbedder {
    client: Client,
    url: String,
    model: String,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        tracing::debug!(model = %self.model, count = texts.len(), "Sending Ollama embed request");

        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "model": self.model, "input": texts }))
            .send()
            .await
            .map_err(http::transport_error)?;
        let body: EmbedResponse = http::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::VectorStore(format!("malformed embed response: {}", e)))?;

        Ok(body.embeddings)
    }
}

// --- Ollama API types ---

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ToolDefinition,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    details: TagDetails,
}

#[derive(Debug, Default, Deserialize)]
struct TagDetails {
    #[serde(default)]
    families: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::message::Role;
    use serde_json::json;

    #[test]
    fn test_config_defaults() {
        let config = OllamaConfig::default();
        assert_eq!(config.host, "http://localhost");
        assert_eq!(config.port, 11434);
        assert_eq!(config.base_url(), "http://localhost:11434");
    }

    #[tokio::test]
    async fn test_message_conversion() {
        let messages = vec![
            Message::system("You are helpful."),
            Message::user("What is 5 + 3?"),
            Message::assistant("").with_tool_calls(vec![ToolCall::new(
                "call_1",
                "calculator",
                r#"{"operation":"add","a":5,"b":3}"#,
            )]),
            Message::tool("call_1", "8"),
        ];

        let converted = convert_messages(&messages).await.unwrap();
        assert_eq!(converted.len(), 4);
        assert_eq!(converted[3].role, "tool");

        let wire = serde_json::to_value(&converted[2]).unwrap();
        assert_eq!(wire["tool_calls"][0]["function"]["arguments"]["a"], json!(5));
        assert!(wire.get("images").is_none());
    }

    #[tokio::test]
    async fn test_missing_image_fails_request() {
        let messages = vec![Message::user("What is this?").with_image("/nonexistent/image.png")];
        assert!(matches!(convert_messages(&messages).await, Err(AgentError::Provider(_))));
    }

    #[test]
    fn test_tool_catalog_shape() {
        let tools = convert_tools(&[ToolDefinition {
            name: "calculator".into(),
            description: "Arithmetic".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }]);
        let wire = serde_json::to_value(&tools).unwrap();
        assert_eq!(wire[0]["type"], "function");
        assert_eq!(wire[0]["function"]["name"], "calculator");
        assert_eq!(wire[0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_accumulates_stream_chunks() {
        let mut acc = ChatAccumulator::default();
        let lines = [
            r#"{"message":{"role":"assistant","content":"The sky "},"done":false}"#,
            r#"{"message":{"role":"assistant","content":"is blue."},"done":false}"#,
            r#"{"message":{"role":"assistant","content":""},"done":true,"eval_count":12}"#,
        ];
        let deltas: Vec<String> = lines.iter().filter_map(|l| acc.ingest(l).unwrap()).collect();
        assert_eq!(deltas, vec!["The sky ", "is blue."]);

        let message = acc.finish().unwrap();
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.content, "The sky is blue.");
    }

    #[test]
    fn test_tool_calls_get_ids() {
        let mut acc = ChatAccumulator::default();
        acc.ingest(
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"calculator","arguments":{"operation":"add","a":5,"b":3}}}]},"done":true}"#,
        )
        .unwrap();

        let message = acc.finish().unwrap();
        let call = &message.tool_calls[0];
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.name, "calculator");
        let args: Value = serde_json::from_str(&call.arguments).unwrap();
        assert_eq!(args["b"], json!(3));
    }

    #[test]
    fn test_error_line_and_truncated_stream() {
        let mut acc = ChatAccumulator::default();
        let err = acc.ingest(r#"{"error":"model 'nope' not found"}"#).unwrap_err();
        assert!(err.to_string().contains("not found"));

        let mut acc = ChatAccumulator::default();
        acc.ingest(r#"{"message":{"role":"assistant","content":"partial"},"done":false}"#).unwrap();
        assert!(acc.finish().is_err());
    }

    #[tokio::test]
    async fn test_generate_requires_bound_model() {
        let provider = OllamaProvider::localhost().unwrap();
        let err = provider.generate(&GenerateOptions::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
