//! Anthropic Provider
//!
//! Native Messages API (`/v1/messages`). The system prompt travels as a
//! top-level field, tool calls are `tool_use` content blocks and tool replies
//! go back as `tool_result` blocks inside a user turn.

use std::collections::BTreeMap;
use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role, ToolCall},
    provider::{GenerateOptions, Model, Provider, ProviderStream, ProviderStreamSender, ToolDefinition},
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::http::{self, LineBuffer};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic provider configuration
#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    /// API root, without a trailing slash
    pub base_url: String,

    pub api_key: String,

    /// Upper bound on generated tokens per turn; the API requires one
    pub max_tokens: u32,

    /// Timeout for blocking requests in seconds
    pub timeout_secs: u64,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: ANTHROPIC_BASE_URL.into(),
            api_key: api_key.into(),
            max_tokens: 4096,
            timeout_secs: 300,
        }
    }

    /// Read `ANTHROPIC_API_KEY` and optionally `ANTHROPIC_BASE_URL`
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| AgentError::Config("ANTHROPIC_API_KEY is not set".into()))?;
        let mut config = Self::new(api_key);
        if let Ok(base_url) = std::env::var("ANTHROPIC_BASE_URL") {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        Ok(config)
    }
}

/// Provider for Anthropic's Messages API
pub struct AnthropicProvider {
    client: Client,
    config: AnthropicConfig,
    model: Option<Model>,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        Ok(Self {
            client: http::client()?,
            config,
            model: None,
        })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(AnthropicConfig::from_env()?)
    }

    /// Bind a model while building
    pub fn with_model(mut self, model: Model) -> Self {
        self.model = Some(model);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    async fn request_body(&self, options: &GenerateOptions, stream: bool) -> Result<Value> {
        let model = self.bound_model()?;
        let (system, messages) = to_api_messages(&options.messages).await?;

        let mut body = json!({
            "model": model.id,
            "max_tokens": self.config.max_tokens,
            "messages": messages,
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if !options.tools.is_empty() {
            body["tools"] = json!(to_api_tools(&options.tools));
        }
        Ok(body)
    }
}

/// Split out the system prompt and convert the rest to content blocks.
///
/// Consecutive tool replies are folded into one user turn, since the API
/// expects user and assistant turns to alternate.
async fn to_api_messages(messages: &[Message]) -> Result<(Option<String>, Vec<ApiMessage>)> {
    let mut system = Vec::new();
    let mut converted: Vec<ApiMessage> = Vec::with_capacity(messages.len());

    for m in messages {
        match m.role {
            Role::System => system.push(m.content.as_str()),
            Role::User => {
                let mut blocks = Vec::with_capacity(m.images.len() + 1);
                for path in &m.images {
                    blocks.push(ContentBlock::Image {
                        source: ImageSource {
                            kind: "base64".into(),
                            media_type: http::image_mime(path).into(),
                            data: http::read_image(path).await?,
                        },
                    });
                }
                blocks.push(ContentBlock::Text { text: m.content.clone() });
                converted.push(ApiMessage { role: "user".into(), content: blocks });
            }
            Role::Assistant => {
                let mut blocks = Vec::with_capacity(m.tool_calls.len() + 1);
                if !m.content.is_empty() {
                    blocks.push(ContentBlock::Text { text: m.content.clone() });
                }
                for call in &m.tool_calls {
                    blocks.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: serde_json::from_str(&call.arguments)
                            .unwrap_or_else(|_| Value::Object(serde_json::Map::new())),
                    });
                }
                converted.push(ApiMessage { role: "assistant".into(), content: blocks });
            }
            Role::Tool => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                    content: m.content.clone(),
                };
                let merge = converted
                    .last()
                    .is_some_and(|last| last.role == "user" && last.content.iter().all(ContentBlock::is_tool_result));
                match converted.last_mut() {
                    Some(last) if merge => last.content.push(block),
                    _ => converted.push(ApiMessage { role: "user".into(), content: vec![block] }),
                }
            }
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    Ok((system, converted))
}

fn to_api_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| json!({ "name": t.name, "description": t.description, "input_schema": t.parameters }))
        .collect()
}

fn from_api_response(response: ApiResponse) -> Message {
    let mut content = String::new();
    let mut calls = Vec::new();

    for block in response.content {
        match block {
            ContentBlock::Text { text } => content.push_str(&text),
            ContentBlock::ToolUse { id, name, input } => {
                calls.push(ToolCall::new(id, name, input.to_string()));
            }
            ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
        }
    }

    Message::assistant(content).with_tool_calls(calls)
}

#[derive(Debug, Default)]
struct ToolUseAccumulator {
    id: String,
    name: String,
    input: String,
}

/// Folds `/v1/messages` SSE events into one assistant message
#[derive(Debug, Default)]
struct EventAccumulator {
    content: String,
    tool_uses: BTreeMap<u32, ToolUseAccumulator>,
    /// `message_stop` arrived
    done: bool,
}

impl EventAccumulator {
    /// Ingest one SSE line; returns the text delta it carried, if any
    fn ingest(&mut self, line: &str) -> Result<Option<String>> {
        // `event:` names repeat the payload's `type`
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let event: StreamEvent = serde_json::from_str(data.trim())
            .map_err(|e| AgentError::Provider(format!("malformed stream event: {}", e)))?;

        match event {
            StreamEvent::ContentBlockStart { index, content_block } => {
                if let ContentBlock::ToolUse { id, name, .. } = content_block {
                    self.tool_uses.insert(index, ToolUseAccumulator { id, name, input: String::new() });
                }
                Ok(None)
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } if !text.is_empty() => {
                    self.content.push_str(&text);
                    Ok(Some(text))
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(acc) = self.tool_uses.get_mut(&index) {
                        acc.input.push_str(&partial_json);
                    }
                    Ok(None)
                }
                _ => Ok(None),
            },
            StreamEvent::MessageStop => {
                self.done = true;
                Ok(None)
            }
            StreamEvent::Error { error } => Err(AgentError::Provider(error.message)),
            StreamEvent::Other => Ok(None),
        }
    }

    /// The assembled reply; a stream cut off before `message_stop` is an error
    fn finish(self) -> Result<Message> {
        if !self.done {
            return Err(AgentError::Provider("Anthropic stream ended before completion".into()));
        }
        let calls = self
            .tool_uses
            .into_values()
            .map(|acc| {
                let input = if acc.input.trim().is_empty() { "{}".to_string() } else { acc.input };
                ToolCall::new(acc.id, acc.name, input)
            })
            .collect();
        Ok(Message::assistant(self.content).with_tool_calls(calls))
    }
}

/// Drive one streamed message. `Ok(None)` means the consumer went away.
async fn stream_message(request: RequestBuilder, tx: &ProviderStreamSender) -> Result<Option<Message>> {
    let response = request
        .header("Accept", "text/event-stream")
        .send()
        .await
        .map_err(http::transport_error)?;
    let response = http::check_status(response).await?;

    let mut bytes = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut acc = EventAccumulator::default();

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
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn bind_model(&mut self, model: Model) {
        self.model = Some(model);
    }

    fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    async fn generate(&self, options: &GenerateOptions) -> Result<Message> {
        let body = self.request_body(options, false).await?;
        tracing::debug!(model = %body["model"], "Sending Anthropic message request");

        let response = self
            .authorized(self.client.post(self.url("/v1/messages")))
            .timeout(self.timeout())
            .json(&body)
            .send()
            .await
            .map_err(http::transport_error)?;
        let response: ApiResponse = http::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("failed to parse response: {}", e)))?;

        Ok(from_api_response(response))
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
        tracing::debug!(model = %body["model"], "Streaming Anthropic message request");

        let (tx, stream) = ProviderStream::channel();
        let request = self.authorized(self.client.post(self.url("/v1/messages"))).json(&body);

        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Anthropic stream cancelled");
                    return;
                }
                outcome = stream_message(request, &tx) => outcome,
            };

            match outcome {
                Ok(Some(message)) => {
                    tx.message(message).await;
                }
                Ok(None) => tracing::debug!("Anthropic stream consumer went away"),
                Err(e) => {
                    tx.error(e).await;
                }
            }
        });

        stream
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        let response = self
            .authorized(self.client.get(self.url("/v1/models")))
            .timeout(self.timeout())
            .send()
            .await
            .map_err(http::transport_error)?;
        let body: ModelsResponse = http::check_status(response)
            .await?
            .json()
            .await
            .map_err(http::transport_error)?;

        Ok(body
            .data
            .into_iter()
            .map(|m| Model {
                name: m.display_name,
                ..Model::new(m.id).with_vision()
            })
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        let result = self
            .authorized(self.client.get(self.url("/v1/models")))
            .timeout(self.timeout())
            .send()
            .await;

        match result {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => {
                tracing::warn!("Anthropic health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    /// Thinking and other blocks we do not surface
    #[serde(other, skip_serializing)]
    Other,
}

impl ContentBlock {
    fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    MessageStop,
    Error {
        error: StreamError,
    },
    /// `message_start`, `message_delta`, `content_block_stop`, `ping`
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}
