//! LLM Provider Strategy Pattern
//!
//! Defines a common interface for all LLM backends (Ollama, OpenAI-compatible
//! hosted APIs, scripted test doubles) so the run loop works with any of them
//! without code changes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::provider::{GenerateOptions, Model, Provider};
//!
//! let mut provider = OllamaProvider::localhost();
//! provider.bind_model(Model::new("qwen2.5:latest"));
//!
//! let reply = provider.generate(&GenerateOptions::new(messages)).await?;
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::message::Message;

/// Buffer for the provider delta channel
const DELTA_BUFFER: usize = 32;

/// Information about a model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    /// Backend identifier (e.g., "gpt-4o", "qwen2.5:latest")
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,

    #[serde(default = "default_true")]
    pub supports_tools: bool,

    #[serde(default)]
    pub supports_vision: bool,
}

fn default_true() -> bool {
    true
}

impl Model {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            context_length: None,
            supports_tools: true,
            supports_vision: false,
        }
    }

    pub fn with_vision(mut self) -> Self {
        self.supports_vision = true;
        self
    }
}

/// A tool definition sent to the model so it knows what it can call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,

    /// Description shown to the model
    pub description: String,

    /// JSON Schema object describing the arguments
    pub parameters: serde_json::Value,
}

/// One request to a provider
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Conversation prefix to continue from
    pub messages: Vec<Message>,

    /// Tool catalog available for this turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
}

impl GenerateOptions {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Consumer side of one streamed provider turn.
///
/// `deltas` carries text fragments in arrival order, `messages` the final
/// reconstructed message and `errors` at most one terminal error. Every
/// channel closes when the producer finishes the turn.
pub struct ProviderStream {
    pub messages: mpsc::Receiver<Message>,
    pub deltas: mpsc::Receiver<String>,
    pub errors: mpsc::Receiver<AgentError>,
}

/// Producer side of one streamed provider turn
#[derive(Clone)]
pub struct ProviderStreamSender {
    messages: mpsc::Sender<Message>,
    deltas: mpsc::Sender<String>,
    errors: mpsc::Sender<AgentError>,
}

impl ProviderStream {
    /// Create a connected sender/stream pair
    pub fn channel() -> (ProviderStreamSender, ProviderStream) {
        let (message_tx, message_rx) = mpsc::channel(1);
        let (delta_tx, delta_rx) = mpsc::channel(DELTA_BUFFER);
        let (error_tx, error_rx) = mpsc::channel(1);

        (
            ProviderStreamSender {
                messages: message_tx,
                deltas: delta_tx,
                errors: error_tx,
            },
            ProviderStream {
                messages: message_rx,
                deltas: delta_rx,
                errors: error_rx,
            },
        )
    }

    /// A stream that fails immediately with `error`
    pub fn failed(error: AgentError) -> Self {
        let (tx, stream) = Self::channel();
        // Capacity is 1 and nothing else has been sent.
        let _ = tx.errors.try_send(error);
        stream
    }
}

impl ProviderStreamSender {
    /// Send a text delta. Returns `false` once the consumer has gone away.
    pub async fn delta(&self, delta: impl Into<String>) -> bool {
        self.deltas.send(delta.into()).await.is_ok()
    }

    /// Send the final message of the turn
    pub async fn message(&self, message: Message) -> bool {
        self.messages.send(message).await.is_ok()
    }

    /// Send the terminal error of the turn
    pub async fn error(&self, error: AgentError) -> bool {
        self.errors.send(error).await.is_ok()
    }

    /// Whether the consumer dropped every receiver
    pub fn is_closed(&self) -> bool {
        self.messages.is_closed() && self.deltas.is_closed() && self.errors.is_closed()
    }
}

/// Provider metadata
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Provider name (e.g., "ollama", "openai")
    pub name: String,

    /// Available models
    pub models: Vec<Model>,

    /// Whether streaming is supported
    pub supports_streaming: bool,

    /// Whether tool/function calling is supported
    pub supports_tools: bool,
}

/// Strategy trait for LLM providers
///
/// Implement this trait to add support for new LLM backends.
/// The agent works exclusively through this interface.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Bind the model used by subsequent generate calls
    fn bind_model(&mut self, model: Model);

    /// The currently bound model
    fn model(&self) -> Option<&Model>;

    /// The bound model, or a configuration error when none was bound
    fn bound_model(&self) -> Result<&Model> {
        self.model().ok_or_else(|| {
            AgentError::Config(format!("no model bound to provider '{}'", self.name()))
        })
    }

    /// One blocking round-trip returning exactly one assistant message
    async fn generate(&self, options: &GenerateOptions) -> Result<Message>;

    /// One streamed round-trip.
    ///
    /// The default implementation wraps [`Provider::generate`]: a single delta
    /// carrying the full content, then the message.
    async fn generate_stream(
        &self,
        options: GenerateOptions,
        cancel: CancellationToken,
    ) -> ProviderStream {
        let (tx, stream) = ProviderStream::channel();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tx.error(AgentError::Cancelled).await;
            }
            result = self.generate(&options) => match result {
                Ok(message) => {
                    if !message.content.is_empty() {
                        tx.delta(message.content.clone()).await;
                    }
                    tx.message(message).await;
                }
                Err(e) => {
                    tx.error(e).await;
                }
            },
        }

        stream
    }

    /// List available models
    async fn list_models(&self) -> Result<Vec<Model>> {
        Ok(self.model().cloned().into_iter().collect())
    }

    /// Check if the provider is available and configured correctly
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    /// Get provider information and capabilities
    async fn info(&self) -> Result<ProviderInfo> {
        Ok(ProviderInfo {
            name: self.name().to_string(),
            models: self.list_models().await?,
            supports_streaming: true,
            supports_tools: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProvider {
        model: Option<Model>,
    }

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        fn bind_model(&mut self, model: Model) {
            self.model = Some(model);
        }

        fn model(&self) -> Option<&Model> {
            self.model.as_ref()
        }

        async fn generate(&self, options: &GenerateOptions) -> Result<Message> {
            self.bound_model()?;
            let last = options.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(Message::assistant(last))
        }
    }

    #[tokio::test]
    async fn test_generate_before_bind_fails() {
        let provider = EchoProvider { model: None };
        let err = provider
            .generate(&GenerateOptions::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }

    #[tokio::test]
    async fn test_default_stream_wraps_generate() {
        let mut provider = EchoProvider { model: None };
        provider.bind_model(Model::new("echo-1"));

        let mut stream = provider
            .generate_stream(
                GenerateOptions::new(vec![Message::user("hello")]),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(stream.deltas.recv().await.as_deref(), Some("hello"));
        assert!(stream.deltas.recv().await.is_none());
        assert_eq!(stream.messages.recv().await.unwrap().content, "hello");
        assert!(stream.messages.recv().await.is_none());
        assert!(stream.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_default_stream_reports_errors() {
        let provider = EchoProvider { model: None };
        let mut stream = provider
            .generate_stream(GenerateOptions::default(), CancellationToken::new())
            .await;

        assert!(matches!(stream.errors.recv().await, Some(AgentError::Config(_))));
        assert!(stream.messages.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_info_lists_bound_model() {
        let mut provider = EchoProvider { model: None };
        provider.bind_model(Model::new("echo-1"));
        let info = provider.info().await.unwrap();
        assert_eq!(info.name, "echo");
        assert_eq!(info.models, vec![Model::new("echo-1")]);
    }
}
