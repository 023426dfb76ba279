//! Scripted Provider
//!
//! A provider that replays pre-configured turns, for tests and demos.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::message::{Message, ToolCall};
use crate::provider::{GenerateOptions, Model, Provider, ProviderStream};

/// One scripted provider turn
#[derive(Clone, Debug)]
pub enum ScriptedTurn {
    /// Reply with a message; streamed as a single delta of its content
    Reply(Message),

    /// Stream the given deltas, then the message
    Stream { deltas: Vec<String>, message: Message },

    /// Fail the turn with a provider error
    Fail(String),

    /// Stream the given deltas, then fail before any message
    FailMidStream { deltas: Vec<String>, error: String },

    /// Never finish; only cancellation ends the turn
    Hang,
}

impl ScriptedTurn {
    /// Final text answer
    pub fn text(content: impl Into<String>) -> Self {
        Self::Reply(Message::assistant(content))
    }

    /// A single tool call
    pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Self::Reply(
            Message::assistant("").with_tool_calls(vec![ToolCall::new(id, name, arguments.to_string())]),
        )
    }

    /// Final text answer streamed word by word
    pub fn streamed_text(content: &str) -> Self {
        let deltas = content
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        Self::Stream {
            deltas,
            message: Message::assistant(content),
        }
    }
}

/// A mock provider that returns pre-configured responses for testing
pub struct ScriptedProvider {
    model: Option<Model>,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<GenerateOptions>>,
    cancelled_producers: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    /// Create a provider bound to a scripted model
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        let mut provider = Self::unbound(turns);
        provider.bind_model(Model::new("scripted"));
        provider
    }

    /// Create a provider without a bound model
    pub fn unbound(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            model: None,
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            cancelled_producers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<GenerateOptions> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Turns not yet consumed
    pub fn remaining(&self) -> usize {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Stream producers that observed cancellation
    pub fn cancelled_producers(&self) -> usize {
        self.cancelled_producers.load(Ordering::SeqCst)
    }

    fn next_turn(&self, options: &GenerateOptions) -> Result<ScriptedTurn> {
        self.bound_model()?;
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(options.clone());
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| AgentError::Provider("script exhausted".into()))
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn bind_model(&mut self, model: Model) {
        self.model = Some(model);
    }

    fn model(&self) -> Option<&Model> {
        self.model.as_ref()
    }

    async fn generate(&self, options: &GenerateOptions) -> Result<Message> {
        match self.next_turn(options)? {
            ScriptedTurn::Reply(message) | ScriptedTurn::Stream { message, .. } => Ok(message),
            ScriptedTurn::Fail(error) | ScriptedTurn::FailMidStream { error, .. } => {
                Err(AgentError::Provider(error))
            }
            ScriptedTurn::Hang => std::future::pending().await,
        }
    }

    async fn generate_stream(
        &self,
        options: GenerateOptions,
        cancel: CancellationToken,
    ) -> ProviderStream {
        let turn = match self.next_turn(&options) {
            Ok(turn) => turn,
            Err(e) => return ProviderStream::failed(e),
        };

        let (tx, stream) = ProviderStream::channel();
        let cancelled_producers = self.cancelled_producers.clone();

        tokio::spawn(async move {
            let (deltas, outcome) = match turn {
                ScriptedTurn::Reply(message) => {
                    let deltas = if message.content.is_empty() {
                        Vec::new()
                    } else {
                        vec![message.content.clone()]
                    };
                    (deltas, Ok(message))
                }
                ScriptedTurn::Stream { deltas, message } => (deltas, Ok(message)),
                ScriptedTurn::Fail(error) => (Vec::new(), Err(AgentError::Provider(error))),
                ScriptedTurn::FailMidStream { deltas, error } => {
                    (deltas, Err(AgentError::Provider(error)))
                }
                ScriptedTurn::Hang => {
                    cancel.cancelled().await;
                    cancelled_producers.fetch_add(1, Ordering::SeqCst);
                    return;
                }
            };

            for delta in deltas {
                if cancel.is_cancelled() || !tx.delta(delta).await {
                    cancelled_producers.fetch_add(1, Ordering::SeqCst);
                    return;
                }
            }

            match outcome {
                Ok(message) => {
                    tx.message(message).await;
                }
                Err(e) => {
                    tx.error(e).await;
                }
            }
        });

        stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_in_order() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::text("one"), ScriptedTurn::text("two")]);
        let options = GenerateOptions::new(vec![Message::user("hi")]);

        assert_eq!(provider.generate(&options).await.unwrap().content, "one");
        assert_eq!(provider.generate(&options).await.unwrap().content, "two");
        assert!(provider.generate(&options).await.is_err());
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_streams_deltas_then_message() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::streamed_text("the sky is blue")]);
        let mut stream = provider
            .generate_stream(GenerateOptions::default(), CancellationToken::new())
            .await;

        let mut text = String::new();
        while let Some(delta) = stream.deltas.recv().await {
            text.push_str(&delta);
        }
        assert_eq!(text, "the sky is blue");
        assert_eq!(stream.messages.recv().await.unwrap().content, "the sky is blue");
        assert!(stream.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unbound_fails() {
        let provider = ScriptedProvider::unbound(vec![ScriptedTurn::text("x")]);
        let err = provider.generate(&GenerateOptions::default()).await.unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert_eq!(provider.remaining(), 1);
    }
}
