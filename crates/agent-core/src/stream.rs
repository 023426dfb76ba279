//! Streaming Runs
//!
//! Same loop as [`Agent::run`], but each provider turn is consumed as a
//! stream and its text deltas are forwarded to the caller as they arrive.
//! Tool round-trips still happen between turns; only text is pipelined.

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::provider::GenerateOptions;
use crate::reasoning::{Agent, AgentResult, RunInput, Step};

/// Deltas handed to the caller; the caller's pace throttles the provider
const CALLER_DELTA_BUFFER: usize = 1;

/// Handle to a streaming run
///
/// `deltas` closes once the run reaches a terminal state, after which
/// `result` resolves with the transcript.
pub struct StreamResult {
    pub deltas: mpsc::Receiver<String>,
    pub result: oneshot::Receiver<AgentResult>,
}

impl StreamResult {
    /// Next text fragment, or `None` once the run is over
    pub async fn next_delta(&mut self) -> Option<String> {
        self.deltas.recv().await
    }

    /// Split into a delta stream and the pending result.
    ///
    /// The run advances only as fast as deltas are taken, so drain the
    /// stream (or drop it) before awaiting the result. Awaiting the result
    /// while holding an undrained stream stalls the turn until it times out.
    pub fn into_delta_stream(self) -> (ReceiverStream<String>, oneshot::Receiver<AgentResult>) {
        (ReceiverStream::new(self.deltas), self.result)
    }

    /// Discard remaining deltas and wait for the result
    pub async fn finish(mut self) -> AgentResult {
        while self.deltas.recv().await.is_some() {}
        await_result(self.result).await
    }

    /// Concatenate every delta and wait for the result
    pub async fn collect(mut self) -> (String, AgentResult) {
        let mut text = String::new();
        while let Some(delta) = self.deltas.recv().await {
            text.push_str(&delta);
        }
        (text, await_result(self.result).await)
    }
}

async fn await_result(result: oneshot::Receiver<AgentResult>) -> AgentResult {
    result.await.unwrap_or_else(|_| AgentResult {
        messages: Vec::new(),
        error: Some(AgentError::Other("streaming run ended without a result".into())),
        steps: 0,
    })
}

impl Agent {
    /// Run the agent, streaming text deltas as they are produced
    pub fn run_stream(&self, input: impl Into<RunInput>) -> StreamResult {
        self.run_stream_with_cancel(input, CancellationToken::new())
    }

    /// Streaming run that is abandoned when `cancel` fires
    pub fn run_stream_with_cancel(
        &self,
        input: impl Into<RunInput>,
        cancel: CancellationToken,
    ) -> StreamResult {
        let (delta_tx, delta_rx) = mpsc::channel(CALLER_DELTA_BUFFER);
        let (result_tx, result_rx) = oneshot::channel();

        let agent = self.clone();
        let input = input.into();
        let span = tracing::info_span!("agent_stream", provider = agent.provider().name());

        tokio::spawn(
            async move {
                let result = agent.stream_loop(input, delta_tx, cancel).await;
                if result_tx.send(result).is_err() {
                    tracing::debug!("Stream result dropped by caller");
                }
            }
            .instrument(span),
        );

        StreamResult {
            deltas: delta_rx,
            result: result_rx,
        }
    }

    async fn stream_loop(
        &self,
        input: RunInput,
        deltas: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> AgentResult {
        let mut conversation = self.seed(input).await;
        let mut step = 0;

        loop {
            step += 1;
            let options = self.generate_options(&conversation);
            tracing::debug!(step, messages = options.messages.len(), "Streaming provider turn");

            let reply = match self.stream_turn(options, &deltas, &cancel).await {
                Ok(reply) => reply,
                Err(e) => return self.fail(conversation, step, e),
            };

            match self.complete_step(&mut conversation, reply, step, &cancel).await {
                Ok(Step::Done) => return self.done(conversation, step),
                Ok(Step::Continue) => continue,
                Err(e) => return self.fail(conversation, step, e),
            }
        }
    }

    /// Consume one provider stream under the turn deadline.
    ///
    /// The provider's producer is cancelled when this returns, whatever the
    /// outcome. An error on the stream aborts the turn even if a message was
    /// already received.
    async fn stream_turn(
        &self,
        options: GenerateOptions,
        deltas: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let turn_timeout = self.config().turn_timeout();
        let deadline = Instant::now() + turn_timeout;

        let turn = cancel.child_token();
        let _guard = turn.clone().drop_guard();

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(AgentError::Timeout(turn_timeout)),
            stream = self.provider().generate_stream(options, turn.clone()) => stream,
        };

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        let mut deltas_open = true;
        let mut messages_open = true;
        let mut errors_open = true;
        let mut reply = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                () = &mut sleep => {
                    tracing::warn!(timeout = ?turn_timeout, "Provider turn timed out");
                    return Err(AgentError::Timeout(turn_timeout));
                }
                error = stream.errors.recv(), if errors_open => match error {
                    Some(e) => return Err(e),
                    None => errors_open = false,
                },
                delta = stream.deltas.recv(), if deltas_open => match delta {
                    Some(delta) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                            sent = tokio::time::timeout_at(deadline, deltas.send(delta)) => {
                                // A dropped receiver only means nobody is listening
                                if sent.is_err() {
                                    return Err(AgentError::Timeout(turn_timeout));
                                }
                            }
                        }
                    }
                    None => deltas_open = false,
                },
                message = stream.messages.recv(), if messages_open => match message {
                    Some(message) => reply = Some(message),
                    None => messages_open = false,
                },
                else => break,
            }
        }

        reply.ok_or_else(|| AgentError::Provider("stream ended without a final message".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptedProvider, ScriptedTurn};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_deltas_concatenate_to_final_text() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::streamed_text("Rust is a systems language")]);
        let agent = Agent::builder().provider(Arc::new(provider)).build().unwrap();

        let (text, result) = agent.run_stream("What is Rust?").collect().await;
        assert!(result.is_ok());
        assert_eq!(text, "Rust is a systems language");
        assert_eq!(result.final_text(), Some("Rust is a systems language"));
    }

    #[tokio::test]
    async fn test_error_mid_stream_appends_nothing() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::FailMidStream {
            deltas: vec!["partial ".into()],
            error: "connection reset".into(),
        }]);
        let agent = Agent::builder().provider(Arc::new(provider)).build().unwrap();

        let (text, result) = agent.run_stream("hi").collect().await;
        assert_eq!(text, "partial ");
        assert!(matches!(result.error, Some(AgentError::Provider(_))));
        assert_eq!(result.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_finish_without_reading_deltas() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::streamed_text("one two three four")]);
        let agent = Agent::builder().provider(Arc::new(provider)).build().unwrap();

        let result = agent.run_stream("count").finish().await;
        assert!(result.is_ok());
        assert_eq!(result.steps, 1);
    }

    #[tokio::test]
    async fn test_dropped_delta_stream_lets_run_finish() {
        let provider = ScriptedProvider::new(vec![ScriptedTurn::streamed_text("one two three four five")]);
        let agent = Agent::builder().provider(Arc::new(provider)).build().unwrap();

        let (deltas, result) = agent.run_stream("count").into_delta_stream();
        drop(deltas);

        let result = result.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(result.final_text(), Some("one two three four five"));
    }

    #[tokio::test]
    async fn test_cancel_stream() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedTurn::Hang]));
        let agent = Agent::builder().provider(provider.clone()).build().unwrap();
        let cancel = CancellationToken::new();

        let stream = agent.run_stream_with_cancel("wait", cancel.clone());
        while provider.requests().is_empty() {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        let result = stream.finish().await;
        assert!(matches!(result.error, Some(AgentError::Cancelled)));

        for _ in 0..10 {
            if provider.cancelled_producers() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(provider.cancelled_producers(), 1);
    }
}
