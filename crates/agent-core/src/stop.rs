//! Stop Conditions
//!
//! A stop condition is evaluated once per completed iteration with the step
//! count and the transcript so far. The step cap itself belongs to the run
//! loop; a condition only decides whether the run is finished.

use std::sync::Arc;

use crate::message::{Message, Role};

/// Decides whether a run is finished
pub trait StopCondition: Send + Sync {
    fn should_stop(&self, step: usize, messages: &[Message]) -> bool;
}

impl<F> StopCondition for F
where
    F: Fn(usize, &[Message]) -> bool + Send + Sync,
{
    fn should_stop(&self, step: usize, messages: &[Message]) -> bool {
        self(step, messages)
    }
}

/// Stop as soon as the model answers without requesting tools
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPendingToolCalls;

impl StopCondition for NoPendingToolCalls {
    fn should_stop(&self, _step: usize, messages: &[Message]) -> bool {
        messages
            .last()
            .is_some_and(|m| m.role == Role::Assistant && !m.has_tool_calls())
    }
}

/// Stop when the latest assistant turn contains a phrase
#[derive(Clone, Debug)]
pub struct ContainsPhrase(pub String);

impl ContainsPhrase {
    pub fn new(phrase: impl Into<String>) -> Self {
        Self(phrase.into())
    }
}

impl StopCondition for ContainsPhrase {
    fn should_stop(&self, _step: usize, messages: &[Message]) -> bool {
        messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .is_some_and(|m| m.content.contains(&self.0))
    }
}

/// Never satisfied; the run ends only at the step cap
#[derive(Clone, Copy, Debug, Default)]
pub struct Never;

impl StopCondition for Never {
    fn should_stop(&self, _step: usize, _messages: &[Message]) -> bool {
        false
    }
}

/// Satisfied when any inner condition is
#[derive(Clone, Default)]
pub struct AnyOf(pub Vec<Arc<dyn StopCondition>>);

impl AnyOf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn or(mut self, condition: impl StopCondition + 'static) -> Self {
        self.0.push(Arc::new(condition));
        self
    }
}

impl StopCondition for AnyOf {
    fn should_stop(&self, step: usize, messages: &[Message]) -> bool {
        self.0.iter().any(|c| c.should_stop(step, messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;

    #[test]
    fn test_no_pending_tool_calls() {
        let tool_turn = vec![
            Message::user("What is 5 + 3?"),
            Message::assistant("").with_tool_calls(vec![ToolCall::new("1", "calculator", "{}")]),
        ];
        assert!(!NoPendingToolCalls.should_stop(1, &tool_turn));

        let mut answered = tool_turn.clone();
        answered.push(Message::tool("1", "8"));
        assert!(!NoPendingToolCalls.should_stop(1, &answered));

        answered.push(Message::assistant("8"));
        assert!(NoPendingToolCalls.should_stop(2, &answered));
    }

    #[test]
    fn test_contains_phrase() {
        let messages = vec![Message::user("go"), Message::assistant("FINAL ANSWER: 42")];
        assert!(ContainsPhrase::new("FINAL ANSWER").should_stop(1, &messages));
        assert!(!ContainsPhrase::new("nope").should_stop(1, &messages));
    }

    #[test]
    fn test_closures_and_any_of() {
        let after_three = |step: usize, _: &[Message]| step >= 3;
        assert!(!after_three.should_stop(2, &[]));

        let any = AnyOf::new().or(Never).or(after_three);
        assert!(!any.should_stop(1, &[]));
        assert!(any.should_stop(3, &[]));
    }
}
