//! Reasoning Loop
//!
//! Drives a provider and the tool registry until the stop condition is
//! satisfied:
//!
//! ```text
//! Init → AwaitingProvider → (ExecutingTools → AwaitingProvider)* → Done | Failed
//! ```
//!
//! Tool calls within one assistant turn run sequentially, in the order the
//! model issued them. Provider errors end the run; tool errors become
//! tool-role messages the model can react to.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::message::{Conversation, Message, Role};
use crate::provider::{GenerateOptions, Provider};
use crate::retrieval::{RetrievalHook, VectorStore};
use crate::stop::{NoPendingToolCalls, StopCondition};
use crate::tool::{Tool, ToolRegistry};

/// Agent configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Prepended to every run when set
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Maximum provider turns per run
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Deadline for one streamed provider turn
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

fn default_max_steps() -> usize {
    10
}

fn default_turn_timeout_secs() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_steps: default_max_steps(),
            turn_timeout_secs: default_turn_timeout_secs(),
        }
    }
}

impl AgentConfig {
    /// Read `AGENT_SYSTEM_PROMPT`, `AGENT_MAX_STEPS` and `AGENT_TURN_TIMEOUT_SECS`.
    ///
    /// Unset variables keep their defaults; a value that does not parse is a
    /// [`AgentError::Config`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            system_prompt: lookup("AGENT_SYSTEM_PROMPT").filter(|s| !s.is_empty()),
            max_steps: parse_var(&lookup, "AGENT_MAX_STEPS")?.unwrap_or(defaults.max_steps),
            turn_timeout_secs: parse_var(&lookup, "AGENT_TURN_TIMEOUT_SECS")?
                .unwrap_or(defaults.turn_timeout_secs),
        })
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(value) => value.trim().parse().map(Some).map_err(|_| {
            AgentError::Config(format!("{key} must be a non-negative integer, got '{value}'"))
        }),
    }
}

/// Input for one run
#[derive(Clone, Debug, Default)]
pub struct RunInput {
    pub input: String,

    /// Optional image attachment, passed to the provider unmodified
    pub image: Option<PathBuf>,
}

impl RunInput {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.image = Some(path.into());
        self
    }
}

impl From<&str> for RunInput {
    fn from(input: &str) -> Self {
        Self::new(input)
    }
}

impl From<String> for RunInput {
    fn from(input: String) -> Self {
        Self::new(input)
    }
}

/// Outcome of a run: the transcript, plus the error if the run failed
#[derive(Debug)]
pub struct AgentResult {
    pub messages: Vec<Message>,
    pub error: Option<AgentError>,

    /// Provider turns taken
    pub steps: usize,
}

impl AgentResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The last message of the transcript
    pub fn final_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Content of the last assistant message
    pub fn final_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    pub fn into_result(self) -> Result<Vec<Message>> {
        match self.error {
            None => Ok(self.messages),
            Some(e) => Err(e),
        }
    }
}

/// What the loop does after a completed iteration
pub(crate) enum Step {
    Done,
    Continue,
}

/// The main Agent struct
///
/// Cheap to clone; clones share the provider, tools and stop condition, so
/// one agent can serve concurrent runs.
#[derive(Clone)]
pub struct Agent {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    stop_condition: Arc<dyn StopCondition>,
    retrieval: Option<RetrievalHook>,
    config: AgentConfig,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Run the agent to completion
    pub async fn run(&self, input: impl Into<RunInput>) -> AgentResult {
        self.run_with_cancel(input, CancellationToken::new()).await
    }

    /// Run the agent to completion, abandoning the run when `cancel` fires
    #[tracing::instrument(skip_all, fields(provider = self.provider.name()))]
    pub async fn run_with_cancel(
        &self,
        input: impl Into<RunInput>,
        cancel: CancellationToken,
    ) -> AgentResult {
        let mut conversation = self.seed(input.into()).await;
        let mut step = 0;

        loop {
            step += 1;
            let options = self.generate_options(&conversation);
            tracing::debug!(step, messages = options.messages.len(), "Calling provider");

            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AgentError::Cancelled),
                reply = self.provider.generate(&options) => reply,
            };

            let reply = match reply {
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

    /// Run with a simple string input and return the final answer
    pub async fn ask(&self, question: &str) -> Result<String> {
        let result = self.run(question).await;
        let text = result.final_text().unwrap_or_default().to_string();
        result.into_result().map(|_| text)
    }

    /// Build the initial conversation: system prompt, retrieved context, user turn
    pub(crate) async fn seed(&self, input: RunInput) -> Conversation {
        let mut conversation = match &self.config.system_prompt {
            Some(prompt) => Conversation::with_system_prompt(prompt.clone()),
            None => Conversation::new(),
        };

        if let Some(hook) = &self.retrieval {
            for message in hook.context_messages(&input.input).await {
                conversation.push(message);
            }
        }

        let mut user = Message::user(input.input);
        if let Some(image) = input.image {
            user = user.with_image(image);
        }
        conversation.push(user);
        conversation
    }

    pub(crate) fn generate_options(&self, conversation: &Conversation) -> GenerateOptions {
        GenerateOptions::new(conversation.messages().to_vec()).with_tools(self.tools.definitions())
    }

    /// Append the assistant reply, answer its tool calls, evaluate the stop condition
    pub(crate) async fn complete_step(
        &self,
        conversation: &mut Conversation,
        reply: Message,
        step: usize,
        cancel: &CancellationToken,
    ) -> Result<Step> {
        let reply = self.check_reply(conversation, reply)?;
        let calls = reply.tool_calls.clone();
        conversation.push(reply);

        for call in &calls {
            let outcome = self.tools.execute(call, cancel).await;
            conversation.push(outcome.into_message());
        }

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        if self.stop_condition.should_stop(step, conversation.messages()) {
            return Ok(Step::Done);
        }
        if step >= self.config.max_steps {
            return Err(AgentError::Exhausted { steps: step });
        }
        Ok(Step::Continue)
    }

    /// Reject replies that would break the tool-call protocol
    fn check_reply(&self, conversation: &Conversation, mut reply: Message) -> Result<Message> {
        if reply.role != Role::Assistant {
            return Err(AgentError::Protocol(format!(
                "provider returned a '{}' message instead of an assistant turn",
                reply.role
            )));
        }

        let mut seen: HashSet<String> = conversation
            .messages()
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|c| c.id.clone()))
            .collect();

        for call in &mut reply.tool_calls {
            if call.id.is_empty() {
                call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
            }
            if !seen.insert(call.id.clone()) {
                return Err(AgentError::Protocol(format!(
                    "provider reused tool call id '{}'",
                    call.id
                )));
            }
        }

        Ok(reply)
    }

    pub(crate) fn done(&self, conversation: Conversation, steps: usize) -> AgentResult {
        tracing::info!(steps, messages = conversation.len(), "Run completed");
        AgentResult {
            messages: conversation.into_messages(),
            error: None,
            steps,
        }
    }

    pub(crate) fn fail(&self, conversation: Conversation, steps: usize, error: AgentError) -> AgentResult {
        tracing::error!(steps, kind = ?error.kind(), "Run failed: {}", error);
        AgentResult {
            messages: conversation.into_messages(),
            error: Some(error),
            steps,
        }
    }

    /// Get the tool registry
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Get configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    provider: Option<Arc<dyn Provider>>,
    tools: ToolRegistry,
    stop_condition: Option<Arc<dyn StopCondition>>,
    retrieval: Option<RetrievalHook>,
    config: AgentConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: ToolRegistry::new(),
            stop_condition: None,
            retrieval: None,
            config: AgentConfig::default(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Register a tool; duplicate names fail immediately
    pub fn tool<T: Tool + 'static>(mut self, tool: T) -> Result<Self> {
        self.tools.register(tool)?;
        Ok(self)
    }

    /// Register a tool in place
    pub fn add_tool(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        self.tools.register_arc(tool)
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_steps(mut self, max: usize) -> Self {
        self.config.max_steps = max;
        self
    }

    pub fn turn_timeout(mut self, timeout: Duration) -> Self {
        self.config.turn_timeout_secs = timeout.as_secs();
        self
    }

    pub fn stop_condition(mut self, condition: impl StopCondition + 'static) -> Self {
        self.stop_condition = Some(Arc::new(condition));
        self
    }

    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.retrieval = Some(RetrievalHook::new(store));
        self
    }

    pub fn retrieval(mut self, hook: RetrievalHook) -> Self {
        self.retrieval = Some(hook);
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self.provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;

        if provider.model().is_none() {
            return Err(AgentError::Config(format!(
                "provider '{}' has no bound model",
                provider.name()
            )));
        }
        if self.config.max_steps == 0 {
            return Err(AgentError::Config("max_steps must be at least 1".into()));
        }
        if self.config.turn_timeout_secs == 0 {
            return Err(AgentError::Config("turn timeout must be at least one second".into()));
        }

        tracing::debug!(
            provider = provider.name(),
            tools = self.tools.len(),
            max_steps = self.config.max_steps,
            "Agent built"
        );

        Ok(Agent {
            provider,
            tools: Arc::new(self.tools),
            stop_condition: self.stop_condition.unwrap_or_else(|| Arc::new(NoPendingToolCalls)),
            retrieval: self.retrieval,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::calculator_tool;
    use crate::mock::{ScriptedProvider, ScriptedTurn};
    use crate::stop::Never;
    use serde_json::json;

    fn agent_with(provider: ScriptedProvider) -> AgentBuilder {
        Agent::builder().provider(Arc::new(provider))
    }

    #[test]
    fn test_config_from_lookup() {
        let config = AgentConfig::from_lookup(|key| match key {
            "AGENT_MAX_STEPS" => Some("4".into()),
            "AGENT_SYSTEM_PROMPT" => Some("Be terse.".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.max_steps, 4);
        assert_eq!(config.turn_timeout_secs, 30);
        assert_eq!(config.system_prompt.as_deref(), Some("Be terse."));
    }

    #[test]
    fn test_config_rejects_unparseable_values() {
        let err = AgentConfig::from_lookup(|key| {
            (key == "AGENT_MAX_STEPS").then(|| "ten".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert!(err.to_string().contains("AGENT_MAX_STEPS"));

        let err = AgentConfig::from_lookup(|key| {
            (key == "AGENT_TURN_TIMEOUT_SECS").then(|| "-5".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("AGENT_TURN_TIMEOUT_SECS"));
    }

    #[test]
    fn test_build_requires_provider() {
        assert!(matches!(Agent::builder().build(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_build_requires_bound_model() {
        let err = agent_with(ScriptedProvider::unbound(vec![])).build().err().unwrap();
        assert!(err.to_string().contains("no bound model"));
    }

    #[test]
    fn test_duplicate_tool_fails_at_registration() {
        let builder = agent_with(ScriptedProvider::new(vec![])).tool(calculator_tool()).unwrap();
        assert!(matches!(builder.tool(calculator_tool()), Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_single_turn_without_tools() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedTurn::text("Hello!")]));
        let agent = Agent::builder()
            .provider(provider.clone())
            .system_prompt("You are a helpful assistant.")
            .build()
            .unwrap();

        let result = agent.run("Hi").await;
        assert!(result.is_ok());
        assert_eq!(result.steps, 1);
        assert_eq!(result.messages.len(), 3);
        assert_eq!(result.final_text(), Some("Hello!"));
        assert!(provider.requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn test_image_is_attached_to_user_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![ScriptedTurn::text("A cat.")]));
        let agent = Agent::builder().provider(provider.clone()).build().unwrap();

        let result = agent
            .run(RunInput::new("What is this image?").with_image("/tmp/cat.png"))
            .await;
        assert!(result.is_ok());
        let requests = provider.requests();
        assert_eq!(requests[0].messages[0].images, vec![PathBuf::from("/tmp/cat.png")]);
    }

    #[tokio::test]
    async fn test_provider_error_keeps_partial_transcript() {
        let agent = agent_with(ScriptedProvider::new(vec![
            ScriptedTurn::tool_call("c1", "calculator", json!({"operation": "add", "a": 1, "b": 2})),
            ScriptedTurn::Fail("backend rejected the request".into()),
        ]))
        .tool(calculator_tool())
        .unwrap()
        .build()
        .unwrap();

        let result = agent.run("1 + 2?").await;
        assert_eq!(result.messages.len(), 3);
        assert!(matches!(result.error, Some(AgentError::Provider(_))));
        assert_eq!(result.steps, 2);
    }

    #[tokio::test]
    async fn test_never_stop_hits_step_cap() {
        let turns = (0..5).map(|i| ScriptedTurn::text(format!("answer {}", i))).collect();
        let provider = Arc::new(ScriptedProvider::new(turns));
        let agent = Agent::builder()
            .provider(provider.clone())
            .stop_condition(Never)
            .max_steps(3)
            .build()
            .unwrap();

        let result = agent.run("loop").await;
        assert!(matches!(result.error, Some(AgentError::Exhausted { steps: 3 })));
        assert_eq!(provider.requests().len(), 3);
        assert_eq!(provider.remaining(), 2);
    }

    #[tokio::test]
    async fn test_reused_tool_call_id_is_a_protocol_error() {
        let agent = agent_with(ScriptedProvider::new(vec![
            ScriptedTurn::tool_call("same", "calculator", json!({"operation": "add", "a": 1, "b": 2})),
            ScriptedTurn::tool_call("same", "calculator", json!({"operation": "add", "a": 1, "b": 2})),
        ]))
        .tool(calculator_tool())
        .unwrap()
        .build()
        .unwrap();

        let result = agent.run("twice").await;
        assert!(matches!(result.error, Some(AgentError::Protocol(_))));
        assert_eq!(result.messages.len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let agent = agent_with(ScriptedProvider::new(vec![ScriptedTurn::Hang])).build().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = agent.run_with_cancel("hello", cancel).await;
        assert!(matches!(result.error, Some(AgentError::Cancelled)));
        assert_eq!(result.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_ask_returns_final_text() {
        let agent = agent_with(ScriptedProvider::new(vec![ScriptedTurn::text("Blue light scatters more.")]))
            .build()
            .unwrap();
        assert_eq!(agent.ask("Why is the sky blue?").await.unwrap(), "Blue light scatters more.");
    }

    #[test]
    fn test_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_steps, 10);
        assert_eq!(config.turn_timeout(), Duration::from_secs(30));

        let parsed: AgentConfig = serde_json::from_str(r#"{"max_steps": 4}"#).unwrap();
        assert_eq!(parsed.max_steps, 4);
        assert_eq!(parsed.turn_timeout_secs, 30);
    }
}
