//! Tool System
//!
//! Tools are registered before a run and invoked by the run loop whenever the
//! model emits a [`ToolCall`]. Argument decoding, schema validation and the
//! tool's own failures are all reported as [`ToolOutcome`] failures so the
//! model can see them and adapt; nothing here aborts a run.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::message::{Message, ToolCall};
use crate::provider::ToolDefinition;
use crate::schema;

/// Execution context handed to every tool invocation
#[derive(Clone, Debug)]
pub struct ToolContext {
    /// Id of the tool call being answered
    pub call_id: String,

    /// Cancelled when the surrounding run is abandoned
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(call_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            call_id: call_id.into(),
            cancel,
        }
    }
}

/// Tool trait - implement to add new capabilities
///
/// Implementations are shared across concurrent runs and must be safe to
/// invoke concurrently.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name, description and argument schema shown to the model
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with raw, not yet validated arguments
    async fn invoke(&self, ctx: &ToolContext, arguments: &str) -> Result<Value>;
}

/// A tool backed by an async function over typed arguments.
///
/// The arguments are validated against `schema` and then decoded into `A`
/// before `func` runs, so the schema and the target type stay side by side.
///
/// ```rust,ignore
/// #[derive(Deserialize)]
/// struct Args { a: f64, b: f64 }
///
/// let add = FunctionTool::new("add", "Adds two numbers", schema, |_ctx, args: Args| async move {
///     Ok(args.a + args.b)
/// });
/// ```
pub struct FunctionTool<A, F> {
    definition: ToolDefinition,
    func: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F> FunctionTool<A, F> {
    pub fn new<R, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        func: F,
    ) -> Self
    where
        F: Fn(ToolContext, A) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        Self {
            definition: ToolDefinition {
                name: name.into(),
                description: description.into(),
                parameters: schema,
            },
            func,
            _args: PhantomData,
        }
    }
}

#[async_trait]
impl<A, R, F, Fut> Tool for FunctionTool<A, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(ToolContext, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    async fn invoke(&self, ctx: &ToolContext, arguments: &str) -> Result<Value> {
        let raw: Value = if arguments.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(arguments).map_err(|e| {
                AgentError::ToolValidation(format!("arguments are not valid JSON: {}", e))
            })?
        };

        schema::validate(&self.definition.parameters, &raw)?;

        let args: A = serde_json::from_value(raw)
            .map_err(|e| AgentError::ToolValidation(e.to_string()))?;

        let output = (self.func)(ctx.clone(), args).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Result of answering one tool call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// Call being answered
    pub call_id: String,

    /// Tool that was called
    pub name: String,

    /// Whether execution succeeded
    pub success: bool,

    /// Serialized result or failure description
    pub output: String,
}

impl ToolOutcome {
    pub fn success(call: &ToolCall, value: &Value) -> Self {
        let output = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            success: true,
            output,
        }
    }

    pub fn failure(call: &ToolCall, error: &AgentError) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            success: false,
            output: format!("Error: {}", error),
        }
    }

    /// Tool-role message carrying this outcome
    pub fn into_message(self) -> Message {
        Message::tool(self.call_id, self.output)
    }
}

/// Registry for available tools, in registration order
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tool
    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> Result<()> {
        self.register_arc(Arc::new(tool))
    }

    /// Register a shared tool
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let definition = tool.definition();

        if definition.name.trim().is_empty() {
            return Err(AgentError::Config("tool name must not be empty".into()));
        }
        if self.index.contains_key(&definition.name) {
            return Err(AgentError::Config(format!(
                "tool '{}' is already registered",
                definition.name
            )));
        }
        schema::ensure_object_schema(&definition.parameters).map_err(|e| {
            AgentError::Config(format!("tool '{}': {}", definition.name, e))
        })?;

        self.index.insert(definition.name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&i| self.tools[i].clone())
    }

    /// Catalog sent to the model
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Get tool names
    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.definition().name).collect()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool call. Never fails: every problem becomes a failure outcome.
    pub async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolOutcome {
        let Some(tool) = self.get(&call.name) else {
            tracing::warn!(tool = %call.name, call_id = %call.id, "Model called an unknown tool");
            return ToolOutcome::failure(call, &AgentError::ToolNotFound(call.name.clone()));
        };

        tracing::debug!(tool = %call.name, call_id = %call.id, "Executing tool");

        let ctx = ToolContext::new(call.id.clone(), cancel.child_token());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = tool.invoke(&ctx, &call.arguments) => result,
        };

        match result {
            Ok(value) => ToolOutcome::success(call, &value),
            Err(e) => {
                tracing::warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool call failed");
                ToolOutcome::failure(call, &e)
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("tools", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ObjectSchema, ParameterSchema};
    use serde_json::json;

    #[derive(Deserialize)]
    struct EchoArgs {
        text: String,
    }

    fn echo_tool() -> impl Tool {
        FunctionTool::new(
            "echo",
            "Echo the text back",
            ObjectSchema::new(vec![ParameterSchema::string("text", "Text to echo")]).compile(),
            |_ctx: ToolContext, args: EchoArgs| async move { Ok(args.text) },
        )
    }

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall::new("call_1", name, args)
    }

    #[tokio::test]
    async fn test_execute_success() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();

        let outcome = registry
            .execute(&call("echo", r#"{"text":"hi"}"#), &CancellationToken::new())
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.output, "hi");

        let message = outcome.into_message();
        assert_eq!(message.tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn test_decode_failure_is_an_outcome() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();

        let outcome = registry
            .execute(&call("echo", r#"{"text": 5}"#), &CancellationToken::new())
            .await;
        assert!(!outcome.success);
        assert!(outcome.output.starts_with("Error: Tool validation error"));

        let outcome = registry.execute(&call("echo", "{oops"), &CancellationToken::new()).await;
        assert!(outcome.output.contains("not valid JSON"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let outcome = registry.execute(&call("missing", "{}"), &CancellationToken::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.output, "Error: Tool not found: missing");
    }

    #[tokio::test]
    async fn test_tool_error_is_an_outcome() {
        let failing = FunctionTool::new(
            "fail",
            "Always fails",
            json!({"type": "object"}),
            |_ctx: ToolContext, _args: Value| async move {
                Err::<Value, _>(AgentError::ToolExecution("internal error! PLEASE TRY AGAIN".into()))
            },
        );
        let mut registry = ToolRegistry::new();
        registry.register(failing).unwrap();

        let outcome = registry.execute(&call("fail", "{}"), &CancellationToken::new()).await;
        assert!(!outcome.success);
        assert!(outcome.output.contains("PLEASE TRY AGAIN"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();
        let err = registry.register(echo_tool()).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_non_object_schema_rejected() {
        let tool = FunctionTool::new(
            "bad",
            "Bad schema",
            json!({"type": "string"}),
            |_ctx: ToolContext, args: String| async move { Ok(args) },
        );
        let mut registry = ToolRegistry::new();
        assert!(matches!(registry.register(tool), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_definitions_keep_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_tool()).unwrap();
        registry
            .register(FunctionTool::new(
                "noop",
                "Does nothing",
                json!({"type": "object"}),
                |_ctx: ToolContext, _args: Value| async move { Ok(()) },
            ))
            .unwrap();

        let names: Vec<_> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["echo", "noop"]);
        assert!(registry.get("noop").is_some());
        assert!(registry.get("unknown").is_none());
    }
}
