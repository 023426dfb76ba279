//! Error Types

use std::time::Duration;

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Coarse classification of an [`AgentError`].
///
/// Lets callers tell "the backend rejected the request" apart from
/// "the network hung" or "the run ran out of budget".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Provider,
    Tool,
    Timeout,
    Exhausted,
    Cancelled,
    Protocol,
    Retrieval,
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "CONFIGURATION",
            ErrorKind::Provider => "PROVIDER",
            ErrorKind::Tool => "TOOL",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Exhausted => "EXHAUSTED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::Retrieval => "RETRIEVAL",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration error (missing provider, unbound model, duplicate tool)
    #[error("Configuration error: {0}")]
    Config(String),

    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Rate limited
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Tool not found in registry
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool arguments did not match the tool's schema
    #[error("Tool validation error: {0}")]
    ToolValidation(String),

    /// Tool execution failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// A streamed turn did not complete before its deadline
    #[error("Provider turn timed out after {0:?}")]
    Timeout(Duration),

    /// The stop condition was still unsatisfied at the step cap
    #[error("Step limit reached: stop condition unsatisfied after {steps} steps")]
    Exhausted { steps: usize },

    /// The caller cancelled the run
    #[error("Run cancelled")]
    Cancelled,

    /// Conversation violates the tool-call/tool-reply protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Vector store failure
    #[error("Vector store error: {0}")]
    VectorStore(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Config(_) => ErrorKind::Configuration,
            AgentError::Provider(_)
            | AgentError::ProviderUnavailable(_)
            | AgentError::RateLimited(_)
            | AgentError::Auth(_) => ErrorKind::Provider,
            AgentError::ToolNotFound(_)
            | AgentError::ToolValidation(_)
            | AgentError::ToolExecution(_) => ErrorKind::Tool,
            AgentError::Timeout(_) => ErrorKind::Timeout,
            AgentError::Exhausted { .. } => ErrorKind::Exhausted,
            AgentError::Cancelled => ErrorKind::Cancelled,
            AgentError::Protocol(_) => ErrorKind::Protocol,
            AgentError::VectorStore(_) => ErrorKind::Retrieval,
            AgentError::Io(_) | AgentError::Json(_) | AgentError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Check if retrying the whole run may help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::ProviderUnavailable(_)
                | AgentError::RateLimited(_)
                | AgentError::Timeout(_)
                | AgentError::Io(_)
        )
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Provider(msg) => format!("The AI service encountered an error: {}", msg),
            AgentError::ProviderUnavailable(_) => "The AI service is currently unavailable. Please try again.".into(),
            AgentError::ToolNotFound(name) => format!("The tool '{}' is not available.", name),
            AgentError::ToolValidation(msg) => format!("Invalid tool input: {}", msg),
            AgentError::ToolExecution(msg) => format!("Tool error: {}", msg),
            AgentError::Timeout(_) => "The AI service took too long to respond. Please try again.".into(),
            AgentError::Exhausted { .. } => "The request took too many steps to process. Please try a simpler query.".into(),
            AgentError::Cancelled => "The request was cancelled.".into(),
            AgentError::RateLimited(_) => "You've made too many requests. Please wait a moment.".into(),
            AgentError::Auth(_) => "Authentication failed. Please check your credentials.".into(),
            AgentError::Config(msg) => format!("The agent is misconfigured: {}", msg),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        AgentError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct() {
        assert_eq!(AgentError::Timeout(Duration::from_secs(30)).kind(), ErrorKind::Timeout);
        assert_eq!(AgentError::Exhausted { steps: 3 }.kind(), ErrorKind::Exhausted);
        assert_eq!(AgentError::Auth("bad key".into()).kind(), ErrorKind::Provider);
        assert_eq!(AgentError::Config("no model".into()).kind(), ErrorKind::Configuration);
        assert_ne!(ErrorKind::Timeout.code(), ErrorKind::Provider.code());
    }

    #[test]
    fn test_retryable() {
        assert!(AgentError::RateLimited("slow down".into()).is_retryable());
        assert!(AgentError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!AgentError::Exhausted { steps: 10 }.is_retryable());
        assert!(!AgentError::Auth("nope".into()).is_retryable());
    }

    #[test]
    fn test_exhausted_message() {
        let err = AgentError::Exhausted { steps: 4 };
        assert!(err.to_string().contains("Step limit reached"));
        assert!(err.user_message().contains("too many steps"));
    }
}
