//! # agent-runtime
//!
//! Runtime providers for the agent system.
//!
//! ## Providers
//!
//! - **Ollama** (default): Local LLM inference via the native Ollama API
//! - **OpenAI-compatible** (default): OpenAI, Gemini and any backend that
//!   speaks `/chat/completions`
//! - **Anthropic** (default): Claude models over the native Messages API
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::OllamaProvider;
//!
//! let provider = OllamaProvider::new("http://localhost", 11434)?
//!     .with_model(Model::new("qwen2.5:latest"));
//! let agent = Agent::builder()
//!     .provider(Arc::new(provider))
//!     .build()?;
//! ```

mod http;

#[cfg(feature = "anthropic")]
pub mod anthropic;

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "anthropic")]
pub use anthropic::{AnthropicConfig, AnthropicProvider};

#[cfg(feature = "ollama")]
pub use ollama::{OllamaConfig, OllamaEmbedder, OllamaProvider};

#[cfg(feature = "openai")]
pub use openai::{OpenAiConfig, OpenAiEmbedder, OpenAiProvider};

// Re-export core types for convenience
pub use agent_core::{
    Agent, AgentError, Message, Model, Provider, Result, Role, Tool, ToolRegistry,
};
