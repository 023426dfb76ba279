//! # agent-core
//!
//! Provider-agnostic agent run loop with typed tool calling, streaming and
//! retrieval.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Agent                              │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────────┐  │
//! │  │  Reasoning  │  │    Tools    │  │      Provider        │  │
//! │  │    Loop     │──│   Registry  │──│     (Strategy)       │  │
//! │  └──────┬──────┘  └─────────────┘  └──────────────────────┘  │
//! │         │         ┌─────────────┐  ┌──────────────────────┐  │
//! │         └─────────│    Stop     │  │  Retrieval Hook      │  │
//! │                   │  Condition  │  │  (VectorStore)       │  │
//! │                   └─────────────┘  └──────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`Provider`] trait enables swapping between Ollama, OpenAI-compatible
//! backends or a scripted provider without changing agent logic.

pub mod builtin;
pub mod error;
pub mod message;
pub mod mock;
pub mod provider;
pub mod reasoning;
pub mod retrieval;
pub mod schema;
pub mod stop;
pub mod stream;
pub mod tool;

pub use error::{AgentError, ErrorKind, Result};
pub use message::{Conversation, Message, Role, ToolCall};
pub use provider::{GenerateOptions, Model, Provider, ProviderStream, ToolDefinition};
pub use reasoning::{Agent, AgentBuilder, AgentConfig, AgentResult, RunInput};
pub use retrieval::{Embedder, InMemoryVectorStore, RetrievalHook, VectorStore};
pub use stop::StopCondition;
pub use stream::StreamResult;
pub use tool::{FunctionTool, Tool, ToolContext, ToolOutcome, ToolRegistry};
