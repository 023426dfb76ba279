//! Application State

use agent_core::Agent;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Agent serving every request; clones share provider and tools
    pub agent: Agent,
}

impl AppState {
    pub fn new(agent: Agent) -> Self {
        Self { agent }
    }
}
