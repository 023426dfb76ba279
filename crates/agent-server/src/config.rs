//! Server Configuration
//!
//! Everything is read from the environment (after `.env` is loaded).

use std::sync::Arc;

use agent_core::{AgentConfig, Model, Provider};
use agent_runtime::{
    AnthropicConfig, AnthropicProvider, OllamaConfig, OllamaProvider, OpenAiConfig, OpenAiProvider,
};
use anyhow::{Context, bail};

/// Which backend serves the agent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    Ollama,
    OpenAi,
    Gemini,
    Anthropic,
}

impl ProviderKind {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            "gemini" => Ok(Self::Gemini),
            "anthropic" => Ok(Self::Anthropic),
            other => bail!(
                "unknown AGENT_PROVIDER '{}' (expected ollama, openai, gemini or anthropic)",
                other
            ),
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            Self::Ollama => "qwen2.5:latest",
            Self::OpenAi => "gpt-4o-mini",
            Self::Gemini => "gemini-2.0-flash",
            Self::Anthropic => "claude-3-5-sonnet-latest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub bind_addr: String,
    pub agent: AgentConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let provider = match lookup("AGENT_PROVIDER") {
            Some(value) => ProviderKind::parse(&value)?,
            None => ProviderKind::Ollama,
        };
        let model = lookup("AGENT_MODEL")
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| provider.default_model().into());
        let bind_addr = lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".into());

        let agent = AgentConfig::from_lookup(&lookup).context("invalid agent configuration")?;

        Ok(Self {
            provider,
            model,
            bind_addr,
            agent,
        })
    }

    /// Construct the configured provider with its model bound
    pub fn build_provider(&self) -> anyhow::Result<Arc<dyn Provider>> {
        let model = Model::new(self.model.clone());

        let provider: Arc<dyn Provider> = match self.provider {
            ProviderKind::Ollama => Arc::new(
                OllamaProvider::from_config(OllamaConfig::from_env())?.with_model(model),
            ),
            ProviderKind::OpenAi => Arc::new(
                OpenAiProvider::new(OpenAiConfig::from_env()?)?.with_model(model),
            ),
            ProviderKind::Gemini => {
                let key = std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY is not set")?;
                Arc::new(OpenAiProvider::gemini(key)?.with_model(model))
            }
            ProviderKind::Anthropic => Arc::new(
                AnthropicProvider::new(AnthropicConfig::from_env()?)?.with_model(model),
            ),
        };
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.provider, ProviderKind::Ollama);
        assert_eq!(config.model, "qwen2.5:latest");
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
    }

    #[test]
    fn test_provider_selection() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("AGENT_PROVIDER", "Gemini"),
            ("BIND_ADDR", "127.0.0.1:8080"),
        ]))
        .unwrap();
        assert_eq!(config.provider, ProviderKind::Gemini);
        assert_eq!(config.model, "gemini-2.0-flash");
        assert_eq!(config.bind_addr, "127.0.0.1:8080");

        let config = ServerConfig::from_lookup(lookup(&[
            ("AGENT_PROVIDER", "openai"),
            ("AGENT_MODEL", "gpt-4o"),
        ]))
        .unwrap();
        assert_eq!(config.model, "gpt-4o");
    }

    #[test]
    fn test_agent_settings() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("AGENT_MAX_STEPS", "3"),
            ("AGENT_TURN_TIMEOUT_SECS", "90"),
        ]))
        .unwrap();
        assert_eq!(config.agent.max_steps, 3);
        assert_eq!(config.agent.turn_timeout_secs, 90);

        let err = ServerConfig::from_lookup(lookup(&[("AGENT_MAX_STEPS", "lots")])).unwrap_err();
        assert!(format!("{err:#}").contains("AGENT_MAX_STEPS"));
    }

    #[test]
    fn test_anthropic_selection() {
        let config = ServerConfig::from_lookup(lookup(&[("AGENT_PROVIDER", "anthropic")])).unwrap();
        assert_eq!(config.provider, ProviderKind::Anthropic);
        assert_eq!(config.model, "claude-3-5-sonnet-latest");
    }

    #[test]
    fn test_unknown_provider() {
        assert!(ServerConfig::from_lookup(lookup(&[("AGENT_PROVIDER", "bedrock")])).is_err());
    }
}
