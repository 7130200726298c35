//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every struct is `#[serde(default)]` so
//! a partial file only overrides what it names.

use std::path::PathBuf;

use helm_core::models::SelectedModel;
use helm_core::provider_options::{self, ProviderOptions};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub models: ModelSettings,
    pub provider: ProviderSettings,
    pub agent: AgentSettings,
    /// Defaults for the built-in task agent used by the "agent" tool.
    pub task_agent: TaskAgentSettings,
    /// Named sub-agents available to the "agent" tool.
    pub subagents: Vec<SubagentSettings>,
    pub retry: RetrySettings,
    pub logging: LoggingSettings,
    /// Where the session database lives. Defaults to `~/.helm`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

impl Settings {
    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => crate::loader::helm_home(),
        }
    }

    /// Decode the options configured for `provider`, if any.
    pub fn provider_options(&self, provider: &str) -> Result<Option<ProviderOptions>> {
        match self.provider.options.get(provider) {
            None => Ok(None),
            Some(value) => provider_options::decode(provider, value.clone())
                .map(Some)
                .map_err(|e| SettingsError::InvalidValue(e.to_string())),
        }
    }

    /// Reject values that would leave the runtime unusable.
    pub fn validate(&self) -> Result<()> {
        if self.agent.max_turns == 0 {
            return Err(SettingsError::InvalidValue("agent.maxTurns must be positive".into()));
        }
        if self.agent.max_parallel_tools == 0 {
            return Err(SettingsError::InvalidValue(
                "agent.maxParallelTools must be positive".into(),
            ));
        }
        for name in self.provider.options.keys() {
            self.provider_options(name)?;
        }
        let mut seen = std::collections::HashSet::new();
        for sub in &self.subagents {
            if sub.name.trim().is_empty() {
                return Err(SettingsError::InvalidValue("subagent with empty name".into()));
            }
            if !seen.insert(sub.name.as_str()) {
                return Err(SettingsError::InvalidValue(format!(
                    "duplicate subagent '{}'",
                    sub.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelSettings {
    pub large: SelectedModel,
    pub small: SelectedModel,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            large: SelectedModel::new("openai", "gpt-4o"),
            small: SelectedModel::new("openai", "gpt-4o-mini"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderSettings {
    /// OpenAI-compatible endpoint root.
    pub base_url: String,
    /// Env var holding the API key.
    pub api_key_env: String,
    /// Provider-specific options keyed by provider name.
    pub options: serde_json::Map<String, serde_json::Value>,
    pub request_timeout_ms: u64,
    /// Abort a stream that produces nothing for this long.
    pub idle_timeout_ms: u64,
    pub max_output_tokens: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            options: serde_json::Map::new(),
            request_timeout_ms: 300_000,
            idle_timeout_ms: 90_000,
            max_output_tokens: 8192,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    pub max_turns: u32,
    pub tool_timeout_ms: u64,
    pub max_parallel_tools: usize,
    /// Tool output beyond this many bytes is truncated.
    pub max_tool_output_bytes: usize,
    pub disable_auto_summarize: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: 50,
            tool_timeout_ms: 120_000,
            max_parallel_tools: 8,
            max_tool_output_bytes: 100_000,
            disable_auto_summarize: false,
            system_prompt: None,
            temperature: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskAgentSettings {
    /// Falls back to the large model when unset.
    pub model: Option<SelectedModel>,
    pub temperature: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub max_turns: Option<u32>,
    pub system_prompt: Option<String>,
}

/// A named sub-agent definition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubagentSettings {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub model: Option<SelectedModel>,
    pub temperature: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    /// Allow-list of tool names. `None` inherits every parent tool.
    pub tools: Option<Vec<String>>,
    pub exclude_tools: Vec<String>,
    pub max_turns: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
