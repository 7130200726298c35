//! Provider-specific request extensions.
//!
//! Options travel as a JSON object keyed by provider name. Each name maps to
//! one typed variant through [`decode`]; the JSON itself never carries a type
//! tag.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProviderOptionsError {
    #[error("no options registered for provider '{0}'")]
    UnknownProvider(String),
    #[error("invalid options for provider '{provider}': {detail}")]
    Invalid { provider: String, detail: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenAiOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenRouterOptions {
    /// Upstream providers to try, in order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub provider_order: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderOptions {
    OpenAi(OpenAiOptions),
    OpenRouter(OpenRouterOptions),
}

type Decoder = fn(serde_json::Value) -> Result<ProviderOptions, serde_json::Error>;

const REGISTRY: &[(&str, Decoder)] = &[
    ("openai", |v| serde_json::from_value(v).map(ProviderOptions::OpenAi)),
    ("openrouter", |v| {
        serde_json::from_value(v).map(ProviderOptions::OpenRouter)
    }),
];

/// Decode the options object for `provider`.
pub fn decode(provider: &str, value: serde_json::Value) -> Result<ProviderOptions, ProviderOptionsError> {
    let (_, decoder) = REGISTRY
        .iter()
        .find(|(name, _)| *name == provider)
        .ok_or_else(|| ProviderOptionsError::UnknownProvider(provider.to_string()))?;
    decoder(value).map_err(|e| ProviderOptionsError::Invalid {
        provider: provider.to_string(),
        detail: e.to_string(),
    })
}

/// Provider names that accept options.
pub fn known_providers() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

impl ProviderOptions {
    pub fn provider(&self) -> &'static str {
        match self {
            Self::OpenAi(_) => "openai",
            Self::OpenRouter(_) => "openrouter",
        }
    }

    /// Re-encode without a type tag.
    pub fn to_value(&self) -> serde_json::Value {
        let encoded = match self {
            Self::OpenAi(o) => serde_json::to_value(o),
            Self::OpenRouter(o) => serde_json::to_value(o),
        };
        encoded.unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_by_provider_name() {
        let opts = decode("openai", json!({"reasoning_effort": "high"})).unwrap();
        assert_eq!(
            opts,
            ProviderOptions::OpenAi(OpenAiOptions {
                reasoning_effort: Some(ReasoningEffort::High),
                parallel_tool_calls: None,
            })
        );
        assert_eq!(opts.provider(), "openai");
    }

    #[test]
    fn same_json_decodes_differently_per_provider() {
        let v = json!({"transforms": ["middle-out"]});
        assert!(decode("openrouter", v.clone()).is_ok());
        assert!(matches!(
            decode("openai", v),
            Err(ProviderOptionsError::Invalid { .. })
        ));
    }

    #[test]
    fn unknown_provider_rejected() {
        assert_eq!(
            decode("acme", json!({})),
            Err(ProviderOptionsError::UnknownProvider("acme".into()))
        );
    }

    #[test]
    fn to_value_has_no_tag() {
        let opts = decode("openrouter", json!({"provider_order": ["a", "b"]})).unwrap();
        assert_eq!(opts.to_value(), json!({"provider_order": ["a", "b"]}));
        assert_eq!(known_providers().count(), 2);
    }
}
