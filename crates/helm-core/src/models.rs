use serde::{Deserialize, Serialize};

/// Which model slot a selection applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Drives the main conversation.
    Large,
    /// Used for summarisation and other cheap side calls.
    Small,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Large => "large",
            Self::Small => "small",
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectedModel {
    pub provider: String,
    pub model: String,
}

impl SelectedModel {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse `provider/model`. A bare model name gets `default_provider`.
    pub fn parse(spec: &str, default_provider: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return None;
        }
        match spec.split_once('/') {
            Some((p, m)) if !p.is_empty() && !m.is_empty() => Some(Self::new(p, m)),
            Some(_) => None,
            None => Some(Self::new(default_provider, spec)),
        }
    }
}

impl std::fmt::Display for SelectedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_and_without_provider() {
        assert_eq!(
            SelectedModel::parse("openrouter/anthropic/claude", "openai"),
            Some(SelectedModel::new("openrouter", "anthropic/claude"))
        );
        assert_eq!(
            SelectedModel::parse("gpt-4o", "openai"),
            Some(SelectedModel::new("openai", "gpt-4o"))
        );
        assert_eq!(SelectedModel::parse("  ", "openai"), None);
        assert_eq!(SelectedModel::parse("/x", "openai"), None);
    }

    #[test]
    fn model_type_serde() {
        assert_eq!(serde_json::to_string(&ModelType::Large).unwrap(), r#""large""#);
        let t: ModelType = serde_json::from_str(r#""small""#).unwrap();
        assert_eq!(t, ModelType::Small);
    }
}
