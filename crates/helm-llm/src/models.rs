use helm_core::usage::Pricing;

/// Capabilities and pricing of a known model.
#[derive(Clone, Debug)]
pub struct ModelInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    pub context_window: usize,
    pub max_output: u32,
    pub supports_reasoning: bool,
    pub pricing: Pricing,
}

pub static GPT_4O: ModelInfo = ModelInfo {
    name: "gpt-4o",
    display_name: "GPT-4o",
    context_window: 128_000,
    max_output: 16_384,
    supports_reasoning: false,
    pricing: Pricing {
        input_per_mtok: 2.5,
        output_per_mtok: 10.0,
        cache_read_per_mtok: 1.25,
        cache_write_per_mtok: 0.0,
    },
};

pub static GPT_4O_MINI: ModelInfo = ModelInfo {
    name: "gpt-4o-mini",
    display_name: "GPT-4o mini",
    context_window: 128_000,
    max_output: 16_384,
    supports_reasoning: false,
    pricing: Pricing {
        input_per_mtok: 0.15,
        output_per_mtok: 0.6,
        cache_read_per_mtok: 0.075,
        cache_write_per_mtok: 0.0,
    },
};

pub static GPT_4_1: ModelInfo = ModelInfo {
    name: "gpt-4.1",
    display_name: "GPT-4.1",
    context_window: 1_047_576,
    max_output: 32_768,
    supports_reasoning: false,
    pricing: Pricing {
        input_per_mtok: 2.0,
        output_per_mtok: 8.0,
        cache_read_per_mtok: 0.5,
        cache_write_per_mtok: 0.0,
    },
};

pub static O4_MINI: ModelInfo = ModelInfo {
    name: "o4-mini",
    display_name: "o4-mini",
    context_window: 200_000,
    max_output: 100_000,
    supports_reasoning: true,
    pricing: Pricing {
        input_per_mtok: 1.1,
        output_per_mtok: 4.4,
        cache_read_per_mtok: 0.275,
        cache_write_per_mtok: 0.0,
    },
};

static ALL_MODELS: &[&ModelInfo] = &[&GPT_4O, &GPT_4O_MINI, &GPT_4_1, &O4_MINI];

/// Look up a model by name. Router-style names (`vendor/model`) match on
/// the part after the last slash.
pub fn find_model(name: &str) -> Option<&'static ModelInfo> {
    let bare = name.rsplit('/').next().unwrap_or(name);
    ALL_MODELS.iter().find(|m| m.name == bare).copied()
}

/// Pricing for `name`, zero when unknown.
pub fn pricing_for(name: &str) -> Pricing {
    find_model(name).map(|m| m.pricing).unwrap_or_default()
}

pub fn all_models() -> &'static [&'static ModelInfo] {
    ALL_MODELS
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_core::usage::TokenUsage;

    #[test]
    fn find_known_models() {
        assert!(find_model("gpt-4o").is_some());
        assert!(find_model("openai/gpt-4o-mini").is_some());
        assert!(find_model("nonexistent").is_none());
    }

    #[test]
    fn reasoning_flag() {
        assert!(find_model("o4-mini").unwrap().supports_reasoning);
        assert!(!find_model("gpt-4o").unwrap().supports_reasoning);
    }

    #[test]
    fn cost_calculation() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 500_000,
            cache_read_tokens: 200_000,
            cache_creation_tokens: 0,
        };
        let cost = pricing_for("gpt-4o").cost(&usage);
        let expected = 2.5 + 5.0 + 0.25;
        assert!((cost - expected).abs() < 0.001, "got {cost}, expected {expected}");
    }

    #[test]
    fn unknown_model_is_free() {
        assert_eq!(pricing_for("local-llama"), Pricing::default());
        assert_eq!(all_models().len(), 4);
    }
}
