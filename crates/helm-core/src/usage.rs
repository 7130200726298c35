use serde::{Deserialize, Serialize};

/// Per-call token usage as reported by the provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_creation_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
        self.cache_creation_tokens = self
            .cache_creation_tokens
            .saturating_add(other.cache_creation_tokens);
    }

    pub fn total(&self) -> u64 {
        self.input_tokens as u64
            + self.output_tokens as u64
            + self.cache_read_tokens as u64
            + self.cache_creation_tokens as u64
    }
}

/// USD per million tokens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    #[serde(default)]
    pub cache_read_per_mtok: f64,
    #[serde(default)]
    pub cache_write_per_mtok: f64,
}

impl Pricing {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
            cache_read_per_mtok: 0.0,
            cache_write_per_mtok: 0.0,
        }
    }

    /// Dollar cost of `usage`. Never negative.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        let per = |tokens: u32, rate: f64| tokens as f64 * rate.max(0.0) / 1_000_000.0;
        per(usage.input_tokens, self.input_per_mtok)
            + per(usage.output_tokens, self.output_per_mtok)
            + per(usage.cache_read_tokens, self.cache_read_per_mtok)
            + per(usage.cache_creation_tokens, self.cache_write_per_mtok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_per_million() {
        let p = Pricing::new(3.0, 15.0);
        let u = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            ..Default::default()
        };
        assert!((p.cost(&u) - 4.5).abs() < 1e-9);
    }

    #[test]
    fn zero_pricing_is_free() {
        let u = TokenUsage {
            input_tokens: 500,
            output_tokens: 500,
            ..Default::default()
        };
        assert_eq!(Pricing::default().cost(&u), 0.0);
    }

    #[test]
    fn add_saturates() {
        let mut a = TokenUsage {
            input_tokens: u32::MAX,
            ..Default::default()
        };
        a.add(&TokenUsage {
            input_tokens: 10,
            output_tokens: 2,
            ..Default::default()
        });
        assert_eq!(a.input_tokens, u32::MAX);
        assert_eq!(a.output_tokens, 2);
    }
}
