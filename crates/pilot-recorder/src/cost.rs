use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, input: u64, output: u64) {
        self.input_tokens += input;
        self.output_tokens += output;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// USD per million tokens, `(model prefix, input, output)`. Matched by
/// longest prefix so dated model ids resolve to their family.
const PRICE_TABLE: &[(&str, f64, f64)] = &[
    ("claude-opus", 15.0, 75.0),
    ("claude-sonnet", 3.0, 15.0),
    ("claude-haiku", 0.80, 4.0),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.0),
];

/// Fallback for unknown models: mid-tier pricing beats pretending the run
/// was free.
const DEFAULT_PRICE: (f64, f64) = (3.0, 15.0);

pub fn estimate_cost(model: &str, usage: &TokenUsage) -> f64 {
    let (input_price, output_price) = PRICE_TABLE
        .iter()
        .filter(|(prefix, _, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _, _)| prefix.len())
        .map(|(_, i, o)| (*i, *o))
        .unwrap_or(DEFAULT_PRICE);

    (usage.input_tokens as f64 * input_price + usage.output_tokens as f64 * output_price)
        / 1_000_000.0
}
