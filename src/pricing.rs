//! Model pricing table and cost calculation.
//!
//! All rates are USD per million tokens. Costs are advisory: they can always be
//! recomputed from the stored token counts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::usage::TokenUsage;

const TOKENS_PER_UNIT: f64 = 1_000_000.0;

/// Per-model rates in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PricingRow {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
}

impl PricingRow {
    pub const fn new(input: f64, output: f64, cache_write: f64, cache_read: f64) -> Self {
        Self {
            input,
            output,
            cache_write,
            cache_read,
        }
    }
}

/// Itemized cost of one usage record, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub cache_write: f64,
    pub cache_read: f64,
    pub total: f64,
}

impl CostBreakdown {
    /// Display strings for every item, in the same order as the fields.
    pub fn formatted(&self) -> FormattedCosts {
        FormattedCosts {
            input: format_cost(self.input),
            output: format_cost(self.output),
            cache_write: format_cost(self.cache_write),
            cache_read: format_cost(self.cache_read),
            total: format_cost(self.total),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedCosts {
    pub input: String,
    pub output: String,
    pub cache_write: String,
    pub cache_read: String,
    pub total: String,
}

/// What prompt caching saved compared to paying the plain input rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheSavings {
    pub normal_cost: f64,
    pub cache_cost: f64,
    pub savings: f64,
    pub savings_percent: f64,
}

impl CacheSavings {
    pub fn formatted_percent(&self) -> String {
        format!("{:.1}%", self.savings_percent)
    }
}

/// Immutable pricing table keyed by exact model id, with a fallback row.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingTable {
    models: HashMap<String, PricingRow>,
    default: PricingRow,
}

impl PricingTable {
    pub fn new(models: HashMap<String, PricingRow>, default: PricingRow) -> Self {
        Self { models, default }
    }

    /// The built-in table used when the config has no `[pricing]` section.
    pub fn builtin() -> Self {
        let sonnet = PricingRow::new(3.00, 15.00, 3.75, 0.30);
        let opus = PricingRow::new(15.00, 75.00, 18.75, 1.50);
        let haiku = PricingRow::new(0.25, 1.25, 0.30, 0.03);

        let models = [
            ("claude-3-5-sonnet-20241022", sonnet),
            ("claude-sonnet-4-20250514", sonnet),
            ("claude-3-sonnet-20240229", sonnet),
            ("claude-opus-4-20250514", opus),
            ("claude-opus-4-1-20250805", opus),
            ("claude-3-opus-20240229", opus),
            ("claude-3-5-haiku-20241022", haiku),
            ("claude-3-haiku-20240307", haiku),
        ]
        .into_iter()
        .map(|(name, row)| (name.to_string(), row))
        .collect();

        Self::new(models, sonnet)
    }

    /// Rates for `model`, falling back to the default row for unknown ids.
    pub fn get(&self, model: &str) -> PricingRow {
        self.models.get(model).copied().unwrap_or(self.default)
    }

    pub fn default_row(&self) -> PricingRow {
        self.default
    }

    /// All explicitly priced models, sorted by id.
    pub fn models(&self) -> Vec<(&str, PricingRow)> {
        let mut rows: Vec<(&str, PricingRow)> = self
            .models
            .iter()
            .map(|(name, row)| (name.as_str(), *row))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));
        rows
    }

    /// Cost of one usage record priced by its own model id.
    pub fn cost(&self, usage: &TokenUsage) -> CostBreakdown {
        calculate_cost(usage, &self.get(&usage.model))
    }

    pub fn cache_savings(&self, usage: &TokenUsage) -> CacheSavings {
        calculate_cache_savings(usage, &self.get(&usage.model))
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn per_million(tokens: u64, rate: f64) -> f64 {
    tokens as f64 / TOKENS_PER_UNIT * rate
}

/// Price a usage record against an explicit row.
pub fn calculate_cost(usage: &TokenUsage, row: &PricingRow) -> CostBreakdown {
    let input = per_million(usage.input_tokens, row.input);
    let output = per_million(usage.output_tokens, row.output);
    let cache_write = per_million(usage.cache_creation_input_tokens, row.cache_write);
    let cache_read = per_million(usage.cache_read_input_tokens, row.cache_read);

    CostBreakdown {
        input,
        output,
        cache_write,
        cache_read,
        total: input + output + cache_write + cache_read,
    }
}

pub fn calculate_cache_savings(usage: &TokenUsage, row: &PricingRow) -> CacheSavings {
    let normal_cost = per_million(usage.cache_read_input_tokens, row.input);
    let cache_cost = per_million(usage.cache_read_input_tokens, row.cache_read);
    let savings = normal_cost - cache_cost;
    let savings_percent = if normal_cost > 0.0 {
        savings / normal_cost * 100.0
    } else {
        0.0
    };

    CacheSavings {
        normal_cost,
        cache_cost,
        savings,
        savings_percent,
    }
}

/// Format a USD amount: 2 decimals from $1, 4 decimals from $0.001, else 6.
pub fn format_cost(cost: f64) -> String {
    if cost >= 1.0 {
        format!("${:.2}", cost)
    } else if cost >= 0.001 {
        format!("${:.4}", cost)
    } else {
        format!("${:.6}", cost)
    }
}
