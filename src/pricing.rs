//! Embedded per-model pricing with exact-then-longest-prefix resolution.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

/// Dollar rates per 1,000 tokens.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Error)]
pub enum PricingError {
    #[error("invalid pricing json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("price not found for model: {0}")]
    UnknownModel(String),
}

#[derive(Clone, Debug)]
pub struct PricingTable {
    prices: HashMap<String, ModelPricing>,
    // Longest prefix first, lexicographic on ties, so lookups are deterministic.
    sorted_prefixes: Vec<String>,
}

impl PricingTable {
    pub fn from_json_str(raw: &str) -> Result<Self, PricingError> {
        let prices: HashMap<String, ModelPricing> = serde_json::from_str(raw)?;

        let mut sorted_prefixes: Vec<String> = prices.keys().cloned().collect();
        sorted_prefixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        Ok(Self {
            prices,
            sorted_prefixes,
        })
    }

    pub fn price(&self, model: &str) -> Result<ModelPricing, PricingError> {
        if let Some(price) = self.prices.get(model) {
            return Ok(*price);
        }
        for prefix in &self.sorted_prefixes {
            if model.starts_with(prefix.as_str()) {
                return Ok(self.prices[prefix]);
            }
        }
        Err(PricingError::UnknownModel(model.to_string()))
    }
}
