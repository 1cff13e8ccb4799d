//! Cost calculation from four-category token usage.
//!
//! Rates are USD per million tokens, which is numerically the same as
//! micro-USD per token. Costs are therefore computed directly in micro-dollars
//! and kept as integers so aggregation never drifts.

use crate::models::{HAIKU_MODEL_ID, SONNET_MODEL_ID};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CostError {
    #[error("no pricing configured for model '{0}'")]
    UnknownModel(String),
    #[error("negative {category} token count: {value}")]
    NegativeTokens { category: &'static str, value: i64 },
    #[error("invalid {category} rate for model '{model}': {rate}")]
    InvalidRate {
        model: String,
        category: &'static str,
        rate: f64,
    },
    #[error("invalid amount: {0}")]
    InvalidAmount(f64),
}

impl From<CostError> for crate::error::AnalysisError {
    fn from(err: CostError) -> Self {
        crate::error::AnalysisError::Unknown(err.to_string())
    }
}

/// Monetary amount in whole micro-USD (six decimal places).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "f64", try_from = "f64")]
pub struct Money(u64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_micros(micros: u64) -> Self {
        Money(micros)
    }

    pub const fn micros(&self) -> u64 {
        self.0
    }

    pub fn as_usd(&self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Convert a USD amount, rounding to the nearest micro-dollar.
    pub fn from_usd(usd: f64) -> Result<Self, CostError> {
        if !usd.is_finite() || usd < 0.0 {
            return Err(CostError::InvalidAmount(usd));
        }
        Ok(Money((usd * 1_000_000.0).round() as u64))
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        *self = *self + rhs;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl From<Money> for f64 {
    fn from(money: Money) -> f64 {
        money.as_usd()
    }
}

impl TryFrom<f64> for Money {
    type Error = CostError;

    fn try_from(usd: f64) -> Result<Self, Self::Error> {
        Money::from_usd(usd)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:06}", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// Token counts for the four independently priced categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
}

impl TokenUsage {
    pub const ZERO: TokenUsage = TokenUsage {
        input: 0,
        output: 0,
        cache_read: 0,
        cache_write: 0,
    };

    /// Build from raw provider counts, rejecting negatives instead of clamping.
    pub fn from_signed(
        input: i64,
        output: i64,
        cache_read: i64,
        cache_write: i64,
    ) -> Result<Self, CostError> {
        fn check(category: &'static str, value: i64) -> Result<u64, CostError> {
            u64::try_from(value).map_err(|_| CostError::NegativeTokens { category, value })
        }
        Ok(Self {
            input: check("input", input)?,
            output: check("output", output)?,
            cache_read: check("cache_read", cache_read)?,
            cache_write: check("cache_write", cache_write)?,
        })
    }

    pub fn total(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.cache_read)
            .saturating_add(self.cache_write)
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input: self.input.saturating_add(rhs.input),
            output: self.output.saturating_add(rhs.output),
            cache_read: self.cache_read.saturating_add(rhs.cache_read),
            cache_write: self.cache_write.saturating_add(rhs.cache_write),
        }
    }
}

/// Per-model rates in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

impl ModelPricing {
    fn rates(&self) -> [(&'static str, f64); 4] {
        [
            ("input", self.input),
            ("output", self.output),
            ("cache_read", self.cache_read),
            ("cache_write", self.cache_write),
        ]
    }
}

/// Pricing table keyed by model identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTable(BTreeMap<String, ModelPricing>);

impl Default for PriceTable {
    fn default() -> Self {
        let mut table = BTreeMap::new();
        table.insert(
            SONNET_MODEL_ID.to_string(),
            ModelPricing {
                input: 3.00,
                output: 15.00,
                cache_read: 0.30,
                cache_write: 3.75,
            },
        );
        table.insert(
            HAIKU_MODEL_ID.to_string(),
            ModelPricing {
                input: 1.00,
                output: 5.00,
                cache_read: 0.10,
                cache_write: 1.25,
            },
        );
        Self(table)
    }
}

impl PriceTable {
    pub fn new(entries: BTreeMap<String, ModelPricing>) -> Self {
        Self(entries)
    }

    pub fn insert(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.0.insert(model.into(), pricing);
    }

    pub fn get(&self, model: &str) -> Result<&ModelPricing, CostError> {
        self.0
            .get(model)
            .ok_or_else(|| CostError::UnknownModel(model.to_string()))
    }

    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Every rate must be finite and non-negative.
    pub fn validate(&self) -> Result<(), CostError> {
        for (model, pricing) in &self.0 {
            for (category, rate) in pricing.rates() {
                if !rate.is_finite() || rate < 0.0 {
                    return Err(CostError::InvalidRate {
                        model: model.clone(),
                        category,
                        rate,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn cost(&self, usage: &TokenUsage, model: &str) -> Result<Money, CostError> {
        Ok(cost(usage, self.get(model)?))
    }

    pub fn prompt_cache_savings(&self, usage: &TokenUsage, model: &str) -> Result<Money, CostError> {
        Ok(prompt_cache_savings(usage, self.get(model)?))
    }
}

/// `round(Σ tokens[c] * rate[c])` micro-dollars.
pub fn cost(usage: &TokenUsage, pricing: &ModelPricing) -> Money {
    let micros = usage.input as f64 * pricing.input
        + usage.output as f64 * pricing.output
        + usage.cache_read as f64 * pricing.cache_read
        + usage.cache_write as f64 * pricing.cache_write;
    Money(micros.max(0.0).round() as u64)
}

/// What the cache-read tokens would have cost at the full input rate, minus
/// what they did cost.
pub fn prompt_cache_savings(usage: &TokenUsage, pricing: &ModelPricing) -> Money {
    let discount = (pricing.input - pricing.cache_read).max(0.0);
    Money((usage.cache_read as f64 * discount).round() as u64)
}
