//! Inference gateway: the boundary to the AI backend.
//!
//! A gateway assembles the tiered prompt, issues exactly one call, and reports
//! the output together with four-category token usage. It never retries;
//! retry policy belongs to the client.

pub mod anthropic;
pub mod parse;
pub mod prompt;

pub use anthropic::{AnthropicGateway, AnthropicSettings};

use crate::config::Config;
use crate::cost::{CostError, Money, TokenUsage};
use crate::error::AnalysisError;
use crate::item::Item;
use crate::models::Mode;
use crate::profile::Profile;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;

pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AnalysisError>> + Send + 'a>>;

/// Output of one successful inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub raw_output: String,
    /// Parsed JSON analysis, or the parse-failure fallback object.
    pub result: Value,
    pub model: String,
    pub usage: TokenUsage,
}

pub trait InferenceGateway: Send + Sync + 'static {
    /// Short provider name for status reports.
    fn provider(&self) -> &'static str;

    fn run_full<'a>(&'a self, item: &'a Item, profile: &'a Profile) -> GatewayFuture<'a, Completion>;

    fn run_basic<'a>(&'a self, item: &'a Item) -> GatewayFuture<'a, Completion>;

    /// Minimal round trip to verify credentials and reachability.
    fn check_connection(&self) -> GatewayFuture<'_, ()>;

    fn cost(&self, usage: &TokenUsage, model: &str) -> Result<Money, CostError>;

    fn prompt_cache_savings(&self, usage: &TokenUsage, model: &str) -> Result<Money, CostError>;

    fn test_connection(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move { self.check_connection().await.is_ok() })
    }

    /// Dispatch on mode. `full` without a profile is a validation error.
    fn run<'a>(
        &'a self,
        item: &'a Item,
        profile: Option<&'a Profile>,
        mode: Mode,
    ) -> GatewayFuture<'a, Completion> {
        match (mode, profile) {
            (Mode::Full, Some(profile)) => self.run_full(item, profile),
            (Mode::Full, None) => Box::pin(async {
                Err(AnalysisError::Validation(
                    "full analysis requires a profile".to_string(),
                ))
            }),
            (Mode::Basic, _) => self.run_basic(item),
        }
    }
}

/// Configured backends. Closed set; add a variant per provider.
pub enum Backend {
    Anthropic(AnthropicGateway),
}

impl Backend {
    pub fn from_config(config: &Config, api_key: Option<String>) -> Result<Self, AnalysisError> {
        let settings = AnthropicSettings {
            base_url: config.anthropic.base_url.clone(),
            api_key,
            models: config.models.clone(),
            prices: config.pricing.clone(),
            prompt_caching: config.anthropic.prompt_caching,
            timeout_secs: config.anthropic.request_timeout_secs,
        };
        Ok(Backend::Anthropic(AnthropicGateway::new(settings)?))
    }
}

impl InferenceGateway for Backend {
    fn provider(&self) -> &'static str {
        match self {
            Backend::Anthropic(g) => g.provider(),
        }
    }

    fn run_full<'a>(&'a self, item: &'a Item, profile: &'a Profile) -> GatewayFuture<'a, Completion> {
        match self {
            Backend::Anthropic(g) => g.run_full(item, profile),
        }
    }

    fn run_basic<'a>(&'a self, item: &'a Item) -> GatewayFuture<'a, Completion> {
        match self {
            Backend::Anthropic(g) => g.run_basic(item),
        }
    }

    fn check_connection(&self) -> GatewayFuture<'_, ()> {
        match self {
            Backend::Anthropic(g) => g.check_connection(),
        }
    }

    fn cost(&self, usage: &TokenUsage, model: &str) -> Result<Money, CostError> {
        match self {
            Backend::Anthropic(g) => g.cost(usage, model),
        }
    }

    fn prompt_cache_savings(&self, usage: &TokenUsage, model: &str) -> Result<Money, CostError> {
        match self {
            Backend::Anthropic(g) => g.prompt_cache_savings(usage, model),
        }
    }
}
