//! Cost ledger entries and their aggregation into reports.

use crate::cost::{Money, TokenUsage};
use crate::models::Mode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One line of the cost ledger, written once per completed `analyze` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLogEntry {
    pub session_id: String,
    pub model: String,
    pub mode: Mode,
    pub tokens: TokenUsage,
    /// Spend attributable to this call. Zero when served from a cache.
    pub cost: Money,
    /// Served from the local analysis cache (or joined an in-flight call).
    pub cached: bool,
    /// What the reused analysis originally cost.
    #[serde(default)]
    pub avoided_cost: Money,
    /// Saved by provider-side prompt cache reads on this call.
    #[serde(default)]
    pub prompt_cache_savings: Money,
    pub created_at: DateTime<Utc>,
}

/// Cost breakdown for one client session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionCosts {
    pub session_id: String,
    pub total_cost: Money,
    pub per_model: BTreeMap<String, Money>,
    pub per_mode: BTreeMap<String, Money>,
    pub request_count: u64,
    pub cache_hits: u64,
    pub cached_savings: Money,
}

impl SessionCosts {
    pub fn from_entries<'a>(
        session_id: &str,
        entries: impl IntoIterator<Item = &'a CostLogEntry>,
    ) -> Self {
        let mut report = SessionCosts {
            session_id: session_id.to_string(),
            ..Self::default()
        };
        for entry in entries.into_iter().filter(|e| e.session_id == session_id) {
            report.total_cost += entry.cost;
            *report.per_model.entry(entry.model.clone()).or_default() += entry.cost;
            *report
                .per_mode
                .entry(entry.mode.as_str().to_string())
                .or_default() += entry.cost;
            report.request_count += 1;
            if entry.cached {
                report.cache_hits += 1;
            }
            report.cached_savings += entry.avoided_cost + entry.prompt_cache_savings;
        }
        report
    }
}

/// All-time totals across every session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalCosts {
    pub total_cost: Money,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub average_cost_per_request: Money,
}

impl TotalCosts {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a CostLogEntry>) -> Self {
        let mut totals = TotalCosts::default();
        for entry in entries {
            totals.total_cost += entry.cost;
            totals.total_requests += 1;
            totals.total_tokens = totals.total_tokens.saturating_add(entry.tokens.total());
        }
        if totals.total_requests > 0 {
            let avg = (totals.total_cost.micros() as f64 / totals.total_requests as f64).round();
            totals.average_cost_per_request = Money::from_micros(avg as u64);
        }
        totals
    }
}
