//! Persistent analysis cache, cost ledger and diagnostics sink.
//!
//! The cache is append-only: records are never updated in place and there is
//! no deletion API. The "current" record for a key is the most recently
//! created one; older records are kept for audit.
//!
//! Two backends implement the same traits:
//! - [`FileStore`] keeps JSON-lines files under a data directory
//! - [`MemoryStore`] keeps everything in process (tests, `--ephemeral`)

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::cost::{Money, TokenUsage};
use crate::diagnostics::{DiagnosticEntry, DiagnosticsFilter, DiagnosticsPage};
use crate::error::AnalysisError;
use crate::item::ItemId;
use crate::ledger::{CostLogEntry, SessionCosts, TotalCosts};
use crate::models::Mode;
use crate::profile::ProfileVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("timed out waiting for store lock ({0}s)")]
    LockTimeout(u64),
    #[error("store task failed: {0}")]
    Task(String),
}

impl From<StoreError> for AnalysisError {
    fn from(err: StoreError) -> Self {
        AnalysisError::Cache(err.to_string())
    }
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Identity of "the same request": exact match on all three fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub item_id: ItemId,
    /// `None` is the no-profile sentinel.
    pub profile_version: Option<ProfileVersion>,
    pub mode: Mode,
}

impl CacheKey {
    /// `basic` mode always carries the no-profile sentinel.
    pub fn new(item_id: ItemId, profile_version: Option<ProfileVersion>, mode: Mode) -> Self {
        let profile_version = if mode.uses_profile() {
            profile_version
        } else {
            None
        };
        Self {
            item_id,
            profile_version,
            mode,
        }
    }
}

/// Result of one successful inference call. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: Uuid,
    pub item_id: ItemId,
    pub profile_version: Option<ProfileVersion>,
    pub mode: Mode,
    pub model: String,
    pub tokens: TokenUsage,
    pub cost: Money,
    pub result: Value,
    pub created_at: DateTime<Utc>,
}

impl AnalysisRecord {
    pub fn key(&self) -> CacheKey {
        CacheKey {
            item_id: self.item_id.clone(),
            profile_version: self.profile_version.clone(),
            mode: self.mode,
        }
    }

    /// Whether this record should replace `current` as the newest for its key.
    /// Ties go to the later write.
    pub(crate) fn supersedes(&self, current: &AnalysisRecord) -> bool {
        self.created_at >= current.created_at
    }
}

pub trait AnalysisCache: Send + Sync {
    /// Most recently created record for the exact key, if any.
    fn lookup<'a>(&'a self, key: &'a CacheKey) -> StoreFuture<'a, Option<AnalysisRecord>>;

    fn store<'a>(&'a self, record: AnalysisRecord) -> StoreFuture<'a, ()>;
}

pub trait CostLedger: Send + Sync {
    fn append_cost<'a>(&'a self, entry: CostLogEntry) -> StoreFuture<'a, ()>;

    /// Entries in write order, optionally restricted to one session.
    fn cost_entries<'a>(&'a self, session_id: Option<&'a str>) -> StoreFuture<'a, Vec<CostLogEntry>>;

    fn session_costs<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, SessionCosts> {
        Box::pin(async move {
            let entries = self.cost_entries(Some(session_id)).await?;
            Ok(SessionCosts::from_entries(session_id, &entries))
        })
    }

    fn total_costs(&self) -> StoreFuture<'_, TotalCosts> {
        Box::pin(async move {
            let entries = self.cost_entries(None).await?;
            Ok(TotalCosts::from_entries(&entries))
        })
    }
}

pub trait DiagnosticsLog: Send + Sync {
    fn append_diagnostics<'a>(&'a self, entries: Vec<DiagnosticEntry>) -> StoreFuture<'a, ()>;

    fn recent_diagnostics<'a>(&'a self, filter: DiagnosticsFilter) -> StoreFuture<'a, DiagnosticsPage>;
}

/// Everything the orchestrator persists through.
pub trait Store: AnalysisCache + CostLedger + DiagnosticsLog + 'static {}

impl<T> Store for T where T: AnalysisCache + CostLedger + DiagnosticsLog + 'static {}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_key_drops_profile_version() {
        let id = ItemId::from_url("https://shop.example.com/p/1").unwrap();
        let version = ProfileVersion::parse("0123456789abcdef").unwrap();
        let key = CacheKey::new(id.clone(), Some(version.clone()), Mode::Basic);
        assert_eq!(key.profile_version, None);

        let full = CacheKey::new(id, Some(version.clone()), Mode::Full);
        assert_eq!(full.profile_version, Some(version));
    }

    #[test]
    fn test_record_serializes_sentinel_as_null() {
        let rec = test_support::record(
            "https://shop.example.com/p/1",
            None,
            Mode::Basic,
            serde_json::json!({"ok": true}),
        );
        let json = serde_json::to_value(&rec).unwrap();
        assert!(json["profile_version"].is_null());
        assert_eq!(json["mode"], "basic");
    }

    #[test]
    fn test_store_error_maps_to_cache_kind() {
        let err: AnalysisError = StoreError::LockTimeout(5).into();
        assert_eq!(err.kind(), crate::error::ErrorKind::CacheError);
    }
}
