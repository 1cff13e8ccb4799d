use super::{AnalysisCache, AnalysisRecord, CacheKey, CostLedger, DiagnosticsLog, StoreFuture};
use crate::diagnostics::{DiagnosticEntry, DiagnosticsFilter, DiagnosticsPage, MAX_DIAGNOSTICS};
use crate::ledger::CostLogEntry;
use std::sync::{Mutex, MutexGuard};

/// In-process store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    records: Vec<AnalysisRecord>,
    costs: Vec<CostLogEntry>,
    diagnostics: Vec<DiagnosticEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every record ever stored, in write order.
    pub fn records(&self) -> Vec<AnalysisRecord> {
        self.inner().records.clone()
    }
}

impl AnalysisCache for MemoryStore {
    fn lookup<'a>(&'a self, key: &'a CacheKey) -> StoreFuture<'a, Option<AnalysisRecord>> {
        let found = self
            .inner()
            .records
            .iter()
            .filter(|r| r.item_id == key.item_id && r.profile_version == key.profile_version && r.mode == key.mode)
            .fold(None::<&AnalysisRecord>, |best, r| match best {
                Some(current) if !r.supersedes(current) => Some(current),
                _ => Some(r),
            })
            .cloned();
        Box::pin(async move { Ok(found) })
    }

    fn store<'a>(&'a self, record: AnalysisRecord) -> StoreFuture<'a, ()> {
        self.inner().records.push(record);
        Box::pin(async { Ok(()) })
    }
}

impl CostLedger for MemoryStore {
    fn append_cost<'a>(&'a self, entry: CostLogEntry) -> StoreFuture<'a, ()> {
        self.inner().costs.push(entry);
        Box::pin(async { Ok(()) })
    }

    fn cost_entries<'a>(&'a self, session_id: Option<&'a str>) -> StoreFuture<'a, Vec<CostLogEntry>> {
        let entries: Vec<CostLogEntry> = self
            .inner()
            .costs
            .iter()
            .filter(|e| session_id.is_none_or(|s| e.session_id == s))
            .cloned()
            .collect();
        Box::pin(async move { Ok(entries) })
    }
}

impl DiagnosticsLog for MemoryStore {
    fn append_diagnostics<'a>(&'a self, entries: Vec<DiagnosticEntry>) -> StoreFuture<'a, ()> {
        let mut inner = self.inner();
        inner.diagnostics.extend(entries);
        let len = inner.diagnostics.len();
        if len > MAX_DIAGNOSTICS {
            inner.diagnostics.drain(0..len - MAX_DIAGNOSTICS);
        }
        Box::pin(async { Ok(()) })
    }

    fn recent_diagnostics<'a>(&'a self, filter: DiagnosticsFilter) -> StoreFuture<'a, DiagnosticsPage> {
        let page = filter.apply(self.inner().diagnostics.iter());
        Box::pin(async move { Ok(page) })
    }
}
