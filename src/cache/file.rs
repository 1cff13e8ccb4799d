use super::{
    AnalysisCache, AnalysisRecord, CacheKey, CostLedger, DiagnosticsLog, StoreError, StoreFuture,
};
use crate::diagnostics::{DiagnosticEntry, DiagnosticsFilter, DiagnosticsPage, MAX_DIAGNOSTICS};
use crate::ledger::CostLogEntry;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const ANALYSES_FILE: &str = "analyses.jsonl";
const COST_LOG_FILE: &str = "cost_log.jsonl";
const DIAGNOSTICS_FILE: &str = "diagnostics.jsonl";
const LOCK_FILE: &str = ".lock";
const STORE_LOCK_TIMEOUT_SECS: u64 = 5;
const STORE_LOCK_RETRY_MS: u64 = 50;

/// JSON-lines store under a data directory.
///
/// Appends take an exclusive advisory lock on `<dir>/.lock`, reads a shared
/// one. The "current record" index is rebuilt from `analyses.jsonl` on open
/// and kept up to date by this process's own writes.
pub struct FileStore {
    dir: PathBuf,
    index: RwLock<HashMap<CacheKey, AnalysisRecord>>,
}

struct StoreLock {
    file: fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let records: Vec<AnalysisRecord> = {
            let _lock = lock(&dir, false)?;
            read_jsonl(&dir.join(ANALYSES_FILE))?
        };
        let mut index: HashMap<CacheKey, AnalysisRecord> = HashMap::new();
        let loaded = records.len();
        for record in records {
            insert_current(&mut index, record);
        }
        tracing::debug!(dir = %dir.display(), records = loaded, keys = index.len(), "opened analysis store");

        Ok(Self {
            dir,
            index: RwLock::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn append<T>(&self, file_name: &'static str, rows: Vec<T>) -> Result<(), StoreError>
    where
        T: Serialize + Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || append_jsonl(&dir, file_name, &rows))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn read_all<T>(&self, file_name: &'static str) -> Result<Vec<T>, StoreError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = lock(&dir, false)?;
            read_jsonl(&dir.join(file_name))
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

impl AnalysisCache for FileStore {
    fn lookup<'a>(&'a self, key: &'a CacheKey) -> StoreFuture<'a, Option<AnalysisRecord>> {
        Box::pin(async move { Ok(self.index.read().await.get(key).cloned()) })
    }

    fn store<'a>(&'a self, record: AnalysisRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.append(ANALYSES_FILE, vec![record.clone()]).await?;
            insert_current(&mut *self.index.write().await, record);
            Ok(())
        })
    }
}

impl CostLedger for FileStore {
    fn append_cost<'a>(&'a self, entry: CostLogEntry) -> StoreFuture<'a, ()> {
        Box::pin(self.append(COST_LOG_FILE, vec![entry]))
    }

    fn cost_entries<'a>(&'a self, session_id: Option<&'a str>) -> StoreFuture<'a, Vec<CostLogEntry>> {
        Box::pin(async move {
            let mut entries: Vec<CostLogEntry> = self.read_all(COST_LOG_FILE).await?;
            if let Some(session_id) = session_id {
                entries.retain(|e| e.session_id == session_id);
            }
            Ok(entries)
        })
    }
}

impl DiagnosticsLog for FileStore {
    fn append_diagnostics<'a>(&'a self, entries: Vec<DiagnosticEntry>) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if entries.is_empty() {
                return Ok(());
            }
            self.append(DIAGNOSTICS_FILE, entries).await
        })
    }

    fn recent_diagnostics<'a>(&'a self, filter: DiagnosticsFilter) -> StoreFuture<'a, DiagnosticsPage> {
        Box::pin(async move {
            let mut entries: Vec<DiagnosticEntry> = self.read_all(DIAGNOSTICS_FILE).await?;
            if entries.len() > MAX_DIAGNOSTICS {
                entries.drain(0..entries.len() - MAX_DIAGNOSTICS);
            }
            Ok(filter.apply(entries.iter()))
        })
    }
}

fn insert_current(index: &mut HashMap<CacheKey, AnalysisRecord>, record: AnalysisRecord) {
    let key = record.key();
    match index.get(&key) {
        Some(current) if !record.supersedes(current) => {}
        _ => {
            index.insert(key, record);
        }
    }
}

fn lock(dir: &Path, exclusive: bool) -> Result<StoreLock, StoreError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.join(LOCK_FILE))?;

    let start = Instant::now();
    loop {
        let result = if exclusive {
            FileExt::try_lock_exclusive(&file)
        } else {
            FileExt::try_lock_shared(&file)
        };
        match result {
            Ok(()) => return Ok(StoreLock { file }),
            Err(err) => {
                if err.kind() != ErrorKind::WouldBlock {
                    return Err(err.into());
                }
                if start.elapsed() >= Duration::from_secs(STORE_LOCK_TIMEOUT_SECS) {
                    return Err(StoreError::LockTimeout(STORE_LOCK_TIMEOUT_SECS));
                }
                std::thread::sleep(Duration::from_millis(STORE_LOCK_RETRY_MS));
            }
        }
    }
}

fn append_jsonl<T: Serialize>(dir: &Path, file_name: &str, rows: &[T]) -> Result<(), StoreError> {
    let mut buf = String::new();
    for row in rows {
        buf.push_str(&serde_json::to_string(row)?);
        buf.push('\n');
    }

    let _lock = lock(dir, true)?;
    let path = dir.join(file_name);
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
    }
    file.write_all(buf.as_bytes())?;
    file.flush()?;
    Ok(())
}

/// Read every parseable row. Corrupt lines (e.g. a torn final write) are
/// skipped and counted.
fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut skipped = 0usize;
    let rows = content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<T>(line) {
            Ok(row) => Some(row),
            Err(_) => {
                skipped += 1;
                None
            }
        })
        .collect();
    if skipped > 0 {
        tracing::warn!(path = %path.display(), skipped, "skipped corrupt store lines");
    }
    Ok(rows)
}
