//! Best-effort diagnostics upload. Entries are queued without blocking the
//! caller, batched, and posted in the background. Nothing here ever fails the
//! operation that produced the entry.

use super::transport::Transport;
use crate::api::RpcRequest;
use crate::diagnostics::DiagnosticEntry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const MAX_BATCH: usize = 20;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const QUEUE_CAPACITY: usize = 256;

pub struct DiagnosticsReporter {
    sender: mpsc::Sender<DiagnosticEntry>,
    dropped: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl DiagnosticsReporter {
    pub fn spawn<T: Transport>(transport: Arc<T>) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let task = tokio::spawn(run(transport, receiver));
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
            task,
        }
    }

    /// Queue an entry. Returns false if it was dropped.
    pub fn report(&self, entry: DiagnosticEntry) -> bool {
        match self.sender.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(dropped, "diagnostics queue full; entry dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flush what is queued and stop the background task.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(err) = self.task.await {
            tracing::debug!(error = %err, "diagnostics reporter task ended abnormally");
        }
    }
}

async fn run<T: Transport>(transport: Arc<T>, mut receiver: mpsc::Receiver<DiagnosticEntry>) {
    let mut batch = Vec::with_capacity(MAX_BATCH);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            received = receiver.recv() => match received {
                Some(entry) => {
                    batch.push(entry);
                    if batch.len() >= MAX_BATCH {
                        flush(&*transport, &mut batch).await;
                    }
                }
                None => {
                    flush(&*transport, &mut batch).await;
                    break;
                }
            },
            _ = ticker.tick() => flush(&*transport, &mut batch).await,
        }
    }
}

async fn flush<T: Transport>(transport: &T, batch: &mut Vec<DiagnosticEntry>) {
    if batch.is_empty() {
        return;
    }
    let entries = std::mem::take(batch);
    let count = entries.len();
    match transport.call(RpcRequest::ReportDiagnostics { entries }).await {
        Ok(_) => tracing::debug!(count, "diagnostics batch sent"),
        Err(err) => tracing::debug!(count, error = %err, "diagnostics batch not delivered"),
    }
}
