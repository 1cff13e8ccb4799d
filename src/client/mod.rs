//! Client side: talks to a running grove server and decides when a failed
//! analysis is worth retrying automatically.

pub mod reporter;
pub mod session;
pub mod transport;

pub use reporter::DiagnosticsReporter;
pub use session::SessionTracker;
pub use transport::{HttpTransport, Transport, TransportFuture};

use crate::api::{RpcRequest, RpcResponse};
use crate::config::ClientConfig;
use crate::diagnostics::{DiagnosticEntry, DiagnosticLevel};
use crate::error::{AnalysisError, ErrorKind};
use crate::item::Item;
use crate::ledger::{SessionCosts, TotalCosts};
use crate::models::Mode;
use crate::orchestrator::{AnalysisRequest, AnalysisResponse, ConnectionStatus};
use crate::profile::Profile;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// When and how long to wait before retrying a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Connectivity and upstream delays; the last one repeats.
    pub schedule: Vec<Duration>,
    /// Rate-limit delay when the server gave none.
    pub rate_limit_default: Duration,
    pub max_auto_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            schedule: config
                .backoff_schedule_secs
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
            rate_limit_default: Duration::from_secs(config.rate_limit_default_secs),
            max_auto_retries: config.max_auto_retries,
        }
    }

    pub fn is_retryable(kind: ErrorKind) -> bool {
        matches!(
            kind,
            ErrorKind::RateLimited | ErrorKind::Connectivity | ErrorKind::UpstreamService
        )
    }

    /// Delay before retry number `attempt` (zero-based), or None when the
    /// error should surface instead.
    pub fn delay_for(&self, err: &AnalysisError, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_auto_retries {
            return None;
        }
        match err.kind() {
            ErrorKind::RateLimited => Some(err.retry_after().unwrap_or(self.rate_limit_default)),
            ErrorKind::Connectivity | ErrorKind::UpstreamService => {
                let index = (attempt as usize).min(self.schedule.len().saturating_sub(1));
                Some(self.schedule.get(index).copied().unwrap_or(Duration::from_secs(2)))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Loading,
    Success,
    Error(ErrorKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    StateChanged(ControllerState),
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        kind: ErrorKind,
    },
}

struct Status {
    state: ControllerState,
    retry_count: u32,
    retry_at: Option<Instant>,
    last_error: Option<AnalysisError>,
}

/// Drives analysis requests through the transport, retrying the kinds of
/// failure that can clear up on their own.
pub struct RetryController<T> {
    transport: Arc<T>,
    policy: RetryPolicy,
    sessions: SessionTracker,
    events: Option<mpsc::UnboundedSender<ControllerEvent>>,
    reporter: Option<DiagnosticsReporter>,
    status: Mutex<Status>,
}

impl<T: Transport> RetryController<T> {
    pub fn new(transport: Arc<T>, policy: RetryPolicy, sessions: SessionTracker) -> Self {
        Self {
            transport,
            policy,
            sessions,
            events: None,
            reporter: None,
            status: Mutex::new(Status {
                state: ControllerState::Idle,
                retry_count: 0,
                retry_at: None,
                last_error: None,
            }),
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<ControllerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_reporter(mut self, reporter: DiagnosticsReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn state(&self) -> ControllerState {
        self.status().state
    }

    pub fn retry_count(&self) -> u32 {
        self.status().retry_count
    }

    pub fn session_id(&self) -> String {
        self.sessions.peek()
    }

    /// Analyze an item, retrying automatically where the policy allows.
    pub async fn analyze(
        &self,
        item: Item,
        profile: Option<Profile>,
        mode: Mode,
        use_cache: bool,
    ) -> Result<AnalysisResponse, AnalysisError> {
        let request = AnalysisRequest {
            item,
            profile,
            mode,
            session_id: self.sessions.session_id(),
            use_cache,
        };
        {
            let mut status = self.status();
            status.retry_count = 0;
            status.retry_at = None;
            status.last_error = None;
        }
        self.set_state(ControllerState::Loading);

        loop {
            let err = match self.transport.call(RpcRequest::Analyze(request.clone())).await {
                Ok(RpcResponse::Analyze(response)) => {
                    {
                        let mut status = self.status();
                        status.retry_count = 0;
                        status.retry_at = None;
                    }
                    self.set_state(ControllerState::Success);
                    return Ok(response);
                }
                Ok(other) => AnalysisError::Unknown(format!("unexpected response to analyze: {:?}", other)),
                Err(err) => err,
            };

            let attempt = self.retry_count();
            match self.policy.delay_for(&err, attempt) {
                Some(delay) => {
                    tracing::info!(kind = %err.kind(), attempt = attempt + 1, delay_secs = delay.as_secs(), "retrying analysis");
                    {
                        let mut status = self.status();
                        status.retry_count = attempt + 1;
                        status.retry_at = Some(Instant::now() + delay);
                        status.last_error = Some(err.clone());
                    }
                    self.emit(ControllerEvent::RetryScheduled {
                        attempt: attempt + 1,
                        delay,
                        kind: err.kind(),
                    });
                    tokio::time::sleep(delay).await;
                }
                None => return Err(self.fail(err)),
            }
        }
    }

    pub async fn test_connection(&self) -> Result<ConnectionStatus, AnalysisError> {
        match self.transport.call(RpcRequest::TestConnection).await? {
            RpcResponse::TestConnection(status) => Ok(status),
            other => Err(unexpected("test_connection", &other)),
        }
    }

    /// Costs for the current session, or for `session_id` when given.
    pub async fn session_costs(&self, session_id: Option<String>) -> Result<SessionCosts, AnalysisError> {
        let session_id = session_id.unwrap_or_else(|| self.sessions.peek());
        match self.transport.call(RpcRequest::CostQuery { session_id }).await? {
            RpcResponse::CostQuery(costs) => Ok(costs),
            other => Err(unexpected("cost_query", &other)),
        }
    }

    pub async fn total_costs(&self) -> Result<TotalCosts, AnalysisError> {
        match self.transport.call(RpcRequest::TotalCosts).await? {
            RpcResponse::TotalCosts(totals) => Ok(totals),
            other => Err(unexpected("total_costs", &other)),
        }
    }

    /// One line describing where the controller is, including a countdown
    /// while a retry is pending.
    pub fn status_line(&self) -> String {
        self.status_line_at(Instant::now())
    }

    fn status_line_at(&self, now: Instant) -> String {
        let status = self.status();
        match status.state {
            ControllerState::Idle => "Ready".to_string(),
            ControllerState::Success => "Analysis complete".to_string(),
            ControllerState::Loading => match status.retry_at {
                Some(at) if at > now => {
                    let secs = remaining_secs(at - now);
                    let reason = match status.last_error.as_ref().map(AnalysisError::kind) {
                        Some(ErrorKind::RateLimited) => "Rate limited",
                        Some(ErrorKind::UpstreamService) => "Service unavailable",
                        _ => "Connection problem",
                    };
                    format!(
                        "{}; retrying in {}s (attempt {} of {})",
                        reason, secs, status.retry_count, self.policy.max_auto_retries
                    )
                }
                _ => "Analyzing...".to_string(),
            },
            ControllerState::Error(kind) => {
                let retry_after = status.last_error.as_ref().and_then(AnalysisError::retry_after);
                match (kind, retry_after) {
                    (ErrorKind::RateLimited, Some(delay)) => {
                        format!("Rate limited; try again in {}s", remaining_secs(delay))
                    }
                    (ErrorKind::RateLimited, None) => "Rate limited; try again shortly".to_string(),
                    (ErrorKind::AuthRequired, _) => "API key missing or rejected; run `grove setup`".to_string(),
                    (ErrorKind::Connectivity, _) => "Cannot reach the grove server".to_string(),
                    (ErrorKind::UpstreamService, _) => "AI service unavailable; try again later".to_string(),
                    (ErrorKind::Validation, _) => "Request was rejected as invalid".to_string(),
                    (ErrorKind::Extraction, _) => "No usable product data to analyze".to_string(),
                    (ErrorKind::CacheError, _) => "Local storage error".to_string(),
                    (ErrorKind::Unknown, _) => "Analysis failed".to_string(),
                }
            }
        }
    }

    fn fail(&self, err: AnalysisError) -> AnalysisError {
        tracing::warn!(kind = %err.kind(), error = %err, "analysis failed");
        {
            let mut status = self.status();
            status.retry_at = None;
            status.last_error = Some(err.clone());
        }
        self.set_state(ControllerState::Error(err.kind()));
        if let Some(reporter) = &self.reporter {
            reporter.report(
                DiagnosticEntry::new(DiagnosticLevel::Error, err.message())
                    .with_component("retry_controller")
                    .with_kind(err.kind()),
            );
        }
        err
    }

    fn set_state(&self, state: ControllerState) {
        self.status().state = state;
        self.emit(ControllerEvent::StateChanged(state));
    }

    fn emit(&self, event: ControllerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        match self.status.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stop the diagnostics reporter, flushing what it holds.
    pub async fn shutdown(self) {
        if let Some(reporter) = self.reporter {
            reporter.shutdown().await;
        }
    }
}

fn remaining_secs(delay: Duration) -> u64 {
    let secs = delay.as_secs();
    if delay.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

fn unexpected(call: &str, response: &RpcResponse) -> AnalysisError {
    AnalysisError::Unknown(format!("unexpected response to {}: {:?}", call, response))
}
