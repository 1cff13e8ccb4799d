//! Wire envelope shared by the HTTP server and the client transport.
//!
//! Requests and responses are tagged by `type`; failures travel as an
//! [`ErrorBody`] with a status derived from the error kind.

use crate::diagnostics::{DiagnosticEntry, DiagnosticsFilter, DiagnosticsPage};
use crate::error::{AnalysisError, ErrorKind};
use crate::ledger::{SessionCosts, TotalCosts};
use crate::orchestrator::{AnalysisRequest, AnalysisResponse, ConnectionStatus};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const RPC_PATH: &str = "/api/rpc";
pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcRequest {
    Analyze(AnalysisRequest),
    TestConnection,
    CostQuery { session_id: String },
    TotalCosts,
    ReportDiagnostics { entries: Vec<DiagnosticEntry> },
    Diagnostics(DiagnosticsFilter),
}

impl RpcRequest {
    pub fn name(&self) -> &'static str {
        match self {
            RpcRequest::Analyze(_) => "analyze",
            RpcRequest::TestConnection => "test_connection",
            RpcRequest::CostQuery { .. } => "cost_query",
            RpcRequest::TotalCosts => "total_costs",
            RpcRequest::ReportDiagnostics { .. } => "report_diagnostics",
            RpcRequest::Diagnostics(_) => "diagnostics",
        }
    }

    /// Analyze waits on inference; everything else is a light call.
    pub fn is_long_running(&self) -> bool {
        matches!(self, RpcRequest::Analyze(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcResponse {
    Analyze(AnalysisResponse),
    TestConnection(ConnectionStatus),
    CostQuery(SessionCosts),
    TotalCosts(TotalCosts),
    ReportDiagnostics { accepted: usize },
    Diagnostics(DiagnosticsPage),
}

/// `{"error": {"kind", "message", "retry_after_secs"}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub retry_after_secs: Option<u64>,
}

impl From<&AnalysisError> for ErrorBody {
    fn from(err: &AnalysisError) -> Self {
        ErrorBody {
            error: ErrorDetail {
                kind: err.kind(),
                message: err.message().to_string(),
                retry_after_secs: err.retry_after().map(|d| d.as_secs().max(1)),
            },
        }
    }
}

impl From<ErrorBody> for AnalysisError {
    fn from(body: ErrorBody) -> Self {
        let ErrorDetail {
            kind,
            message,
            retry_after_secs,
        } = body.error;
        AnalysisError::from_parts(kind, message, retry_after_secs.map(Duration::from_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub provider: String,
}
