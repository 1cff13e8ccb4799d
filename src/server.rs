//! HTTP surface: `POST /api/rpc` for the tagged envelope and `GET /health`.

use crate::api::{ErrorBody, HealthStatus, RpcRequest, RpcResponse, HEALTH_PATH, RPC_PATH};
use crate::cache::Store;
use crate::error::{AnalysisError, ErrorKind};
use crate::gateway::InferenceGateway;
use crate::orchestrator::AnalysisOrchestrator;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

impl IntoResponse for AnalysisError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.kind().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(ErrorBody::from(&self));
        match (self.kind(), self.retry_after()) {
            (ErrorKind::RateLimited, Some(delay)) => (
                status,
                [(header::RETRY_AFTER, delay.as_secs().max(1).to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

pub fn router<G: InferenceGateway, S: Store>(orchestrator: AnalysisOrchestrator<G, S>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(RPC_PATH, post(rpc::<G, S>))
        .route(HEALTH_PATH, get(health::<G, S>))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

/// Serve until `shutdown` resolves.
pub async fn serve<G: InferenceGateway, S: Store>(
    listener: TcpListener,
    orchestrator: AnalysisOrchestrator<G, S>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "grove server listening");
    }
    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("grove server stopped");
    Ok(())
}

async fn rpc<G: InferenceGateway, S: Store>(
    State(orchestrator): State<AnalysisOrchestrator<G, S>>,
    payload: Result<Json<RpcRequest>, JsonRejection>,
) -> Result<Json<RpcResponse>, AnalysisError> {
    let Json(request) = payload.map_err(|rejection| {
        tracing::debug!(error = %rejection.body_text(), "rejected rpc body");
        AnalysisError::Validation(rejection.body_text())
    })?;
    tracing::debug!(request = request.name(), "rpc");

    let response = match request {
        RpcRequest::Analyze(analysis) => RpcResponse::Analyze(orchestrator.analyze(analysis).await?),
        RpcRequest::TestConnection => RpcResponse::TestConnection(orchestrator.test_connection().await),
        RpcRequest::CostQuery { session_id } => {
            RpcResponse::CostQuery(orchestrator.session_costs(&session_id).await?)
        }
        RpcRequest::TotalCosts => RpcResponse::TotalCosts(orchestrator.total_costs().await?),
        RpcRequest::ReportDiagnostics { entries } => RpcResponse::ReportDiagnostics {
            accepted: orchestrator.report_diagnostics(entries).await?,
        },
        RpcRequest::Diagnostics(filter) => RpcResponse::Diagnostics(orchestrator.diagnostics(filter).await?),
    };
    Ok(Json(response))
}

async fn health<G: InferenceGateway, S: Store>(
    State(orchestrator): State<AnalysisOrchestrator<G, S>>,
) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        provider: orchestrator.gateway().provider().to_string(),
    })
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("received terminate signal, shutting down"),
    }
}
