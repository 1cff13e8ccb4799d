use crate::api::{ErrorBody, RpcRequest, RpcResponse, RPC_PATH};
use crate::config::ClientConfig;
use crate::error::{AnalysisError, ErrorKind};
use crate::util::truncate;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AnalysisError>> + Send + 'a>>;

/// Carries one envelope request to the server and back.
pub trait Transport: Send + Sync + 'static {
    fn call(&self, request: RpcRequest) -> TransportFuture<'_, RpcResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    light_timeout: Duration,
    analyze_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, AnalysisError> {
        Self::with_timeouts(
            &config.server_url,
            Duration::from_secs(config.light_timeout_secs),
            Duration::from_secs(config.analyze_timeout_secs),
        )
    }

    pub fn with_timeouts(
        server_url: &str,
        light_timeout: Duration,
        analyze_timeout: Duration,
    ) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder()
            .connect_timeout(light_timeout)
            .build()
            .map_err(|e| AnalysisError::Unknown(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", server_url.trim_end_matches('/'), RPC_PATH),
            light_timeout,
            analyze_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, request: RpcRequest) -> Result<RpcResponse, AnalysisError> {
        let timeout = if request.is_long_running() {
            self.analyze_timeout
        } else {
            self.light_timeout
        };
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| AnalysisError::from_transport(&e, "grove server"))?;

        let status = response.status();
        if status.is_success() {
            return response.json::<RpcResponse>().await.map_err(|e| {
                AnalysisError::UpstreamService(format!("unreadable server response: {}", e))
            });
        }

        let header_delay = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.unwrap_or_default();

        let err = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => AnalysisError::from(body),
            Err(_) => AnalysisError::from_parts(
                ErrorKind::from_http_status(status.as_u16()),
                format!("server returned {}: {}", status, truncate(&text, 200)),
                None,
            ),
        };
        Err(match err {
            AnalysisError::RateLimited {
                message,
                retry_after: None,
            } => AnalysisError::RateLimited {
                message,
                retry_after: header_delay,
            },
            other => other,
        })
    }
}

impl Transport for HttpTransport {
    fn call(&self, request: RpcRequest) -> TransportFuture<'_, RpcResponse> {
        Box::pin(self.send(request))
    }
}
