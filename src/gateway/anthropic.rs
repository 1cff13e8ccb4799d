//! Anthropic Messages API backend with system-prompt cache breakpoints.

use super::parse::parse_analysis_output;
use super::prompt::PromptPlan;
use super::{Completion, GatewayFuture, InferenceGateway};
use crate::cost::{CostError, Money, PriceTable, TokenUsage};
use crate::error::AnalysisError;
use crate::item::Item;
use crate::models::{Mode, ModelTable};
use crate::profile::Profile;
use crate::util::sanitize_api_response;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Anthropic accepts at most four cache_control breakpoints per request.
pub const MAX_BREAKPOINTS: usize = 4;
const PROVIDER: &str = "anthropic";
const CONNECTION_TEST_MAX_TOKENS: u32 = 10;
/// Upper bound accepted for retry hints parsed out of an error body.
const MAX_BODY_RETRY_SECS: u64 = 300;

pub struct AnthropicSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub models: ModelTable,
    pub prices: PriceTable,
    pub prompt_caching: bool,
    pub timeout_secs: u64,
}

pub struct AnthropicGateway {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    models: ModelTable,
    prices: PriceTable,
    prompt_caching: bool,
}

/// Cache control for Anthropic prompt caching
#[derive(Serialize, Clone, Debug)]
struct CacheControl {
    #[serde(rename = "type")]
    cache_type: &'static str,
}

/// One text block of the system prompt
#[derive(Serialize, Clone, Debug)]
struct SystemBlock {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Serialize, Debug)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Serialize, Debug)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    system: Vec<SystemBlock>,
    messages: Vec<Message>,
}

#[derive(Deserialize, Debug)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Deserialize, Debug)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    cache_read_input_tokens: Option<i64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize, Debug)]
struct ApiErrorDetail {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

impl AnthropicGateway {
    pub fn new(settings: AnthropicSettings) -> Result<Self, AnalysisError> {
        let client = create_http_client(settings.timeout_secs)?;
        let endpoint = format!("{}/v1/messages", settings.base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            api_key: settings.api_key.filter(|k| !k.trim().is_empty()),
            models: settings.models,
            prices: settings.prices,
            prompt_caching: settings.prompt_caching,
        })
    }

    fn api_key(&self) -> Result<&str, AnalysisError> {
        self.api_key.as_deref().ok_or_else(|| {
            AnalysisError::AuthRequired(
                "No Anthropic API key configured. Run 'grove setup' or set ANTHROPIC_API_KEY."
                    .to_string(),
            )
        })
    }

    fn system_blocks(&self, plan: &PromptPlan) -> Vec<SystemBlock> {
        plan.stable
            .iter()
            .map(|segment| SystemBlock {
                block_type: "text",
                text: segment.text.clone(),
                cache_control: (self.prompt_caching && segment.cacheable).then_some(CacheControl {
                    cache_type: "ephemeral",
                }),
            })
            .collect()
    }

    async fn complete(&self, plan: PromptPlan) -> Result<Completion, AnalysisError> {
        let api_key = self.api_key()?;
        let spec = self.models.for_mode(plan.mode);
        let plan = plan.capped(MAX_BREAKPOINTS);
        let body = MessagesRequest {
            model: &spec.model,
            max_tokens: spec.max_tokens,
            system: self.system_blocks(&plan),
            messages: vec![Message {
                role: "user",
                content: plan.volatile.clone(),
            }],
        };

        let started = Instant::now();
        let response: MessagesResponse = self.send(api_key, &body).await?;
        let usage = response_usage(&response.usage)?;
        let raw_output = response
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if raw_output.trim().is_empty() {
            return Err(AnalysisError::UpstreamService(
                "Anthropic returned an empty response".to_string(),
            ));
        }

        tracing::info!(
            model = %spec.model,
            mode = %plan.mode,
            breakpoints = plan.breakpoint_count(),
            input = usage.input,
            output = usage.output,
            cache_read = usage.cache_read,
            cache_write = usage.cache_write,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "inference completed"
        );

        Ok(Completion {
            result: parse_analysis_output(&raw_output),
            raw_output,
            model: spec.model.clone(),
            usage,
        })
    }

    async fn send<T>(&self, api_key: &str, body: &MessagesRequest<'_>) -> Result<T, AnalysisError>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| AnalysisError::from_transport(&e, "Anthropic"))?;

        let status = response.status().as_u16();
        let retry_after_header = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = response
            .text()
            .await
            .map_err(|e| AnalysisError::from_transport(&e, "Anthropic"))?;

        if !(200..300).contains(&status) {
            let err = classify_status(status, retry_after_header, &text);
            tracing::warn!(status, kind = %err.kind(), "Anthropic request failed");
            return Err(err);
        }

        serde_json::from_str(&text).map_err(|e| {
            AnalysisError::UpstreamService(format!(
                "Unexpected response from Anthropic ({}): {}",
                e,
                sanitize_api_response(&text)
            ))
        })
    }
}

impl InferenceGateway for AnthropicGateway {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn run_full<'a>(&'a self, item: &'a Item, profile: &'a Profile) -> GatewayFuture<'a, Completion> {
        Box::pin(async move { self.complete(PromptPlan::full(item, profile)).await })
    }

    fn run_basic<'a>(&'a self, item: &'a Item) -> GatewayFuture<'a, Completion> {
        Box::pin(async move { self.complete(PromptPlan::basic(item)).await })
    }

    fn check_connection(&self) -> GatewayFuture<'_, ()> {
        Box::pin(async move {
            let api_key = self.api_key()?;
            let body = MessagesRequest {
                model: &self.models.for_mode(Mode::Basic).model,
                max_tokens: CONNECTION_TEST_MAX_TOKENS,
                system: Vec::new(),
                messages: vec![Message {
                    role: "user",
                    content: "Hi".to_string(),
                }],
            };
            let _: MessagesResponse = self.send(api_key, &body).await?;
            Ok(())
        })
    }

    fn cost(&self, usage: &TokenUsage, model: &str) -> Result<Money, CostError> {
        self.prices.cost(usage, model)
    }

    fn prompt_cache_savings(&self, usage: &TokenUsage, model: &str) -> Result<Money, CostError> {
        self.prices.prompt_cache_savings(usage, model)
    }
}

/// Create a configured HTTP client for Anthropic requests
pub(crate) fn create_http_client(timeout_secs: u64) -> Result<reqwest::Client, AnalysisError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| AnalysisError::Unknown(format!("Failed to create HTTP client: {}", e)))
}

fn response_usage(usage: &ApiUsage) -> Result<TokenUsage, AnalysisError> {
    TokenUsage::from_signed(
        usage.input_tokens,
        usage.output_tokens,
        usage.cache_read_input_tokens.unwrap_or(0),
        usage.cache_creation_input_tokens.unwrap_or(0),
    )
    .map_err(|e| AnalysisError::UpstreamService(format!("Invalid usage from Anthropic: {}", e)))
}

fn retry_hint_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)\bretry\D{0,40}?(\d{1,6})").ok())
        .as_ref()
}

/// Seconds hinted in prose such as "please retry after 20 seconds".
fn parse_retry_after(text: &str) -> Option<u64> {
    let captures = retry_hint_pattern()?.captures(text)?;
    captures
        .get(1)?
        .as_str()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0 && *secs < MAX_BODY_RETRY_SECS)
}

fn classify_status(status: u16, retry_after_header: Option<u64>, body: &str) -> AnalysisError {
    let detail = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| {
            if b.error.message.is_empty() {
                b.error.error_type
            } else {
                b.error.message
            }
        })
        .unwrap_or_else(|_| body.to_string());
    let detail = sanitize_api_response(&detail);

    match status {
        400 | 404 | 413 | 422 => {
            AnalysisError::Validation(format!("Anthropic rejected the request ({}): {}", status, detail))
        }
        401 | 403 => AnalysisError::AuthRequired(
            "Invalid Anthropic API key. Run 'grove setup' to update it.".to_string(),
        ),
        429 => AnalysisError::RateLimited {
            message: format!("Rate limited by Anthropic: {}", detail),
            retry_after: retry_after_header
                .or_else(|| parse_retry_after(body))
                .map(Duration::from_secs),
        },
        500..=599 | 529 => AnalysisError::UpstreamService(format!(
            "Anthropic server error ({}). The service may be temporarily unavailable.",
            status
        )),
        _ => AnalysisError::Unknown(format!("Anthropic API error {}: {}", status, detail)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::{json, Value};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(base_url: &str, api_key: Option<&str>, prompt_caching: bool) -> AnthropicGateway {
        AnthropicGateway::new(AnthropicSettings {
            base_url: base_url.to_string(),
            api_key: api_key.map(str::to_string),
            models: ModelTable::default(),
            prices: PriceTable::default(),
            prompt_caching,
            timeout_secs: 5,
        })
        .unwrap()
    }

    fn item() -> Item {
        Item {
            title: Some("Wool Overcoat".to_string()),
            price: Some(199.0),
            ..Item::new("https://shop.example.com/p/coat")
        }
    }

    fn success_body() -> Value {
        json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-sonnet-4-5-20250929",
            "content": [{"type": "text", "text": "```json\n{\"style_match_score\": 91}\n```"}],
            "usage": {
                "input_tokens": 120,
                "output_tokens": 300,
                "cache_read_input_tokens": 1800,
                "cache_creation_input_tokens": 0
            }
        })
    }

    #[tokio::test]
    async fn test_full_request_marks_stable_segments_cacheable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
            .expect(1)
            .mount(&server)
            .await;

        let gw = gateway(&server.uri(), Some("sk-ant-test"), true);
        let profile = Profile::from_value(json!({"color_palette": ["camel"]})).unwrap();
        let completion = gw.run_full(&item(), &profile).await.unwrap();

        assert_eq!(completion.result["style_match_score"], 91);
        assert_eq!(completion.model, "claude-sonnet-4-5-20250929");
        assert_eq!(completion.usage.cache_read, 1800);
        assert_eq!(completion.usage.input, 120);

        let requests = server.received_requests().await.unwrap();
        let body: Value = requests[0].body_json().unwrap();
        assert_eq!(body["max_tokens"], 2048);
        let system = body["system"].as_array().unwrap();
        assert_eq!(system.len(), 3);
        for block in system {
            assert_eq!(block["cache_control"]["type"], "ephemeral");
        }
        assert!(system[1]["text"].as_str().unwrap().contains("Color Preferences: camel"));
        let user = body["messages"][0]["content"].as_str().unwrap();
        assert!(user.contains("Product: Wool Overcoat"));
    }

    #[tokio::test]
    async fn test_caching_disabled_omits_cache_control() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
            .mount(&server)
            .await;

        let gw = gateway(&server.uri(), Some("sk-ant-test"), false);
        gw.run_basic(&item()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: Value = requests[0].body_json().unwrap();
        assert_eq!(body["model"], "claude-haiku-4-5-20250929");
        assert_eq!(body["max_tokens"], 1536);
        for block in body["system"].as_array().unwrap() {
            assert!(block.get("cache_control").is_none());
        }
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
            .expect(0)
            .mount(&server)
            .await;

        let gw = gateway(&server.uri(), None, true);
        let err = gw.run_basic(&item()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthRequired);
        assert!(!gw.test_connection().await);
    }

    #[tokio::test]
    async fn test_rate_limit_uses_retry_after_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_json(json!({
                        "type": "error",
                        "error": {"type": "rate_limit_error", "message": "Number of requests exceeded"}
                    })),
            )
            .mount(&server)
            .await;

        let gw = gateway(&server.uri(), Some("sk-ant-test"), true);
        let err = gw.run_basic(&item()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn test_status_classification() {
        for (status, kind) in [
            (400, ErrorKind::Validation),
            (401, ErrorKind::AuthRequired),
            (500, ErrorKind::UpstreamService),
            (529, ErrorKind::UpstreamService),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                    "type": "error",
                    "error": {"type": "api_error", "message": "nope"}
                })))
                .mount(&server)
                .await;
            let gw = gateway(&server.uri(), Some("sk-ant-test"), true);
            let err = gw.run_basic(&item()).await.unwrap_err();
            assert_eq!(err.kind(), kind, "status {}", status);
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_connectivity() {
        // Nothing listens on port 9 (discard) in test environments
        let gw = gateway("http://127.0.0.1:9", Some("sk-ant-test"), true);
        let err = gw.run_basic(&item()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
    }

    #[tokio::test]
    async fn test_connection_check_sends_tiny_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "Hello"}],
                "usage": {"input_tokens": 8, "output_tokens": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gw = gateway(&server.uri(), Some("sk-ant-test"), true);
        assert!(gw.test_connection().await);
        let body: Value = server.received_requests().await.unwrap()[0].body_json().unwrap();
        assert_eq!(body["max_tokens"], CONNECTION_TEST_MAX_TOKENS);
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_parse_retry_after_from_body() {
        assert_eq!(parse_retry_after("Please retry after 20 seconds"), Some(20));
        assert_eq!(parse_retry_after("retry in 1000 seconds"), None);
        assert_eq!(parse_retry_after("slow down"), None);
    }

    #[test]
    fn test_classify_redacts_credentials() {
        let err = classify_status(400, None, r#"{"error":{"type":"x","message":"bad x-api-key sk-ant-123"}}"#);
        assert!(err.message().contains("redacted"));
        assert!(!err.message().contains("sk-ant-123"));
    }
}
