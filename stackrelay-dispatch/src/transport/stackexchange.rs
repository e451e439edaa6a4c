//! Stack Exchange HTTP client with client-side pacing

use super::{CredentialProbe, QaTransport, TransportReply};
use crate::quota::QuotaUpdate;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use stackrelay_core::{
    ApiRequest, RelayConfig, RelayError, RelayResult, Timestamp, TransportMode, UpstreamError,
    ValidationError,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::debug;

/// Built-in filter adding bodies to question objects.
const FILTER_WITH_BODY: &str = "withbody";
/// Pre-generated filter embedding answers (with bodies) in question objects.
const FILTER_WITH_ANSWERS: &str = "!nKzQUR3Egv";
/// Envelope error id the API uses for throttle violations.
const THROTTLE_VIOLATION_ID: u64 = 502;

/// HTTP client for the Stack Exchange API.
///
/// Physical calls are paced to a requests-per-minute budget with a minimum
/// inter-request interval, independently of the server-side quota the
/// tracker watches.
pub struct StackExchangeClient {
    client: Client,
    base_url: String,
    site: String,
    api_key: Option<String>,
    request_timeout: Duration,
    pacer: Arc<Semaphore>,
    last_request: Arc<AtomicU64>,
    min_request_interval_ms: u64,
    start_time: Instant,
}

impl StackExchangeClient {
    /// Create a new client from the relay configuration.
    pub fn new(config: &RelayConfig) -> Self {
        let rpm = config.requests_per_minute.max(1);
        let min_interval_ms = (60_000 / rpm as u64).max(10);

        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            site: config.site.clone(),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
            request_timeout: config.request_timeout,
            pacer: Arc::new(Semaphore::new(rpm as usize)),
            last_request: Arc::new(AtomicU64::new(0)),
            min_request_interval_ms: min_interval_ms,
            start_time: Instant::now(),
        }
    }

    /// Enforce the pacing budget before a physical call.
    async fn pace(&self) -> Result<tokio::sync::SemaphorePermit<'_>, UpstreamError> {
        let permit = self.pacer.acquire().await.map_err(|e| {
            UpstreamError::Network {
                reason: format!("pacer error: {}", e),
            }
        })?;

        let now_ms = self.start_time.elapsed().as_millis() as u64;
        let last_ms = self.last_request.load(Ordering::Relaxed);
        let elapsed = now_ms.saturating_sub(last_ms);

        if elapsed < self.min_request_interval_ms {
            let wait_ms = self.min_request_interval_ms - elapsed;
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }

        self.last_request
            .store(self.start_time.elapsed().as_millis() as u64, Ordering::Relaxed);
        Ok(permit)
    }

    /// Endpoint path and query parameters for a logical request.
    fn endpoint_and_params(&self, request: &ApiRequest) -> (String, Vec<(String, String)>) {
        match request {
            ApiRequest::Search { .. } | ApiRequest::TagSearch { .. } => {
                let endpoint = match request {
                    ApiRequest::Search { .. } => "search/advanced",
                    _ => "questions",
                };
                // Normalized parameters already use the API's own keys
                // (q / tagged / page / pagesize / sort).
                let mut params = request.normalized_params();
                params.push(("order".to_string(), "desc".to_string()));
                params.push(("site".to_string(), self.site.clone()));
                (endpoint.to_string(), params)
            }
            ApiRequest::Question {
                id,
                with_answers,
                with_body,
            } => {
                let mut params = vec![("site".to_string(), self.site.clone())];
                if *with_answers {
                    params.push(("filter".to_string(), FILTER_WITH_ANSWERS.to_string()));
                } else if *with_body {
                    params.push(("filter".to_string(), FILTER_WITH_BODY.to_string()));
                }
                (format!("questions/{}", id), params)
            }
        }
    }

    async fn get_envelope(
        &self,
        endpoint: &str,
        mut params: Vec<(String, String)>,
        mode: TransportMode,
    ) -> RelayResult<TransportReply> {
        let _permit = self.pace().await.map_err(RelayError::from)?;

        if mode == TransportMode::Authenticated {
            if let Some(key) = &self.api_key {
                params.push(("key".to_string(), key.clone()));
            }
        }

        let url = format!("{}/{}", self.base_url, endpoint);
        debug!(%url, %mode, "issuing upstream call");

        let response = self
            .client
            .get(&url)
            .query(&params)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| map_send_error(e, self.request_timeout))?;

        let status = response.status();
        let header_quota = parse_rate_limit_headers(response.headers());
        let retry_after = parse_retry_after(response.headers());

        let text = response
            .text()
            .await
            .map_err(|e| UpstreamError::Network {
                reason: format!("failed to read response body: {}", e),
            })?;
        let body: Option<Value> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            return Err(classify_failure(status, body.as_ref(), retry_after, mode));
        }

        let body = body.ok_or_else(|| UpstreamError::InvalidResponse {
            reason: "response body is not valid JSON".to_string(),
        })?;

        // The API reports throttling inside a 200 envelope often enough
        // that the body has to be checked even on success.
        if let Some(error) = envelope_error(&body) {
            return Err(classify_envelope_error(error, retry_after, mode));
        }

        let quota = merge_quota(header_quota, &body);
        Ok(TransportReply {
            payload: body,
            quota,
        })
    }
}

#[async_trait]
impl QaTransport for StackExchangeClient {
    async fn execute(
        &self,
        request: &ApiRequest,
        mode: TransportMode,
    ) -> RelayResult<TransportReply> {
        let (endpoint, params) = self.endpoint_and_params(request);
        self.get_envelope(&endpoint, params, mode).await
    }

    async fn probe_credentials(&self) -> RelayResult<CredentialProbe> {
        let params = vec![("site".to_string(), self.site.clone())];
        let reply = self
            .get_envelope("info", params, TransportMode::Authenticated)
            .await?;

        Ok(CredentialProbe {
            quota_max: reply
                .payload
                .get("quota_max")
                .and_then(Value::as_u64)
                .map(|v| v as u32),
            quota_remaining: reply.quota.remaining,
        })
    }
}

impl std::fmt::Debug for StackExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackExchangeClient")
            .field("base_url", &self.base_url)
            .field("site", &self.site)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

// ============================================================================
// RESPONSE CLASSIFICATION
// ============================================================================

struct EnvelopeError {
    id: u64,
    name: String,
    message: String,
}

fn map_send_error(error: reqwest::Error, timeout: Duration) -> RelayError {
    if error.is_timeout() {
        UpstreamError::Timeout { elapsed: timeout }.into()
    } else {
        UpstreamError::Network {
            reason: error.to_string(),
        }
        .into()
    }
}

/// Parse `x-ratelimit-*` headers; garbage values read as absent.
fn parse_rate_limit_headers(headers: &HeaderMap) -> QuotaUpdate {
    let remaining = headers
        .get("x-ratelimit-remaining")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u32>().ok());

    let reset_at: Option<Timestamp> = headers
        .get("x-ratelimit-reset")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok())
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0));

    QuotaUpdate {
        remaining,
        reset_at,
        backoff: None,
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
}

fn envelope_error(body: &Value) -> Option<EnvelopeError> {
    let id = body.get("error_id")?.as_u64()?;
    Some(EnvelopeError {
        id,
        name: body
            .get("error_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        message: body
            .get("error_message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    })
}

/// Fold the envelope's quota fields over whatever the headers said.
fn merge_quota(mut quota: QuotaUpdate, body: &Value) -> QuotaUpdate {
    if let Some(remaining) = body.get("quota_remaining").and_then(Value::as_u64) {
        quota.remaining = Some(remaining as u32);
    }
    if let Some(backoff_secs) = body.get("backoff").and_then(Value::as_u64) {
        quota.backoff = Some(Duration::from_secs(backoff_secs));
    }
    quota
}

fn classify_envelope_error(
    error: EnvelopeError,
    retry_after: Option<Duration>,
    mode: TransportMode,
) -> RelayError {
    if error.id == THROTTLE_VIOLATION_ID || error.name == "throttle_violation" {
        UpstreamError::RateLimited {
            mode,
            backoff: retry_after,
        }
        .into()
    } else {
        ValidationError::UpstreamRejected {
            status: error.id.min(u16::MAX as u64) as u16,
            message: error.message,
        }
        .into()
    }
}

fn classify_failure(
    status: StatusCode,
    body: Option<&Value>,
    retry_after: Option<Duration>,
    mode: TransportMode,
) -> RelayError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return UpstreamError::RateLimited {
            mode,
            backoff: retry_after,
        }
        .into();
    }

    if let Some(error) = body.and_then(envelope_error) {
        return classify_envelope_error(error, retry_after, mode);
    }

    let message = body
        .and_then(|b| b.get("error_message"))
        .and_then(Value::as_str)
        .unwrap_or("no error detail")
        .to_string();

    if status.is_server_error() {
        UpstreamError::Server {
            status: status.as_u16(),
            message,
        }
        .into()
    } else {
        ValidationError::UpstreamRejected {
            status: status.as_u16(),
            message,
        }
        .into()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> StackExchangeClient {
        StackExchangeClient::new(&RelayConfig::default())
    }

    #[test]
    fn test_search_endpoint_and_params() {
        let request = ApiRequest::search("python asyncio");
        let (endpoint, params) = client().endpoint_and_params(&request);

        assert_eq!(endpoint, "search/advanced");
        assert!(params.contains(&("q".to_string(), "python asyncio".to_string())));
        assert!(params.contains(&("site".to_string(), "stackoverflow".to_string())));
        assert!(params.contains(&("order".to_string(), "desc".to_string())));
    }

    #[test]
    fn test_tag_search_joins_normalized_tags() {
        let request = ApiRequest::tag_search(vec!["Python".to_string(), "asyncio".to_string()]);
        let (endpoint, params) = client().endpoint_and_params(&request);

        assert_eq!(endpoint, "questions");
        assert!(params.contains(&("tagged".to_string(), "asyncio;python".to_string())));
    }

    #[test]
    fn test_question_fetch_uses_path_and_filter() {
        let (endpoint, params) = client().endpoint_and_params(&ApiRequest::question(11227809));
        assert_eq!(endpoint, "questions/11227809");
        assert!(params.contains(&("filter".to_string(), FILTER_WITH_ANSWERS.to_string())));

        let body_only = ApiRequest::Question {
            id: 7,
            with_answers: false,
            with_body: true,
        };
        let (_, params) = client().endpoint_and_params(&body_only);
        assert!(params.contains(&("filter".to_string(), FILTER_WITH_BODY.to_string())));
    }

    #[test]
    fn test_header_parsing_tolerates_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", "invalid".parse().unwrap());
        headers.insert("x-ratelimit-reset", "also-invalid".parse().unwrap());

        let quota = parse_rate_limit_headers(&headers);
        assert_eq!(quota.remaining, None);
        assert_eq!(quota.reset_at, None);
    }

    #[test]
    fn test_header_parsing_reads_values() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", "25".parse().unwrap());
        headers.insert("x-ratelimit-reset", "1609459200".parse().unwrap());

        let quota = parse_rate_limit_headers(&headers);
        assert_eq!(quota.remaining, Some(25));
        assert_eq!(
            quota.reset_at,
            chrono::DateTime::from_timestamp(1609459200, 0)
        );
    }

    #[test]
    fn test_envelope_quota_overrides_headers() {
        let quota = merge_quota(
            QuotaUpdate {
                remaining: Some(100),
                reset_at: None,
                backoff: None,
            },
            &json!({"quota_remaining": 42, "backoff": 30}),
        );
        assert_eq!(quota.remaining, Some(42));
        assert_eq!(quota.backoff, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_throttle_envelope_is_rate_limited() {
        let body = json!({
            "error_id": 502,
            "error_name": "throttle_violation",
            "error_message": "too many requests from this IP"
        });
        let error = classify_failure(
            StatusCode::BAD_REQUEST,
            Some(&body),
            None,
            TransportMode::Unauthenticated,
        );
        assert!(matches!(
            error,
            RelayError::Upstream(UpstreamError::RateLimited { .. })
        ));
    }

    #[test]
    fn test_http_429_is_rate_limited_with_retry_after() {
        let error = classify_failure(
            StatusCode::TOO_MANY_REQUESTS,
            None,
            Some(Duration::from_secs(30)),
            TransportMode::Authenticated,
        );
        match error {
            RelayError::Upstream(UpstreamError::RateLimited { mode, backoff }) => {
                assert_eq!(mode, TransportMode::Authenticated);
                assert_eq!(backoff, Some(Duration::from_secs(30)));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_parameter_envelope_is_validation() {
        let body = json!({
            "error_id": 400,
            "error_name": "bad_parameter",
            "error_message": "sort does not exist"
        });
        let error = classify_failure(
            StatusCode::BAD_REQUEST,
            Some(&body),
            None,
            TransportMode::Unauthenticated,
        );
        assert!(matches!(
            error,
            RelayError::Validation(ValidationError::UpstreamRejected { status: 400, .. })
        ));
    }

    #[test]
    fn test_server_errors_map_to_server_variant() {
        let error = classify_failure(
            StatusCode::BAD_GATEWAY,
            None,
            None,
            TransportMode::Unauthenticated,
        );
        assert!(matches!(
            error,
            RelayError::Upstream(UpstreamError::Server { status: 502, .. })
        ));
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let config = RelayConfig::default().with_api_key("secret-key");
        let client = StackExchangeClient::new(&config);
        let rendered = format!("{:?}", client);
        assert!(!rendered.contains("secret-key"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
