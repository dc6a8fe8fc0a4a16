//! HTTP client for signed webhook delivery.
//!
//! One [`WebhookDeliveryService`] owns a pooled `reqwest` client that never
//! follows redirects and resolves names through the SSRF-checking
//! [`GuardedResolver`]. Each call to [`WebhookDeliveryService::deliver`]
//! re-validates the destination, signs the canonical envelope and classifies
//! the outcome into a [`DeliveryResult`].

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bastion_core::{DeliveryAttemptId, Event, EventId, WebhookEndpoint, WebhookEndpointId};
use chrono::{DateTime, Utc};
use reqwest::{header, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    signing::{self, SIGNATURE_HEADER},
    url_guard::{GuardedResolver, UrlValidationError, UrlValidator},
};

/// Header naming the event type.
pub const EVENT_HEADER: &str = "X-Bastion-Event";
/// Header carrying the delivery attempt id.
pub const DELIVERY_HEADER: &str = "X-Bastion-Delivery";
/// Header carrying the 1-based attempt number.
pub const ATTEMPT_HEADER: &str = "X-Bastion-Attempt";

/// Envelope schema version sent as `api_version`.
pub const API_VERSION: &str = "2024-06-01";

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Configuration for the delivery client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Bound on the full request and response.
    pub timeout: Duration,
    /// Bound on establishing the connection.
    pub connect_timeout: Duration,
    /// `User-Agent` header value.
    pub user_agent: String,
    /// Response bytes kept for the delivery record.
    pub max_response_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("Bastion-Webhooks/{}", env!("CARGO_PKG_VERSION")),
            max_response_size: 10 * 1024,
        }
    }
}

/// Everything needed to send one delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Delivery attempt id.
    pub delivery_id: DeliveryAttemptId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Receiving endpoint.
    pub webhook_id: WebhookEndpointId,
    /// Destination URL.
    pub url: String,
    /// Signing secret of the endpoint.
    pub secret: String,
    /// Event type.
    pub event_type: String,
    /// Event payload, sent as `data`.
    pub payload: serde_json::Value,
    /// When the event was created.
    pub created_at: DateTime<Utc>,
    /// Endpoint metadata, sent as `metadata`.
    pub metadata: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl DeliveryRequest {
    /// Builds the request for `event` to `endpoint`.
    pub fn new(
        endpoint: &WebhookEndpoint,
        event: &Event,
        delivery_id: DeliveryAttemptId,
        attempt: u32,
    ) -> Self {
        Self {
            delivery_id,
            event_id: event.id,
            webhook_id: endpoint.id,
            url: endpoint.url.clone(),
            secret: endpoint.secret.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            created_at: event.created_at,
            metadata: endpoint.metadata.clone(),
            attempt,
        }
    }

    /// Canonical body sent to the receiver.
    pub fn envelope(&self) -> Envelope<'_> {
        Envelope {
            id: self.event_id,
            event_type: &self.event_type,
            created: self.created_at,
            api_version: API_VERSION,
            delivery: DeliveryInfo {
                id: self.delivery_id,
                attempt: self.attempt,
                webhook_id: self.webhook_id,
            },
            data: &self.payload,
            metadata: &self.metadata,
        }
    }
}

/// Webhook body as received by endpoints.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    /// Event id.
    pub id: EventId,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: &'a str,
    /// Event creation time, RFC 3339.
    pub created: DateTime<Utc>,
    /// Envelope schema version.
    pub api_version: &'a str,
    /// Attempt identification.
    pub delivery: DeliveryInfo,
    /// Event payload.
    pub data: &'a serde_json::Value,
    /// Endpoint metadata.
    pub metadata: &'a serde_json::Value,
}

/// `delivery` object of the envelope.
#[derive(Debug, Serialize)]
pub struct DeliveryInfo {
    /// Delivery attempt id.
    pub id: DeliveryAttemptId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Receiving endpoint.
    pub webhook_id: WebhookEndpointId,
}

/// Classified outcome of one delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Receiver answered 2xx.
    pub success: bool,
    /// Response status, if a response arrived.
    pub status_code: Option<u16>,
    /// Response body, truncated to the configured size.
    pub response_body: Option<String>,
    /// Failure classification, if not successful.
    pub error: Option<DeliveryError>,
    /// Whether another attempt could succeed.
    pub should_retry: bool,
    /// Wall time spent on the attempt.
    pub duration: Duration,
}

impl DeliveryResult {
    fn delivered(status_code: u16, response_body: String, duration: Duration) -> Self {
        Self {
            success: true,
            status_code: Some(status_code),
            response_body: Some(response_body),
            error: None,
            should_retry: false,
            duration,
        }
    }

    fn failed(error: DeliveryError, response_body: Option<String>, duration: Duration) -> Self {
        Self {
            success: false,
            status_code: error.status_code(),
            response_body,
            should_retry: error.is_retryable(),
            error: Some(error),
            duration,
        }
    }

    /// Error rendered for storage, if any.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// Signs and sends webhooks over a shared connection pool.
#[derive(Debug, Clone)]
pub struct WebhookDeliveryService {
    client: reqwest::Client,
    validator: Arc<UrlValidator>,
    config: ClientConfig,
}

impl WebhookDeliveryService {
    /// Creates the service and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig, validator: Arc<UrlValidator>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .dns_resolver(Arc::new(GuardedResolver::new(validator.clone())))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, validator, config })
    }

    /// Validator used before every send.
    pub fn validator(&self) -> &Arc<UrlValidator> {
        &self.validator
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends one delivery attempt and classifies the outcome.
    ///
    /// Never returns an error: every failure is folded into the result so the
    /// caller can record it.
    pub async fn deliver(&self, request: &DeliveryRequest) -> DeliveryResult {
        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            event_id = %request.event_id,
            endpoint_id = %request.webhook_id,
            attempt = request.attempt,
        );

        async move {
            let started = Instant::now();
            let result = match self.send(request).await {
                Ok(response) => self.classify(response, started).await,
                Err(error) => DeliveryResult::failed(error, None, started.elapsed()),
            };

            match &result.error {
                None => info!(
                    status = result.status_code,
                    duration_ms = result.duration.as_millis() as u64,
                    "webhook delivered"
                ),
                Some(error) => warn!(
                    status = result.status_code,
                    should_retry = result.should_retry,
                    duration_ms = result.duration.as_millis() as u64,
                    error = %error,
                    "webhook delivery failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<Response> {
        let validated = self.validator.validate(&request.url).await?;
        debug!(host = %validated.host, "destination re-validated");

        let body = serde_json::to_vec(&request.envelope())
            .map_err(|e| DeliveryError::payload(format!("cannot serialize envelope: {e}")))?;
        let signature = signing::sign(&request.secret, &body)?;

        self.client
            .post(validated.url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, &request.event_type)
            .header(DELIVERY_HEADER, request.delivery_id.to_string())
            .header(ATTEMPT_HEADER, request.attempt.to_string())
            .body(body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))
    }

    async fn classify(&self, response: Response, started: Instant) -> DeliveryResult {
        let status = response.status();
        let retry_after = retry_after_seconds(response.headers());
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = self.read_body(response).await;
        let duration = started.elapsed();

        if status.is_success() {
            DeliveryResult::delivered(status.as_u16(), body, duration)
        } else {
            let error = DeliveryError::from_status(status.as_u16(), retry_after, location);
            DeliveryResult::failed(error, Some(body), duration)
        }
    }

    /// Reads at most `max_response_size` bytes, then stops.
    async fn read_body(&self, mut response: Response) -> String {
        let limit = self.config.max_response_size;
        let mut buffer = Vec::new();
        let mut truncated = false;

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let room = limit.saturating_sub(buffer.len());
                    if chunk.len() > room {
                        buffer.extend_from_slice(&chunk[..room]);
                        truncated = true;
                        break;
                    }
                    buffer.extend_from_slice(&chunk);
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read response body");
                    return format!("[failed to read response body: {e}]");
                },
            }
        }

        let mut body = String::from_utf8_lossy(&buffer).into_owned();
        if truncated {
            body.push_str(TRUNCATION_SUFFIX);
        }
        body
    }

    fn transport_error(&self, error: &reqwest::Error) -> DeliveryError {
        if let Some(rejection) = find_validation_error(error) {
            return DeliveryError::UnsafeUrl(rejection.clone());
        }
        if error.is_timeout() {
            return DeliveryError::timeout(self.config.timeout);
        }
        if error.is_connect() {
            return DeliveryError::network(format!("connection failed: {error}"));
        }
        DeliveryError::network(error.to_string())
    }
}

/// Finds a connect-time SSRF rejection in the error's source chain.
fn find_validation_error(error: &reqwest::Error) -> Option<&UrlValidationError> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(error);
    while let Some(err) = source {
        if let Some(rejection) = err.downcast_ref::<UrlValidationError>() {
            return Some(rejection);
        }
        source = err.source();
    }
    None
}

/// Parses `Retry-After` as delta-seconds or an HTTP date.
pub fn retry_after_seconds(headers: &header::HeaderMap) -> Option<u64> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    let remaining = at.signed_duration_since(Utc::now()).to_std().unwrap_or_default();
    Some(remaining.as_secs())
}

#[cfg(test)]
mod tests {
    use bastion_core::Event;
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::url_guard::{UrlPolicy, ValidationCode};

    fn service(config: ClientConfig, policy: UrlPolicy) -> WebhookDeliveryService {
        WebhookDeliveryService::new(config, Arc::new(UrlValidator::new(policy))).unwrap()
    }

    fn dev_service() -> WebhookDeliveryService {
        service(ClientConfig::default(), UrlPolicy::development())
    }

    fn request(url: String) -> DeliveryRequest {
        let endpoint = WebhookEndpoint::new("acct_1", url, "whsec_test", vec!["*".into()]);
        let event = Event::new("message.completed", json!({"conversation": "c_1"}));
        DeliveryRequest::new(&endpoint, &event, DeliveryAttemptId::new(), 1)
    }

    #[tokio::test]
    async fn success_is_recorded_with_body() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let result = dev_service().deliver(&request(format!("{}/hook", server.uri()))).await;

        assert!(result.success);
        assert_eq!(result.status_code, Some(200));
        assert_eq!(result.response_body.as_deref(), Some("ok"));
        assert!(!result.should_retry);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn status_classes_drive_should_retry() {
        let cases = [(503, true), (500, true), (429, true), (404, false), (400, false)];
        for (status, retry) in cases {
            let server = MockServer::start().await;
            Mock::given(matchers::method("POST"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let result = dev_service().deliver(&request(server.uri())).await;
            assert!(!result.success, "{status}");
            assert_eq!(result.status_code, Some(status), "{status}");
            assert_eq!(result.should_retry, retry, "{status}");
        }
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let server = MockServer::start().await;
        Mock::given(matchers::path("/old"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "http://169.254.169.254/"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let result = dev_service().deliver(&request(format!("{}/old", server.uri()))).await;

        assert!(!result.should_retry);
        assert!(matches!(result.error, Some(DeliveryError::Redirect { status_code: 302, .. })));
        assert!(result.error_message().unwrap().contains("redirect not followed"));
    }

    #[tokio::test]
    async fn request_is_signed_and_enveloped() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::header(EVENT_HEADER, "message.completed"))
            .and(matchers::header(ATTEMPT_HEADER, "1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let req = request(server.uri());
        let result = dev_service().deliver(&req).await;
        assert!(result.success);

        let received = server.received_requests().await.unwrap();
        let sent = &received[0];
        let signature = sent.headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
        assert!(signing::verify("whsec_test", &sent.body, signature));

        let user_agent = sent.headers.get("user-agent").unwrap().to_str().unwrap();
        assert!(user_agent.starts_with("Bastion-Webhooks/"));

        let body: serde_json::Value = serde_json::from_slice(&sent.body).unwrap();
        assert_eq!(body["type"], "message.completed");
        assert_eq!(body["api_version"], API_VERSION);
        assert_eq!(body["data"]["conversation"], "c_1");
        assert_eq!(body["delivery"]["attempt"], 1);
        assert_eq!(body["delivery"]["id"], req.delivery_id.to_string());
        assert_eq!(body["delivery"]["webhook_id"], req.webhook_id.to_string());
    }

    #[tokio::test]
    async fn long_bodies_are_truncated() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(5000)))
            .mount(&server)
            .await;

        let config = ClientConfig { max_response_size: 100, ..ClientConfig::default() };
        let service = service(config, UrlPolicy::development());
        let result = service.deliver(&request(server.uri())).await;

        let body = result.response_body.unwrap();
        assert_eq!(body.len(), 100 + TRUNCATION_SUFFIX.len());
        assert!(body.ends_with(TRUNCATION_SUFFIX));
    }

    #[tokio::test]
    async fn slow_receiver_times_out_and_retries() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let config =
            ClientConfig { timeout: Duration::from_millis(200), ..ClientConfig::default() };
        let service = service(config, UrlPolicy::development());
        let result = service.deliver(&request(server.uri())).await;

        assert!(matches!(result.error, Some(DeliveryError::Timeout { .. })));
        assert!(result.should_retry);
        assert_eq!(result.status_code, None);
    }

    #[tokio::test]
    async fn unsafe_url_fails_without_sending() {
        let service = service(ClientConfig::default(), UrlPolicy::default());
        let result = service.deliver(&request("https://192.168.1.5/hook".into())).await;

        assert!(!result.should_retry);
        match result.error {
            Some(DeliveryError::UnsafeUrl(e)) => {
                assert_eq!(e.code, ValidationCode::PrivateIpBlocked);
            },
            other => panic!("expected unsafe url, got {other:?}"),
        }
    }

    #[test]
    fn retry_after_parsing() {
        let mut headers = header::HeaderMap::new();
        assert_eq!(retry_after_seconds(&headers), None);

        headers.insert(header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(retry_after_seconds(&headers), Some(120));

        headers.insert(header::RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after_seconds(&headers), Some(0));

        headers.insert(header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(retry_after_seconds(&headers), None);
    }
}
