//! Webhook HTTP sender
//!
//! One shared reqwest client performs every delivery; the queue worker and
//! the synchronous connectivity test both go through it.

use chrono::Utc;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::auth::WebhookAuth;

/// Captured response bodies are cut at this length
const RESPONSE_TRUNCATE_LEN: usize = 1000;

/// Outcome of one delivery attempt
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: Option<u16>,
    pub body: Option<String>,
    pub error: Option<String>,
}

impl WebhookResponse {
    /// 2xx means delivered
    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|s| (200..300).contains(&s))
    }

    /// Human-readable failure reason
    pub fn failure_reason(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        match self.status {
            Some(status) => format!("endpoint returned status {}", status),
            None => "no response".to_string(),
        }
    }
}

/// Webhook HTTP sender
pub struct WebhookSender {
    http: Client,
}

impl WebhookSender {
    /// Create a sender with the given User-Agent
    pub fn new(user_agent: &str) -> Self {
        let http = Client::builder()
            .user_agent(user_agent)
            .build()
            .expect("Failed to create HTTP client");

        Self { http }
    }

    /// POST the payload with the configured auth and timeout
    pub async fn deliver(
        &self,
        url: &str,
        payload: &serde_json::Value,
        auth: &WebhookAuth,
        timeout: Duration,
    ) -> WebhookResponse {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                return WebhookResponse {
                    status: None,
                    body: None,
                    error: Some(format!("unserializable payload: {}", e)),
                };
            }
        };

        let timestamp = Utc::now().timestamp();

        let request = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .timeout(timeout);
        let request = auth.apply(request, &body, timestamp).body(body);

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.ok().map(|text| {
                    let mut text = text;
                    text.truncate(RESPONSE_TRUNCATE_LEN);
                    text
                });

                debug!(url, status, "Webhook delivery attempt finished");

                WebhookResponse {
                    status: Some(status),
                    body,
                    error: None,
                }
            }
            Err(e) => WebhookResponse {
                status: e.status().map(|s| s.as_u16()),
                body: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_successful_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let sender = WebhookSender::new("mailflow-test");
        let payload = serde_json::json!({"event": "email.sent"});
        let response = sender
            .deliver(
                &format!("{}/hook", server.uri()),
                &payload,
                &WebhookAuth::None,
                Duration::from_secs(5),
            )
            .await;

        assert!(response.is_success());
        assert_eq!(response.status, Some(200));
        assert_eq!(response.body.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_server_error_is_not_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sender = WebhookSender::new("mailflow-test");
        let response = sender
            .deliver(
                &server.uri(),
                &serde_json::json!({}),
                &WebhookAuth::None,
                Duration::from_secs(5),
            )
            .await;

        assert!(!response.is_success());
        assert_eq!(response.status, Some(500));
        assert_eq!(response.failure_reason(), "endpoint returned status 500");
    }

    #[tokio::test]
    async fn test_hmac_headers_present() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header_exists("X-Webhook-Signature"))
            .and(header_exists("X-Webhook-Timestamp"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let sender = WebhookSender::new("mailflow-test");
        let auth = WebhookAuth::Hmac {
            secret: "whsec_test".to_string(),
        };
        let response = sender
            .deliver(
                &server.uri(),
                &serde_json::json!({"event": "test"}),
                &auth,
                Duration::from_secs(5),
            )
            .await;

        // The mock only matches when both signature headers are present
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_bearer_header_present() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Authorization", "Bearer token-123"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sender = WebhookSender::new("mailflow-test");
        let auth = WebhookAuth::Bearer {
            token: "token-123".to_string(),
        };
        let response = sender
            .deliver(
                &server.uri(),
                &serde_json::json!({}),
                &auth,
                Duration::from_secs(5),
            )
            .await;

        assert!(response.is_success());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_error() {
        let sender = WebhookSender::new("mailflow-test");
        let response = sender
            .deliver(
                "http://127.0.0.1:1/hook",
                &serde_json::json!({}),
                &WebhookAuth::None,
                Duration::from_secs(1),
            )
            .await;

        assert!(!response.is_success());
        assert!(response.error.is_some());
    }
}
