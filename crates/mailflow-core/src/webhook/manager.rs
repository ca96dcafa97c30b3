//! Webhook Service - CRUD, connectivity test, stats, manual retry

use chrono::{Duration, Utc};
use mailflow_common::types::Event;
use mailflow_storage::models::{CreateWebhook, UpdateWebhook, Webhook};
use mailflow_storage::repository::{DeliveryRepository, DeliveryStats, WebhookRepository};
use mailflow_storage::SecretCipher;
use reqwest::Url;
use sqlx::PgPool;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::auth::WebhookAuth;
use super::dispatcher::WebhookJob;
use super::sender::{WebhookResponse, WebhookSender};
use crate::queue::{EnqueueOptions, JobQueue};

/// Webhook service errors
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Webhook not found")]
    NotFound,

    #[error("Delivery not found")]
    DeliveryNotFound,

    #[error("Delivery is not in a retryable state")]
    NotRetryable,

    #[error("Invalid webhook URL: {0}")]
    InvalidUrl(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] mailflow_common::Error),
}

/// Create webhook request; the credential arrives in plaintext and is
/// encrypted before it touches the database
#[derive(Debug, Clone)]
pub struct CreateWebhookRequest {
    pub user_id: Option<Uuid>,
    pub name: String,
    pub url: String,
    pub events: Vec<Event>,
    pub auth_type: String,
    pub auth_header: Option<String>,
    pub auth_value: Option<String>,
    pub timeout_secs: Option<i32>,
    pub max_retries: Option<i32>,
    pub campaign_filter: Vec<Uuid>,
}

/// Update webhook request; None fields keep their current value
#[derive(Debug, Clone, Default)]
pub struct UpdateWebhookRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub events: Option<Vec<Event>>,
    pub auth_type: Option<String>,
    pub auth_header: Option<String>,
    pub auth_value: Option<String>,
    pub timeout_secs: Option<i32>,
    pub max_retries: Option<i32>,
    pub campaign_filter: Option<Vec<Uuid>>,
    pub is_active: Option<bool>,
}

/// Webhook Service
pub struct WebhookService {
    webhooks: WebhookRepository,
    deliveries: DeliveryRepository,
    queue: Arc<JobQueue>,
    sender: Arc<WebhookSender>,
    cipher: SecretCipher,
    default_timeout_secs: i32,
}

impl WebhookService {
    /// Create a new webhook service over the webhook queue
    pub fn new(
        pool: PgPool,
        queue: Arc<JobQueue>,
        sender: Arc<WebhookSender>,
        cipher: SecretCipher,
        default_timeout_secs: i32,
    ) -> Self {
        Self {
            webhooks: WebhookRepository::new(pool.clone()),
            deliveries: DeliveryRepository::new(pool),
            queue,
            sender,
            cipher,
            default_timeout_secs,
        }
    }

    /// Register a webhook
    pub async fn create_webhook(
        &self,
        request: CreateWebhookRequest,
    ) -> Result<Webhook, WebhookError> {
        validate_webhook_url(&request.url)?;

        if request.events.is_empty() {
            return Err(WebhookError::Validation(
                "Webhook must subscribe to at least one event".to_string(),
            ));
        }

        // Fails fast on a scheme/credential mismatch
        WebhookAuth::from_parts(
            &request.auth_type,
            request.auth_header.as_deref(),
            request.auth_value.as_deref(),
        )?;

        let auth_value = match &request.auth_value {
            Some(plain) => Some(self.cipher.encrypt(plain)?),
            None => None,
        };

        let webhook = self
            .webhooks
            .create(CreateWebhook {
                user_id: request.user_id,
                name: request.name,
                url: request.url,
                events: request.events,
                auth_type: request.auth_type,
                auth_header: request.auth_header,
                auth_value,
                timeout_secs: request.timeout_secs.unwrap_or(self.default_timeout_secs),
                max_retries: request.max_retries.unwrap_or(3),
                campaign_filter: request.campaign_filter,
            })
            .await?;

        info!(webhook = %webhook.id, url = %webhook.url, "Webhook created");
        Ok(webhook)
    }

    /// Update a webhook
    pub async fn update_webhook(
        &self,
        id: Uuid,
        request: UpdateWebhookRequest,
    ) -> Result<Webhook, WebhookError> {
        if let Some(url) = &request.url {
            validate_webhook_url(url)?;
        }

        let auth_value = match &request.auth_value {
            Some(plain) => Some(self.cipher.encrypt(plain)?),
            None => None,
        };

        self.webhooks
            .update(
                id,
                UpdateWebhook {
                    name: request.name,
                    url: request.url,
                    events: request.events,
                    auth_type: request.auth_type,
                    auth_header: request.auth_header,
                    auth_value,
                    timeout_secs: request.timeout_secs,
                    max_retries: request.max_retries,
                    campaign_filter: request.campaign_filter,
                    is_active: request.is_active,
                },
            )
            .await?
            .ok_or(WebhookError::NotFound)
    }

    /// Delete a webhook and its delivery history
    pub async fn delete_webhook(&self, id: Uuid) -> Result<(), WebhookError> {
        if !self.webhooks.delete(id).await? {
            return Err(WebhookError::NotFound);
        }
        info!(webhook = %id, "Webhook deleted");
        Ok(())
    }

    /// Get a webhook
    pub async fn get_webhook(&self, id: Uuid) -> Result<Webhook, WebhookError> {
        self.webhooks.get(id).await?.ok_or(WebhookError::NotFound)
    }

    /// Synchronous, non-persisted delivery of a synthetic payload for
    /// connectivity checks
    pub async fn test_webhook(&self, id: Uuid) -> Result<WebhookResponse, WebhookError> {
        let webhook = self.get_webhook(id).await?;

        let credential = match &webhook.auth_value {
            Some(encrypted) => Some(self.cipher.decrypt(encrypted)?),
            None => None,
        };
        let auth = WebhookAuth::from_parts(
            &webhook.auth_type,
            webhook.auth_header.as_deref(),
            credential.as_deref(),
        )?;

        let payload = serde_json::json!({
            "event": "webhook.test",
            "timestamp": Utc::now().to_rfc3339(),
            "data": { "webhook_id": webhook.id },
        });

        let timeout = std::time::Duration::from_secs(webhook.timeout_secs.max(1) as u64);
        Ok(self
            .sender
            .deliver(&webhook.url, &payload, &auth, timeout)
            .await)
    }

    /// Reset a failed delivery and queue a fresh first attempt
    pub async fn retry_delivery(&self, delivery_id: Uuid) -> Result<(), WebhookError> {
        let delivery = self
            .deliveries
            .get(delivery_id)
            .await?
            .ok_or(WebhookError::DeliveryNotFound)?;

        if !self.deliveries.reset_for_retry(delivery_id).await? {
            return Err(WebhookError::NotRetryable);
        }

        let webhook = self.get_webhook(delivery.webhook_id).await?;

        let job = WebhookJob {
            delivery_id,
            webhook_id: webhook.id,
            campaign_id: None,
        };

        self.queue
            .enqueue(
                &job,
                EnqueueOptions {
                    max_attempts: Some(webhook.max_retries + 1),
                    // The original key may still exist on the settled job
                    idempotency_key: Some(format!(
                        "webhook:{}:retry:{}",
                        delivery_id,
                        Utc::now().timestamp()
                    )),
                    ..Default::default()
                },
            )
            .await
            .map_err(WebhookError::Internal)?;

        info!(delivery = %delivery_id, "Delivery queued for manual retry");
        Ok(())
    }

    /// Delivery status counts over a trailing window
    pub async fn get_delivery_stats(
        &self,
        webhook_id: Uuid,
        period: Duration,
    ) -> Result<DeliveryStats, WebhookError> {
        let since = Utc::now() - period;
        Ok(self.deliveries.stats(webhook_id, since).await?)
    }
}

/// Validate a webhook URL to prevent SSRF.
///
/// Rejects non-HTTP(S) schemes, loopback and private addresses, link-local
/// ranges, and obviously internal hostnames.
pub fn validate_webhook_url(url_str: &str) -> Result<(), WebhookError> {
    let url =
        Url::parse(url_str).map_err(|e| WebhookError::InvalidUrl(format!("{}: {}", url_str, e)))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(WebhookError::InvalidUrl(format!(
                "scheme '{}' is not allowed",
                scheme
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| WebhookError::InvalidUrl("URL has no host".to_string()))?;

    let lower_host = host.to_lowercase();
    if lower_host == "localhost"
        || lower_host.ends_with(".local")
        || lower_host.ends_with(".internal")
        || lower_host == "metadata.google.internal"
    {
        return Err(WebhookError::InvalidUrl(format!(
            "host '{}' is internal",
            host
        )));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(WebhookError::InvalidUrl(format!(
                "IP '{}' is in a private range",
                ip
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved range
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                || (ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                || (ipv6.segments()[0] & 0xfe00) == 0xfc00
                || (ipv6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_public_https() {
        assert!(validate_webhook_url("https://hooks.example.com/in").is_ok());
        assert!(validate_webhook_url("http://api.example.org:8443/x").is_ok());
    }

    #[test]
    fn test_rejects_non_http_schemes() {
        assert!(validate_webhook_url("ftp://example.com/x").is_err());
        assert!(validate_webhook_url("file:///etc/passwd").is_err());
    }

    #[test]
    fn test_rejects_internal_hosts() {
        assert!(validate_webhook_url("http://localhost/hook").is_err());
        assert!(validate_webhook_url("http://svc.internal/hook").is_err());
        assert!(validate_webhook_url("http://metadata.google.internal/").is_err());
    }

    #[test]
    fn test_rejects_private_ips() {
        assert!(validate_webhook_url("http://127.0.0.1/hook").is_err());
        assert!(validate_webhook_url("http://10.1.2.3/hook").is_err());
        assert!(validate_webhook_url("http://192.168.1.1/hook").is_err());
        assert!(validate_webhook_url("http://169.254.169.254/meta").is_err());
        assert!(validate_webhook_url("http://[::1]/hook").is_err());
    }

    #[test]
    fn test_accepts_public_ip() {
        assert!(validate_webhook_url("http://93.184.216.34/hook").is_ok());
    }
}
