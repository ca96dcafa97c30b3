//! Database models

use chrono::{DateTime, Utc};
use mailflow_common::types::{
    AbTestId, AbTestStatus, CampaignId, CampaignStatus, DeliveryStatus, Event, RecipientId,
    RecipientStatus, SmtpConfigId, UserId, VariantId, WebhookId, WinnerCriteria,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Queue job model
///
/// Jobs are transport, not a system of record: payloads reference campaign
/// and recipient rows but never own them.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub idempotency_key: Option<String>,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Whether the attempt budget allows another try
    pub fn attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// New job input
#[derive(Debug, Clone)]
pub struct NewJob {
    pub payload: serde_json::Value,
    pub priority: i32,
    pub max_attempts: i32,
    pub idempotency_key: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub subject: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub status: String,
    pub total_recipients: i32,
    pub sent_count: i32,
    pub bounced_count: i32,
    /// Bumped by each failed-recipient retry; part of the job idempotency key
    pub retry_epoch: i32,
    pub smtp_config_id: Option<SmtpConfigId>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Get status enum
    pub fn status_enum(&self) -> Option<CampaignStatus> {
        self.status.parse().ok()
    }

    /// Terminal recipients so far
    pub fn settled_count(&self) -> i32 {
        self.sent_count + self.bounced_count
    }
}

/// Create campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaign {
    pub name: String,
    pub subject: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub smtp_config_id: Option<SmtpConfigId>,
    pub metadata: Option<serde_json::Value>,
}

/// Recipient model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub campaign_id: CampaignId,
    pub email: String,
    pub name: Option<String>,
    pub status: String,
    pub variant_id: Option<VariantId>,
    pub tracking_id: Uuid,
    pub merge_fields: serde_json::Value,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recipient {
    /// Get status enum
    pub fn status_enum(&self) -> Option<RecipientStatus> {
        self.status.parse().ok()
    }
}

/// Create recipient input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRecipient {
    pub campaign_id: CampaignId,
    pub email: String,
    pub name: Option<String>,
    pub merge_fields: Option<serde_json::Value>,
}

/// A/B test model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AbTest {
    pub id: AbTestId,
    pub campaign_id: CampaignId,
    pub sample_size_percent: i32,
    pub winner_criteria: String,
    pub test_duration_hours: i32,
    pub auto_select_winner: bool,
    pub status: String,
    pub winner_id: Option<VariantId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AbTest {
    /// Get status enum
    pub fn status_enum(&self) -> Option<AbTestStatus> {
        self.status.parse().ok()
    }

    /// Get winner criteria enum
    pub fn criteria_enum(&self) -> Option<WinnerCriteria> {
        self.winner_criteria.parse().ok()
    }
}

/// Create A/B test input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAbTest {
    pub campaign_id: CampaignId,
    pub sample_size_percent: i32,
    pub winner_criteria: WinnerCriteria,
    pub test_duration_hours: i32,
    pub auto_select_winner: bool,
}

/// A/B test variant model
///
/// Content fields are overrides; a None falls back to the campaign default
/// for that field. Counters only ever increase.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AbTestVariant {
    pub id: VariantId,
    pub test_id: AbTestId,
    pub name: String,
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub sent_count: i32,
    pub opened_count: i32,
    pub clicked_count: i32,
    pub converted_count: i32,
    pub bounced_count: i32,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AbTestVariant {
    /// Rate for the given winner criterion, against sends
    pub fn rate_for(&self, criteria: WinnerCriteria) -> f64 {
        if self.sent_count == 0 {
            return 0.0;
        }
        let numerator = match criteria {
            WinnerCriteria::OpenRate => self.opened_count,
            WinnerCriteria::ClickRate => self.clicked_count,
            WinnerCriteria::ConversionRate => self.converted_count,
        };
        numerator as f64 / self.sent_count as f64
    }
}

/// Create variant input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVariant {
    pub test_id: AbTestId,
    pub name: String,
    pub subject: Option<String>,
    pub from_name: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub sort_order: i32,
}

/// Webhook subscription model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub user_id: Option<UserId>,
    pub name: String,
    pub url: String,
    /// Subscribed event names as a JSON string array
    pub events: serde_json::Value,
    /// One of: none, basic, bearer, api_key, hmac
    pub auth_type: String,
    pub auth_header: Option<String>,
    /// Credential, encrypted at rest
    pub auth_value: Option<String>,
    pub timeout_secs: i32,
    pub max_retries: i32,
    /// Campaign ids this webhook is scoped to; empty matches everything
    pub campaign_filter: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    /// Subscribed events as a vector
    pub fn events_vec(&self) -> Vec<String> {
        serde_json::from_value(self.events.clone()).unwrap_or_default()
    }

    /// Campaign filter as a vector
    pub fn campaign_filter_vec(&self) -> Vec<CampaignId> {
        serde_json::from_value(self.campaign_filter.clone()).unwrap_or_default()
    }

    /// Whether this webhook accepts events for the given campaign.
    /// An empty filter list matches everything.
    pub fn matches_campaign(&self, campaign_id: Option<CampaignId>) -> bool {
        let filter = self.campaign_filter_vec();
        if filter.is_empty() {
            return true;
        }
        match campaign_id {
            Some(id) => filter.contains(&id),
            None => true,
        }
    }
}

/// Create webhook input; auth_value arrives already encrypted
#[derive(Debug, Clone)]
pub struct CreateWebhook {
    pub user_id: Option<UserId>,
    pub name: String,
    pub url: String,
    pub events: Vec<Event>,
    pub auth_type: String,
    pub auth_header: Option<String>,
    pub auth_value: Option<String>,
    pub timeout_secs: i32,
    pub max_retries: i32,
    pub campaign_filter: Vec<CampaignId>,
}

/// Update webhook input; None leaves the column unchanged
#[derive(Debug, Clone, Default)]
pub struct UpdateWebhook {
    pub name: Option<String>,
    pub url: Option<String>,
    pub events: Option<Vec<Event>>,
    pub auth_type: Option<String>,
    pub auth_header: Option<String>,
    pub auth_value: Option<String>,
    pub timeout_secs: Option<i32>,
    pub max_retries: Option<i32>,
    pub campaign_filter: Option<Vec<CampaignId>>,
    pub is_active: Option<bool>,
}

/// Webhook delivery model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: WebhookId,
    pub event: String,
    /// Payload snapshot taken at fire time
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub status_code: Option<i32>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookDelivery {
    /// Get status enum
    pub fn status_enum(&self) -> Option<DeliveryStatus> {
        self.status.parse().ok()
    }
}

/// SMTP configuration model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SmtpServerConfig {
    pub id: SmtpConfigId,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub use_starttls: bool,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create SMTP configuration input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSmtpConfig {
    pub name: String,
    pub host: String,
    pub port: i32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub use_starttls: bool,
    pub is_default: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(sent: i32, opened: i32, clicked: i32, converted: i32) -> AbTestVariant {
        AbTestVariant {
            id: Uuid::new_v4(),
            test_id: Uuid::new_v4(),
            name: "A".to_string(),
            subject: None,
            from_name: None,
            html_body: None,
            text_body: None,
            sent_count: sent,
            opened_count: opened,
            clicked_count: clicked,
            converted_count: converted,
            bounced_count: 0,
            sort_order: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_variant_rates() {
        let v = variant(200, 50, 20, 5);
        assert_eq!(v.rate_for(WinnerCriteria::OpenRate), 0.25);
        assert_eq!(v.rate_for(WinnerCriteria::ClickRate), 0.10);
        assert_eq!(v.rate_for(WinnerCriteria::ConversionRate), 0.025);
    }

    #[test]
    fn test_variant_rate_no_sends() {
        let v = variant(0, 0, 0, 0);
        assert_eq!(v.rate_for(WinnerCriteria::OpenRate), 0.0);
    }

    #[test]
    fn test_webhook_campaign_filter() {
        let campaign = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut hook = Webhook {
            id: Uuid::new_v4(),
            user_id: None,
            name: "crm".to_string(),
            url: "https://example.com/hook".to_string(),
            events: serde_json::json!(["email.sent"]),
            auth_type: "none".to_string(),
            auth_header: None,
            auth_value: None,
            timeout_secs: 10,
            max_retries: 3,
            campaign_filter: serde_json::json!([]),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        // Empty filter matches everything
        assert!(hook.matches_campaign(Some(campaign)));
        assert!(hook.matches_campaign(None));

        hook.campaign_filter = serde_json::json!([campaign]);
        assert!(hook.matches_campaign(Some(campaign)));
        assert!(!hook.matches_campaign(Some(other)));
    }
}
