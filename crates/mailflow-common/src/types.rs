//! Common types for mailflow

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for recipients
pub type RecipientId = Uuid;

/// Unique identifier for A/B tests
pub type AbTestId = Uuid;

/// Unique identifier for A/B test variants
pub type VariantId = Uuid;

/// Unique identifier for webhooks
pub type WebhookId = Uuid;

/// Unique identifier for webhook deliveries
pub type DeliveryId = Uuid;

/// Unique identifier for queue jobs
pub type JobId = Uuid;

/// Unique identifier for SMTP configurations
pub type SmtpConfigId = Uuid;

/// Unique identifier for webhook owners
pub type UserId = Uuid;

/// Campaign lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Paused,
    Completed,
    Cancelled,
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Draft => write!(f, "draft"),
            CampaignStatus::Scheduled => write!(f, "scheduled"),
            CampaignStatus::Sending => write!(f, "sending"),
            CampaignStatus::Paused => write!(f, "paused"),
            CampaignStatus::Completed => write!(f, "completed"),
            CampaignStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "scheduled" => Ok(CampaignStatus::Scheduled),
            "sending" => Ok(CampaignStatus::Sending),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Per-recipient delivery status
///
/// Moves forward only: pending -> queued -> sent | failed. A failed
/// recipient returns to pending solely through the explicit retry
/// operation on the batching service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Queued,
    Sent,
    Failed,
}

impl std::fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipientStatus::Pending => write!(f, "pending"),
            RecipientStatus::Queued => write!(f, "queued"),
            RecipientStatus::Sent => write!(f, "sent"),
            RecipientStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RecipientStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecipientStatus::Pending),
            "queued" => Ok(RecipientStatus::Queued),
            "sent" => Ok(RecipientStatus::Sent),
            "failed" => Ok(RecipientStatus::Failed),
            _ => Err(format!("Invalid recipient status: {}", s)),
        }
    }
}

/// A/B test lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbTestStatus {
    Draft,
    Running,
    Completed,
    Cancelled,
}

impl std::fmt::Display for AbTestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbTestStatus::Draft => write!(f, "draft"),
            AbTestStatus::Running => write!(f, "running"),
            AbTestStatus::Completed => write!(f, "completed"),
            AbTestStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for AbTestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(AbTestStatus::Draft),
            "running" => Ok(AbTestStatus::Running),
            "completed" => Ok(AbTestStatus::Completed),
            "cancelled" => Ok(AbTestStatus::Cancelled),
            _ => Err(format!("Invalid A/B test status: {}", s)),
        }
    }
}

/// Metric used to pick the winning variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerCriteria {
    OpenRate,
    ClickRate,
    ConversionRate,
}

impl std::fmt::Display for WinnerCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WinnerCriteria::OpenRate => write!(f, "open_rate"),
            WinnerCriteria::ClickRate => write!(f, "click_rate"),
            WinnerCriteria::ConversionRate => write!(f, "conversion_rate"),
        }
    }
}

impl std::str::FromStr for WinnerCriteria {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open_rate" => Ok(WinnerCriteria::OpenRate),
            "click_rate" => Ok(WinnerCriteria::ClickRate),
            "conversion_rate" => Ok(WinnerCriteria::ConversionRate),
            _ => Err(format!("Invalid winner criteria: {}", s)),
        }
    }
}

/// Webhook delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Retrying,
}

impl DeliveryStatus {
    /// Delivered and failed are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Processing => write!(f, "processing"),
            DeliveryStatus::Delivered => write!(f, "delivered"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Retrying => write!(f, "retrying"),
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "processing" => Ok(DeliveryStatus::Processing),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            "retrying" => Ok(DeliveryStatus::Retrying),
            _ => Err(format!("Invalid delivery status: {}", s)),
        }
    }
}

/// Lifecycle events fanned out to webhook subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    EmailSent,
    EmailBounced,
    EmailOpened,
    EmailClicked,
    EmailFailed,
    CampaignStarted,
    CampaignCompleted,
    CampaignCancelled,
    AbWinnerSelected,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::EmailSent => write!(f, "email.sent"),
            Event::EmailBounced => write!(f, "email.bounced"),
            Event::EmailOpened => write!(f, "email.opened"),
            Event::EmailClicked => write!(f, "email.clicked"),
            Event::EmailFailed => write!(f, "email.failed"),
            Event::CampaignStarted => write!(f, "campaign.started"),
            Event::CampaignCompleted => write!(f, "campaign.completed"),
            Event::CampaignCancelled => write!(f, "campaign.cancelled"),
            Event::AbWinnerSelected => write!(f, "abtest.winner_selected"),
        }
    }
}

impl std::str::FromStr for Event {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email.sent" => Ok(Event::EmailSent),
            "email.bounced" => Ok(Event::EmailBounced),
            "email.opened" => Ok(Event::EmailOpened),
            "email.clicked" => Ok(Event::EmailClicked),
            "email.failed" => Ok(Event::EmailFailed),
            "campaign.started" => Ok(Event::CampaignStarted),
            "campaign.completed" => Ok(Event::CampaignCompleted),
            "campaign.cancelled" => Ok(Event::CampaignCancelled),
            "abtest.winner_selected" => Ok(Event::AbWinnerSelected),
            _ => Err(format!("Invalid event: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_campaign_status_roundtrip() {
        for s in ["draft", "scheduled", "sending", "paused", "completed", "cancelled"] {
            assert_eq!(CampaignStatus::from_str(s).unwrap().to_string(), s);
        }
        assert!(CampaignStatus::from_str("deleted").is_err());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(Event::EmailSent.to_string(), "email.sent");
        assert_eq!(Event::AbWinnerSelected.to_string(), "abtest.winner_selected");
        assert_eq!(Event::from_str("campaign.completed").unwrap(), Event::CampaignCompleted);
    }

    #[test]
    fn test_delivery_terminal_states() {
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Retrying.is_terminal());
    }
}
