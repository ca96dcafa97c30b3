//! Email Worker - Consumes email jobs: render, send, record, notify

mod worker;

pub use worker::EmailWorker;

use mailflow_common::types::{CampaignId, RecipientId, SmtpConfigId, VariantId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

/// Payload of one email-queue job, dispatched exhaustively by kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmailJob {
    /// Render and send one email to one recipient
    Send(SendEmailJob),
    /// Pick the A/B winner and release the held-back remainder. Queued with
    /// a delay at test launch so the schedule survives restarts.
    SelectAbWinner { test_id: Uuid },
}

/// One recipient's send, content snapshotted at enqueue time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendEmailJob {
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub email: String,
    pub subject: String,
    pub from_address: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
    pub merge_fields: serde_json::Value,
    pub tracking_id: Uuid,
    pub smtp_config_id: Option<SmtpConfigId>,
    pub variant_id: Option<VariantId>,
}

impl SendEmailJob {
    /// Stable identity key: campaign + recipient + retry epoch. Re-enqueueing
    /// the same logical send is a no-op; an explicit retry bumps the epoch.
    pub fn idempotency_key(&self, retry_epoch: i32) -> String {
        format!(
            "email:{}:{}:{}",
            self.campaign_id, self.recipient_id, retry_epoch
        )
    }

    /// Sender display form: "Name <addr>" when a name is set
    pub fn sender(&self) -> String {
        match &self.from_name {
            Some(name) => format!("{} <{}>", name, self.from_address),
            None => self.from_address.clone(),
        }
    }
}

/// Shared run/pause flags and the in-flight counter for a worker pool
pub struct WorkerState {
    running: AtomicBool,
    paused: AtomicBool,
    in_flight: AtomicUsize,
}

impl WorkerState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Stop the loop after the current tick
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Keep the loop alive but stop claiming jobs
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub(crate) fn job_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            running: self.is_running(),
            paused: self.is_paused(),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker status snapshot
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub paused: bool,
    pub in_flight: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_job(campaign: Uuid, recipient: Uuid) -> SendEmailJob {
        SendEmailJob {
            campaign_id: campaign,
            recipient_id: recipient,
            email: "ada@example.com".to_string(),
            subject: "hi".to_string(),
            from_address: "news@example.com".to_string(),
            from_name: Some("News".to_string()),
            reply_to: None,
            html_body: None,
            text_body: Some("hello".to_string()),
            merge_fields: serde_json::json!({}),
            tracking_id: Uuid::new_v4(),
            smtp_config_id: None,
            variant_id: None,
        }
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let campaign = Uuid::new_v4();
        let recipient = Uuid::new_v4();

        let a = send_job(campaign, recipient).idempotency_key(0);
        let b = send_job(campaign, recipient).idempotency_key(0);
        assert_eq!(a, b);

        // A retry epoch produces a distinct logical job
        assert_ne!(a, send_job(campaign, recipient).idempotency_key(1));
    }

    #[test]
    fn test_sender_display_form() {
        let campaign = Uuid::new_v4();
        let recipient = Uuid::new_v4();

        let mut job = send_job(campaign, recipient);
        assert_eq!(job.sender(), "News <news@example.com>");

        job.from_name = None;
        assert_eq!(job.sender(), "news@example.com");
    }

    #[test]
    fn test_job_payload_carries_campaign_id_at_top_level() {
        // The queue filters campaign jobs via payload ->> 'campaign_id'
        let job = EmailJob::Send(send_job(Uuid::new_v4(), Uuid::new_v4()));
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["kind"], "send");
        assert!(value.get("campaign_id").is_some());
    }

    #[test]
    fn test_worker_state_flags() {
        let state = WorkerState::new();
        assert!(state.is_running());
        assert!(!state.is_paused());

        state.pause();
        assert!(state.is_paused());
        state.resume();
        assert!(!state.is_paused());

        state.stop();
        assert!(!state.is_running());
    }
}
