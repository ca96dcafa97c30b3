//! Mailflow - Delivery pipeline entry point

use anyhow::Result;
use mailflow_common::config::Config;
use mailflow_core::{
    AbTestExecutor, CampaignService, EmailWorker, EventDispatcher, FallbackAdmission, JobQueue,
    SlidingWindow, WebhookSender, WebhookService, WebhookWorker,
};
use mailflow_core::smtp::RelayTransportFactory;
use mailflow_storage::{DatabasePool, SecretCipher};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Queue names; both live in the same durable store
const EMAIL_QUEUE: &str = "email";
const WEBHOOK_QUEUE: &str = "webhook";

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting mailflow delivery pipeline...");

    // Load configuration
    let config = Config::load()?;

    // Initialize database
    let db_pool = DatabasePool::connect(&config.database).await?;
    db_pool.migrate().await?;
    let pool = db_pool.pool().clone();

    // At-rest encryption for webhook credentials
    let cipher = SecretCipher::from_base64(&config.encryption.key)?;

    // The two durable queues share one store
    let email_queue = Arc::new(JobQueue::new(pool.clone(), EMAIL_QUEUE));
    let webhook_queue = Arc::new(JobQueue::new(pool.clone(), WEBHOOK_QUEUE));

    // Sliding-window admission, shared store with in-process fallback
    let smtp_admission = Arc::new(FallbackAdmission::new(
        pool.clone(),
        SlidingWindow::new(
            config.rate_limit.smtp_limit,
            Duration::from_millis(config.rate_limit.smtp_window_ms),
        ),
    ));
    let webhook_admission = Arc::new(FallbackAdmission::new(
        pool.clone(),
        SlidingWindow::new(
            config.rate_limit.webhook_limit,
            Duration::from_millis(config.rate_limit.webhook_window_ms),
        ),
    ));

    // Webhook delivery plumbing
    let sender = Arc::new(WebhookSender::new(&config.webhooks.user_agent));
    let dispatcher = Arc::new(EventDispatcher::new(pool.clone(), webhook_queue.clone()));
    let webhook_service = Arc::new(WebhookService::new(
        pool.clone(),
        webhook_queue.clone(),
        sender.clone(),
        cipher.clone(),
        config.webhooks.default_timeout_secs as i32,
    ));

    // Campaign orchestration
    let executor = Arc::new(AbTestExecutor::new(
        pool.clone(),
        email_queue.clone(),
        dispatcher.clone(),
    ));
    let campaign_service = Arc::new(CampaignService::new(
        pool.clone(),
        email_queue.clone(),
        dispatcher.clone(),
    ));

    // Worker pools
    let transports = Arc::new(RelayTransportFactory::new(Duration::from_secs(
        config.smtp.timeout_secs,
    )));

    let email_worker = Arc::new(
        EmailWorker::new(
            pool.clone(),
            email_queue.clone(),
            executor.clone(),
            dispatcher.clone(),
            smtp_admission.clone(),
            transports,
            &config.tracking.base_url,
        )
        .with_concurrency(config.queue.email_concurrency)
        .with_batch_size(config.queue.claim_batch_size)
        .with_poll_interval(config.queue.poll_interval_secs)
        .with_stalled_after(config.queue.stalled_after_secs)
        .with_retention(
            chrono_hours(config.queue.completed_retention_hours),
            chrono_days(config.queue.failed_retention_days),
        ),
    );

    let webhook_worker = Arc::new(
        WebhookWorker::new(
            pool.clone(),
            webhook_queue.clone(),
            sender,
            cipher,
            webhook_admission.clone(),
        )
        .with_concurrency(config.queue.webhook_concurrency)
        .with_batch_size(config.queue.claim_batch_size)
        .with_poll_interval(config.queue.poll_interval_secs)
        .with_stalled_after(config.queue.stalled_after_secs),
    );

    let email_handle = {
        let worker = email_worker.clone();
        tokio::spawn(async move {
            worker.run().await;
        })
    };

    let webhook_handle = {
        let worker = webhook_worker.clone();
        tokio::spawn(async move {
            worker.run().await;
        })
    };

    // Periodic sweep of expired rate-limit events
    let sweep_handle = {
        let smtp_admission = smtp_admission.clone();
        let webhook_admission = webhook_admission.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                ticker.tick().await;
                if let Err(e) = smtp_admission.sweep().await {
                    tracing::warn!("SMTP rate-window sweep failed: {}", e);
                }
                if let Err(e) = webhook_admission.sweep().await {
                    tracing::warn!("Webhook rate-window sweep failed: {}", e);
                }
            }
        })
    };

    // Keep the service handles alive for operational callers
    let _services = (campaign_service, executor, webhook_service);

    info!("Mailflow started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    email_worker.state().stop();
    webhook_worker.state().stop();
    sweep_handle.abort();

    let _ = email_handle.await;
    let _ = webhook_handle.await;

    info!("Mailflow shutdown complete");

    Ok(())
}

fn chrono_hours(hours: i64) -> chrono::Duration {
    chrono::Duration::hours(hours)
}

fn chrono_days(days: i64) -> chrono::Duration {
    chrono::Duration::days(days)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mailflow=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}
