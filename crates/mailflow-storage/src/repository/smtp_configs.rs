//! SMTP configuration repository

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CreateSmtpConfig, SmtpServerConfig};

/// SMTP configuration repository
#[derive(Clone)]
pub struct SmtpConfigRepository {
    pool: PgPool,
}

impl SmtpConfigRepository {
    /// Create a new SMTP config repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a config. Marking one default clears the previous default.
    pub async fn create(&self, input: CreateSmtpConfig) -> Result<SmtpServerConfig, sqlx::Error> {
        let id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        if input.is_default {
            sqlx::query("UPDATE smtp_configs SET is_default = FALSE WHERE is_default = TRUE")
                .execute(&mut *tx)
                .await?;
        }

        let config = sqlx::query_as::<_, SmtpServerConfig>(
            r#"
            INSERT INTO smtp_configs (
                id, name, host, port, username, password, use_tls, use_starttls, is_default
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(&input.host)
        .bind(input.port)
        .bind(&input.username)
        .bind(&input.password)
        .bind(input.use_tls)
        .bind(input.use_starttls)
        .bind(input.is_default)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(config)
    }

    /// Get an active config by ID
    pub async fn get_active(&self, id: Uuid) -> Result<Option<SmtpServerConfig>, sqlx::Error> {
        sqlx::query_as::<_, SmtpServerConfig>(
            "SELECT * FROM smtp_configs WHERE id = $1 AND is_active = TRUE",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Get the default active config
    pub async fn get_default(&self) -> Result<Option<SmtpServerConfig>, sqlx::Error> {
        sqlx::query_as::<_, SmtpServerConfig>(
            "SELECT * FROM smtp_configs WHERE is_default = TRUE AND is_active = TRUE",
        )
        .fetch_optional(&self.pool)
        .await
    }

    /// Get any active config, oldest first for stability
    pub async fn get_any_active(&self) -> Result<Option<SmtpServerConfig>, sqlx::Error> {
        sqlx::query_as::<_, SmtpServerConfig>(
            "SELECT * FROM smtp_configs WHERE is_active = TRUE ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
    }

    /// Resolve the config for a send: explicit job-level choice, else the
    /// default, else any active config. None means no config exists at all.
    pub async fn resolve(
        &self,
        explicit: Option<Uuid>,
    ) -> Result<Option<SmtpServerConfig>, sqlx::Error> {
        if let Some(id) = explicit {
            if let Some(config) = self.get_active(id).await? {
                return Ok(Some(config));
            }
        }

        if let Some(config) = self.get_default().await? {
            return Ok(Some(config));
        }

        self.get_any_active().await
    }
}
