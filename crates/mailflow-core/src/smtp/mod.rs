//! SMTP transport abstraction
//!
//! Sends go through the `MailTransport` trait so the worker can be exercised
//! against a fake in tests. The production implementation wraps lettre's
//! async SMTP transport, one instance per stored SMTP configuration.

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use mailflow_storage::models::SmtpServerConfig;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// A rendered email ready for the wire
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
}

/// Successful send result
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: String,
}

/// Transport failure, split by whether a retry can help
#[derive(Error, Debug)]
pub enum TransportError {
    /// Retrying later may succeed (4xx, connection trouble)
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Retrying cannot help (bad address, 5xx rejection)
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

/// Mail submission capability
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<SendOutcome, TransportError>;

    /// Probe connectivity to the relay
    async fn verify(&self) -> bool;
}

/// Production transport over a configured SMTP relay
pub struct SmtpRelayTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpRelayTransport {
    /// Build a transport from a stored SMTP configuration
    pub fn from_config(config: &SmtpServerConfig, timeout: Duration) -> Result<Self, TransportError> {
        let builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| TransportError::Transient(format!("relay setup failed: {}", e)))?
        } else if config.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| TransportError::Transient(format!("relay setup failed: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        let mut builder = builder.port(config.port as u16);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.timeout(Some(timeout)).build(),
        })
    }

    fn build_message(email: &OutboundEmail, message_id: &str) -> Result<Message, TransportError> {
        let from: Mailbox = email
            .from
            .parse()
            .map_err(|e| TransportError::Permanent(format!("invalid from address: {}", e)))?;
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| TransportError::Permanent(format!("invalid to address: {}", e)))?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(&email.subject)
            .message_id(Some(message_id.to_string()));

        if let Some(reply_to) = &email.reply_to {
            let mailbox: Mailbox = reply_to
                .parse()
                .map_err(|e| TransportError::Permanent(format!("invalid reply-to: {}", e)))?;
            builder = builder.reply_to(mailbox);
        }

        let message = match (&email.html, &email.text) {
            (Some(html), Some(text)) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(SinglePart::plain(text.clone()))
                    .singlepart(SinglePart::html(html.clone())),
            ),
            (Some(html), None) => builder.header(ContentType::TEXT_HTML).body(html.clone()),
            (None, Some(text)) => builder.header(ContentType::TEXT_PLAIN).body(text.clone()),
            (None, None) => {
                return Err(TransportError::Permanent("email has no body".to_string()));
            }
        };

        message.map_err(|e| TransportError::Permanent(format!("failed to build email: {}", e)))
    }

    /// Map a relay rejection onto the retry taxonomy. SMTP enhanced codes
    /// are buried in the error text, so this matches the way relays phrase
    /// them in practice.
    fn classify(error: &str) -> TransportError {
        let lower = error.to_lowercase();

        if error.contains("5.1.1")
            || error.contains("550")
            || error.contains("553")
            || lower.contains("user unknown")
            || lower.contains("does not exist")
        {
            TransportError::Permanent(error.to_string())
        } else {
            TransportError::Transient(error.to_string())
        }
    }
}

#[async_trait]
impl MailTransport for SmtpRelayTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<SendOutcome, TransportError> {
        let message_id = format!("<{}@mailflow>", Uuid::new_v4());
        let message = Self::build_message(email, &message_id)?;

        match self.mailer.send(message).await {
            Ok(response) => {
                debug!(to = %email.to, "Email accepted: {:?}", response.code());
                Ok(SendOutcome { message_id })
            }
            Err(e) => Err(Self::classify(&e.to_string())),
        }
    }

    async fn verify(&self) -> bool {
        self.mailer.test_connection().await.unwrap_or(false)
    }
}

/// Builds transports per stored SMTP configuration.
///
/// A trait so tests can substitute a fake transport for the worker.
pub trait TransportFactory: Send + Sync {
    fn transport_for(
        &self,
        config: &SmtpServerConfig,
    ) -> Result<std::sync::Arc<dyn MailTransport>, TransportError>;
}

/// Production factory with one cached relay transport per config
pub struct RelayTransportFactory {
    timeout: Duration,
    cache: std::sync::Mutex<std::collections::HashMap<Uuid, std::sync::Arc<SmtpRelayTransport>>>,
}

impl RelayTransportFactory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cache: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl TransportFactory for RelayTransportFactory {
    fn transport_for(
        &self,
        config: &SmtpServerConfig,
    ) -> Result<std::sync::Arc<dyn MailTransport>, TransportError> {
        let mut cache = self.cache.lock().expect("transport cache mutex poisoned");

        if let Some(transport) = cache.get(&config.id) {
            return Ok(std::sync::Arc::clone(transport) as std::sync::Arc<dyn MailTransport>);
        }

        let transport = std::sync::Arc::new(SmtpRelayTransport::from_config(config, self.timeout)?);
        cache.insert(config.id, std::sync::Arc::clone(&transport));
        Ok(transport as std::sync::Arc<dyn MailTransport>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_permanent() {
        assert!(matches!(
            SmtpRelayTransport::classify("550 5.1.1 User unknown"),
            TransportError::Permanent(_)
        ));
        assert!(matches!(
            SmtpRelayTransport::classify("553 mailbox does not exist"),
            TransportError::Permanent(_)
        ));
    }

    #[test]
    fn test_classify_transient() {
        assert!(matches!(
            SmtpRelayTransport::classify("451 4.7.1 try again later"),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            SmtpRelayTransport::classify("connection refused"),
            TransportError::Transient(_)
        ));
    }

    #[test]
    fn test_build_message_rejects_empty_body() {
        let email = OutboundEmail {
            from: "news@example.com".to_string(),
            to: "ada@example.com".to_string(),
            reply_to: None,
            subject: "hi".to_string(),
            html: None,
            text: None,
        };
        assert!(matches!(
            SmtpRelayTransport::build_message(&email, "<x@mailflow>"),
            Err(TransportError::Permanent(_))
        ));
    }

    #[test]
    fn test_build_message_rejects_bad_address() {
        let email = OutboundEmail {
            from: "not-an-address".to_string(),
            to: "ada@example.com".to_string(),
            reply_to: None,
            subject: "hi".to_string(),
            html: None,
            text: Some("hello".to_string()),
        };
        assert!(matches!(
            SmtpRelayTransport::build_message(&email, "<x@mailflow>"),
            Err(TransportError::Permanent(_))
        ));
    }
}
