//! Transactional email dispatch
//!
//! One send per email job. Template rendering belongs to the marketplace;
//! jobs arrive with subject and body already rendered.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, warn};

use crate::config::EmailConfig;

/// Mask an address for safe logging: `ali***@example.com`
fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let shown = &local[..local.len().min(3)];
            format!("{shown}***@{domain}")
        }
        None => "***".to_string(),
    }
}

/// Email dispatch error
#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("Email service not configured")]
    NotConfigured,

    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("Send error: {0}")]
    SendError(String),
}

/// Outbound email dispatcher
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError>;
}

/// SMTP-backed mailer
#[derive(Clone)]
pub struct SmtpMailer {
    config: EmailConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl std::fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("smtp_host", &self.config.smtp_host)
            .field("smtp_port", &self.config.smtp_port)
            .finish()
    }
}

impl SmtpMailer {
    pub fn new(config: EmailConfig) -> Result<Self, EmailError> {
        if config.smtp_host.is_empty() {
            return Err(EmailError::NotConfigured);
        }

        let credentials =
            Credentials::new(config.smtp_username.clone(), config.smtp_password.clone());

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| EmailError::SendError(format!("SMTP transport setup failed: {e}")))?
            .port(config.smtp_port)
            .credentials(credentials)
            .build();

        Ok(Self { config, transport })
    }

    fn from_mailbox(&self) -> Result<Mailbox, EmailError> {
        format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| EmailError::InvalidEmail(format!("Invalid from address: {e}")))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), EmailError> {
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|_| EmailError::InvalidEmail(mask_email(to)))?;

        let email = Message::builder()
            .from(self.from_mailbox()?)
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| EmailError::SendError(format!("Failed to build email: {e}")))?;

        self.transport.send(email).await.map_err(|e| {
            warn!(to = %mask_email(to), error = %e, "Email send failed");
            EmailError::SendError(e.to_string())
        })?;

        debug!(to = %mask_email(to), subject = %subject, "Email dispatched");
        crate::metrics::EMAILS_SENT.inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("alice@example.com"), "ali***@example.com");
        assert_eq!(mask_email("ab@example.com"), "ab***@example.com");
        assert_eq!(mask_email("not-an-email"), "***");
    }

    #[test]
    fn test_unconfigured_mailer_refused() {
        let result = SmtpMailer::new(EmailConfig::default());
        assert!(matches!(result, Err(EmailError::NotConfigured)));
    }
}
