//! Verification mail senders.
//!
//! [`MailSender`] is the opaque "send the verification email" capability the
//! worker drives. [`SmtpMailSender`] talks SMTP through lettre,
//! [`LogMailSender`] only logs the link and is meant for development.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use mailverify_common::config::MailConfig;
use mailverify_common::{AppError, AppResult, redact_token};
use std::sync::Arc;
use tracing::{debug, info};

const SUBJECT: &str = "Verify your email address";

/// Capability to deliver one verification email.
#[async_trait]
pub trait MailSender: Send + Sync {
    /// Send the verification email for `token` to `to`.
    async fn send(&self, to: &str, token: &str) -> AppResult<()>;
}

/// Type alias for a shared mail sender.
pub type SharedMailSender = Arc<dyn MailSender>;

/// Build the link a recipient follows to verify.
#[must_use]
pub fn verification_link(link_base: &str, token: &str) -> String {
    let separator = if link_base.contains('?') { '&' } else { '?' };
    format!(
        "{link_base}{separator}token={}",
        urlencoding::encode(token)
    )
}

/// Rendered verification email.
#[derive(Debug, Clone)]
pub struct VerificationMessage {
    /// Recipient email address
    pub to: String,
    /// Subject line
    pub subject: String,
    /// Plain text body
    pub text_body: String,
}

impl VerificationMessage {
    /// Render the message for a recipient and token.
    #[must_use]
    pub fn new(link_base: &str, to: &str, token: &str) -> Self {
        let link = verification_link(link_base, token);
        let text_body = format!(
            "Confirm that this address belongs to you by opening the link below.\n\n\
             {link}\n\n\
             If you did not request this, you can ignore this email."
        );

        Self {
            to: to.to_string(),
            subject: SUBJECT.to_string(),
            text_body,
        }
    }
}

/// SMTP mail sender.
#[derive(Clone)]
pub struct SmtpMailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    link_base: String,
}

impl SmtpMailSender {
    /// Build a sender from the mail configuration.
    ///
    /// Fails with [`AppError::Config`] when no SMTP section is configured or
    /// the from address does not parse.
    pub fn new(config: &MailConfig) -> AppResult<Self> {
        let smtp = config
            .smtp
            .as_ref()
            .ok_or_else(|| AppError::Config("mail.smtp is not configured".to_string()))?;

        let builder = if smtp.implicit_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
        }
        .map_err(|e| AppError::Config(format!("Invalid SMTP relay {}: {e}", smtp.host)))?
        .port(smtp.port);

        let builder = match (&smtp.username, &smtp.password) {
            (Some(username), Some(password)) => {
                builder.credentials(Credentials::new(username.clone(), password.clone()))
            }
            _ => builder,
        };

        let from = format!("{} <{}>", config.from_name, config.from_address)
            .parse::<Mailbox>()
            .map_err(|e| AppError::Config(format!("Invalid from address: {e}")))?;

        Ok(Self {
            transport: builder.build(),
            from,
            link_base: config.link_base.clone(),
        })
    }
}

#[async_trait]
impl MailSender for SmtpMailSender {
    async fn send(&self, to: &str, token: &str) -> AppResult<()> {
        let rendered = VerificationMessage::new(&self.link_base, to, token);

        let recipient = rendered
            .to
            .parse::<Mailbox>()
            .map_err(|e| AppError::Mail(format!("Invalid recipient {to}: {e}")))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(recipient)
            .subject(rendered.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(rendered.text_body)
            .map_err(|e| AppError::Mail(format!("Failed to build message: {e}")))?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| AppError::Mail(format!("SMTP delivery failed: {e}")))?;

        debug!(to = %to, code = %response.code(), "SMTP server accepted message");
        Ok(())
    }
}

/// Mail sender that only logs the verification link.
#[derive(Debug, Clone)]
pub struct LogMailSender {
    link_base: String,
}

impl LogMailSender {
    /// Create a log-only sender.
    #[must_use]
    pub const fn new(link_base: String) -> Self {
        Self { link_base }
    }
}

#[async_trait]
impl MailSender for LogMailSender {
    async fn send(&self, to: &str, token: &str) -> AppResult<()> {
        let rendered = VerificationMessage::new(&self.link_base, to, token);

        info!(
            to = %rendered.to,
            subject = %rendered.subject,
            token = %redact_token(token),
            "Verification email (log sender)"
        );
        debug!(link = %verification_link(&self.link_base, token), "Verification link");

        Ok(())
    }
}

/// Build the sender the configuration asks for.
///
/// SMTP when `mail.smtp` is set, otherwise the log sender.
pub fn from_config(config: &MailConfig) -> AppResult<SharedMailSender> {
    if config.smtp.is_some() {
        Ok(Arc::new(SmtpMailSender::new(config)?))
    } else {
        Ok(Arc::new(LogMailSender::new(config.link_base.clone())))
    }
}
