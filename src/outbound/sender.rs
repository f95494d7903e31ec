//! Delivery of replies and forwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::{EmailConfig, MailroomConfig};
use crate::error::SendError;
use crate::mail::{Contact, Message};
use crate::outbound::correlator::{Correlator, OutboundMessage};
use crate::store::MailStore;

/// Port on which SMTP expects TLS from the first byte.
const IMPLICIT_TLS_PORT: u16 = 465;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), SendError>;
}

/// SMTP delivery through lettre.
pub struct SmtpTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpTransport {
    pub fn from_config(config: &EmailConfig) -> Result<Self, SendError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let builder = if !config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        } else if config.smtp_port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .map_err(|e| SendError::Smtp(format!("SMTP relay error: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| SendError::Smtp(format!("SMTP STARTTLS error: {e}")))?
        };

        Ok(Self {
            inner: builder.port(config.smtp_port).credentials(creds).build(),
        })
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), SendError> {
        let email = message.to_lettre()?;
        self.inner
            .send(email)
            .await
            .map_err(|e| SendError::Smtp(format!("SMTP send failed: {e}")))?;
        Ok(())
    }
}

/// Writes messages to a directory as `.eml` files instead of sending them.
pub struct DirectoryTransport {
    dir: PathBuf,
}

impl DirectoryTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, SendError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(message: &OutboundMessage) -> String {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let short: String = message.message_id.chars().take(8).collect();
        format!("mail-{stamp}-{short}.eml")
    }
}

#[async_trait]
impl Transport for DirectoryTransport {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), SendError> {
        let email = message.to_lettre()?;
        let path = self.dir.join(Self::file_name(message));
        tokio::fs::write(&path, email.formatted()).await?;
        info!(path = %path.display(), "Saved forwarded message");
        Ok(())
    }
}

/// Sends replies and forwards and records replies in their thread.
pub struct MailSender {
    correlator: Correlator,
    transport: Arc<dyn Transport>,
    forward_transport: Arc<dyn Transport>,
    store: Arc<dyn MailStore>,
}

impl MailSender {
    pub fn new(correlator: Correlator, transport: Arc<dyn Transport>, store: Arc<dyn MailStore>) -> Self {
        Self {
            correlator,
            forward_transport: Arc::clone(&transport),
            transport,
            store,
        }
    }

    /// SMTP for everything, except forwards go to the forwarded-messages
    /// directory when one is configured.
    pub fn from_config(config: &MailroomConfig, store: Arc<dyn MailStore>) -> Result<Self, SendError> {
        let correlator = Correlator::new(config.email.username.clone(), config.email.msg_id_domain.clone());
        let smtp: Arc<dyn Transport> = Arc::new(SmtpTransport::from_config(&config.email)?);
        let sender = Self::new(correlator, smtp, store);
        match &config.store.forwarded_messages_dir {
            Some(dir) => Ok(sender.with_forward_transport(Arc::new(DirectoryTransport::new(dir)?))),
            None => Ok(sender),
        }
    }

    /// Route forwards to a different transport, e.g. a `DirectoryTransport`.
    pub fn with_forward_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.forward_transport = transport;
        self
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Reply to `parent` and link the reply into `thread_id`.
    ///
    /// Returns the sent message. A failed link after a successful send is
    /// reported as `SendError::Link`; the mail is already out.
    pub async fn reply_in_thread(
        &self,
        thread_id: &str,
        parent: &Message,
        body: &str,
    ) -> Result<OutboundMessage, SendError> {
        let reply = self.correlator.build_reply(thread_id, parent, body);
        self.transport.deliver(&reply).await?;
        info!(
            to = %reply.to.address,
            thread_id = %thread_id,
            message_id = %reply.message_id,
            "Sent reply"
        );

        self.store
            .link_message(&reply.message_id, thread_id)
            .await
            .map_err(|source| SendError::Link {
                message_id: reply.message_id.clone(),
                thread_id: thread_id.to_string(),
                source,
            })?;
        Ok(reply)
    }

    /// Forward `parent` to `destination` with an optional comment on top.
    pub async fn forward_message(
        &self,
        parent: &Message,
        destination: &str,
        comment: Option<&str>,
    ) -> Result<OutboundMessage, SendError> {
        let forward = self.correlator.build_forward(
            parent,
            &Contact::address_only(destination),
            comment,
        );
        self.forward_transport.deliver(&forward).await?;
        info!(
            to = %destination,
            message_id = %forward.message_id,
            original = %parent.message_id(),
            "Forwarded message"
        );
        Ok(forward)
    }
}
