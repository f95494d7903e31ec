//! Message handler seam and the default logging handler.

use async_trait::async_trait;
use tracing::info;

use crate::error::HandlerError;
use crate::mail::Message;

/// Consumes resolved messages. Called concurrently from every worker.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn consume(&self, thread_id: &str, message: &Message) -> Result<(), HandlerError>;
}

/// Logs every message it receives.
#[derive(Debug, Default, Clone)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn consume(&self, thread_id: &str, message: &Message) -> Result<(), HandlerError> {
        info!(
            uid = message.uid,
            thread_id = %thread_id,
            message_id = %message.message_id(),
            from = %message.sender,
            to = %message.receiver,
            subject = %message.subject,
            date = %message.sent_at.to_rfc2822(),
            "Received message"
        );
        Ok(())
    }
}
