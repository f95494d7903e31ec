//! Thread resolution: map an inbound message onto an existing or new thread.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mail::Message;
use crate::store::MailStore;

/// A fresh, globally unique thread id.
pub fn new_thread_id() -> String {
    Uuid::new_v4().to_string()
}

/// Where a resolved thread id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Message was already linked (replay).
    Known,
    InReplyTo,
    LastReference,
    EarlierReference,
    New,
}

pub struct ThreadResolver {
    store: Arc<dyn MailStore>,
}

impl ThreadResolver {
    pub fn new(store: Arc<dyn MailStore>) -> Self {
        Self { store }
    }

    /// Resolve and link the message's thread. Never fails: lookup errors
    /// fall through to the next rule and a failed link is only logged.
    pub async fn resolve(&self, message: &Message) -> String {
        let (thread_id, how) = self.find(message).await;

        match self.store.link_message(message.message_id(), &thread_id).await {
            Ok(effective) if effective != thread_id => {
                info!(
                    message_id = %message.message_id(),
                    thread_id = %effective,
                    "Message linked concurrently; using existing thread"
                );
                effective
            }
            Ok(_) => {
                debug!(
                    message_id = %message.message_id(),
                    thread_id = %thread_id,
                    resolution = ?how,
                    "Thread resolved"
                );
                thread_id
            }
            Err(e) => {
                warn!(
                    message_id = %message.message_id(),
                    thread_id = %thread_id,
                    error = %e,
                    "Failed to link message into thread"
                );
                thread_id
            }
        }
    }

    async fn find(&self, message: &Message) -> (String, Resolution) {
        let headers = &message.headers;

        if let Some(tid) = self.lookup_one(&headers.message_id).await {
            return (tid, Resolution::Known);
        }

        if let Some(parent) = headers.in_reply_to.as_deref() {
            if let Some(tid) = self.lookup_one(parent).await {
                return (tid, Resolution::InReplyTo);
            }
        }

        if let Some((last, earlier)) = headers.references.split_last() {
            if let Some(tid) = self.lookup_one(last).await {
                return (tid, Resolution::LastReference);
            }
            if !earlier.is_empty() {
                match self.store.lookup_thread(earlier).await {
                    Ok(Some(tid)) => return (tid, Resolution::EarlierReference),
                    Ok(None) => {}
                    Err(e) => warn!(
                        message_id = %headers.message_id,
                        error = %e,
                        "Reference lookup failed"
                    ),
                }
            }
        }

        (new_thread_id(), Resolution::New)
    }

    async fn lookup_one(&self, message_id: &str) -> Option<String> {
        match self.store.get_message_thread(message_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Thread lookup failed");
                None
            }
        }
    }
}
