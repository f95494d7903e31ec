//! Incremental fetch: pull every message above the progress marker.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, StoreError};
use crate::imap::MailSession;
use crate::imap::response::{format_uid_set, parse_bulk_fetch, parse_uid_list, uidnext_from_select};
use crate::ingest::idle::StopSignal;
use crate::ingest::pipeline::{DispatchQueue, EnqueueOutcome};
use crate::store::MailStore;

/// Durable last-seen UID for one account.
#[derive(Clone)]
pub struct ProgressTracker {
    account: String,
    store: Arc<dyn MailStore>,
}

impl ProgressTracker {
    pub fn new(account: impl Into<String>, store: Arc<dyn MailStore>) -> Self {
        Self {
            account: account.into(),
            store,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Stored marker, or 0 when the account has never been fetched.
    pub async fn current(&self) -> Result<u32, StoreError> {
        match self.store.get_last_uid(&self.account).await? {
            Some(uid) => Ok(uid),
            None => {
                info!(account = %self.account, "No progress marker yet, starting from 0");
                Ok(0)
            }
        }
    }

    /// Raise the marker to `uid` if higher. Returns the stored value.
    pub async fn advance(&self, uid: u32) -> Result<u32, StoreError> {
        self.store.advance_last_uid(&self.account, uid).await
    }
}

pub struct FetchEngine {
    mailbox: String,
    batch_size: usize,
    progress: ProgressTracker,
    stop: StopSignal,
}

impl FetchEngine {
    pub fn new(mailbox: impl Into<String>, batch_size: usize, progress: ProgressTracker) -> Self {
        Self {
            mailbox: mailbox.into(),
            batch_size: batch_size.max(1),
            progress,
            stop: StopSignal::new(),
        }
    }

    /// Stop between chunks once `stop` is triggered.
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Fetch from the stored marker.
    pub async fn fetch_new(
        &self,
        session: &mut dyn MailSession,
        queue: &DispatchQueue,
    ) -> Result<usize, Error> {
        let marker = self.progress.current().await?;
        self.fetch_since(session, queue, marker).await
    }

    /// Enqueue every message with a UID above `marker`. Returns the number
    /// of messages enqueued.
    ///
    /// A failing chunk aborts the call. Its ids and those of later chunks
    /// stay above the marker and are fetched again on the next run. A stop
    /// request ends the call after the chunk in progress.
    pub async fn fetch_since(
        &self,
        session: &mut dyn MailSession,
        queue: &DispatchQueue,
        marker: u32,
    ) -> Result<usize, Error> {
        let selected = session.select(&self.mailbox).await?.ensure_ok("SELECT")?;
        if let Some(uidnext) = uidnext_from_select(&selected.lines) {
            let remote_last = uidnext.saturating_sub(1);
            if remote_last <= marker {
                debug!(marker, remote_last, "Mailbox has nothing new");
                return Ok(0);
            }
        }

        info!(marker, "Fetching messages since uid {marker}");
        let range = format!("{}:*", marker.saturating_add(1));
        let listing = session
            .uid_fetch(&range, "(UID)")
            .await?
            .ensure_ok("UID FETCH")?;

        let uids = parse_uid_list(&listing.lines, marker);
        if uids.is_empty() {
            info!(marker, "No messages found since uid {marker}");
            return Ok(0);
        }
        info!(count = uids.len(), "Found {} new message(s)", uids.len());

        let chunks: Vec<&[u32]> = uids.chunks(self.batch_size).collect();
        let mut enqueued = 0;
        for (index, chunk) in chunks.iter().enumerate() {
            if self.stop.is_set() {
                let remaining: usize = chunks[index..].iter().map(|c| c.len()).sum();
                info!(enqueued, remaining, "Stop requested; leaving the rest for the next run");
                return Ok(enqueued);
            }
            if queue.is_closed() {
                warn!("Dispatch queue closed; stopping fetch");
                break;
            }
            match self.fetch_chunk(session, queue, chunk).await {
                Ok(n) => enqueued += n,
                Err(e) => {
                    let skipped: Vec<u32> = chunks[index..].iter().flat_map(|c| c.iter().copied()).collect();
                    warn!(
                        skipped = ?skipped,
                        error = %e,
                        "Fetch aborted; skipped ids will be retried on the next fetch"
                    );
                    return Err(e);
                }
            }
        }

        info!(enqueued, "Fetch complete");
        Ok(enqueued)
    }

    async fn fetch_chunk(
        &self,
        session: &mut dyn MailSession,
        queue: &DispatchQueue,
        chunk: &[u32],
    ) -> Result<usize, Error> {
        let set = format_uid_set(chunk);
        debug!(uids = %set, "Bulk fetching");
        let response = session
            .uid_fetch(&set, "(RFC822)")
            .await?
            .ensure_ok("UID FETCH")?;
        let items = parse_bulk_fetch(&response.lines)?;

        let mut enqueued = 0;
        for (uid, raw) in items {
            if queue.is_closed() {
                break;
            }
            self.progress.advance(uid).await?;
            match queue.enqueue(uid, &raw).await {
                EnqueueOutcome::Enqueued => enqueued += 1,
                EnqueueOutcome::Ignored | EnqueueOutcome::Unreadable => {}
                EnqueueOutcome::Closed => break,
            }
        }
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;

    #[tokio::test]
    async fn tracker_defaults_to_zero_and_advances() {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let tracker = ProgressTracker::new("desk@example.com", store);
        assert_eq!(tracker.current().await.unwrap(), 0);
        assert_eq!(tracker.advance(7).await.unwrap(), 7);
        assert_eq!(tracker.advance(3).await.unwrap(), 7);
        assert_eq!(tracker.current().await.unwrap(), 7);
    }
}
