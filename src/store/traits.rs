//! `MailStore` trait: the durable state shared by the fetch engine,
//! thread resolver and outbound sender.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::StoreError;

/// Key prefix of the per-account progress marker.
pub const LAST_UID_KEY_PREFIX: &str = "last_uid:";
/// Key prefix of the `message_id → thread_id` mapping.
pub const MESSAGE_KEY_PREFIX: &str = "msg:";
/// Key prefix of a thread's member set.
pub const THREAD_KEY_PREFIX: &str = "thread:";

pub fn last_uid_key(account: &str) -> String {
    format!("{LAST_UID_KEY_PREFIX}{account}")
}

pub fn message_key(message_id: &str) -> String {
    format!("{MESSAGE_KEY_PREFIX}{message_id}")
}

pub fn thread_key(thread_id: &str) -> String {
    format!("{THREAD_KEY_PREFIX}{thread_id}")
}

/// Backend-agnostic store for progress markers and thread correlation.
#[async_trait]
pub trait MailStore: Send + Sync {
    // ── Progress marker ─────────────────────────────────────────────

    /// Last UID recorded for `account`, if any.
    async fn get_last_uid(&self, account: &str) -> Result<Option<u32>, StoreError>;

    /// Atomically raise the marker to `max(stored, uid)` and return the
    /// stored value. Never lowers the marker.
    async fn advance_last_uid(&self, account: &str, uid: u32) -> Result<u32, StoreError>;

    // ── Threads ─────────────────────────────────────────────────────

    /// Thread the message belongs to, if it was linked before.
    async fn get_message_thread(&self, message_id: &str) -> Result<Option<String>, StoreError>;

    /// Thread of the first id in `message_ids` (in slice order) that has one.
    async fn lookup_thread(&self, message_ids: &[String]) -> Result<Option<String>, StoreError>;

    /// Link `message_id` into `thread_id` in a single transaction: the
    /// mapping and the set membership become visible together.
    ///
    /// The mapping is write-once. If the message already belongs to another
    /// thread, nothing changes and that thread is returned.
    async fn link_message(&self, message_id: &str, thread_id: &str) -> Result<String, StoreError>;

    /// All message ids linked into `thread_id`.
    async fn thread_messages(&self, thread_id: &str) -> Result<HashSet<String>, StoreError>;
}
