//! Session seams: one live mailbox connection, and the factory that opens it.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::imap::response::{IdleEvent, ImapResponse};

/// An authenticated protocol session.
///
/// Calls are strictly sequential; the owner never pipelines commands.
#[async_trait]
pub trait MailSession: Send {
    /// `SELECT <mailbox>`. The response carries `UIDNEXT`.
    async fn select(&mut self, mailbox: &str) -> Result<ImapResponse, SessionError>;

    /// `UID FETCH <set> <items>`.
    async fn uid_fetch(&mut self, set: &str, items: &str) -> Result<ImapResponse, SessionError>;

    /// Enter IDLE and wait for the first push or `timeout`, then leave IDLE.
    async fn idle(&mut self, timeout: Duration) -> Result<IdleEvent, SessionError>;

    async fn logout(&mut self) -> Result<(), SessionError>;

    /// Close the transport so a blocked call returns at once. The session
    /// is unusable afterwards.
    fn interrupt(&mut self) {}
}

/// Opens a new session: transport, greeting and login.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn MailSession>, SessionError>;
}
