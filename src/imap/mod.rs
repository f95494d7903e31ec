//! IMAP protocol layer.

pub mod client;
pub mod connection;
pub mod response;
pub mod session;

pub use client::{ImapClient, ImapConnector};
pub use connection::{ConnectionManager, SessionSlot, SessionState};
pub use response::{IdleEvent, ImapResponse, Status};
pub use session::{MailSession, SessionConnector};
