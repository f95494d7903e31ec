//! Outbound side: threaded replies and forwards.

pub mod correlator;
pub mod sender;

pub use correlator::{Correlator, OutboundMessage, THREAD_ID_HEADER};
pub use sender::{DirectoryTransport, MailSender, SmtpTransport, Transport};
