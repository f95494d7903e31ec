//! Mail data model and RFC 822 parsing.

pub mod message;
pub mod parse;

pub use message::{Contact, Message, MessageHeaders};
pub use parse::{MessageParseError, parse_message};
