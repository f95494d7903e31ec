//! Inbound message types: `Message`, `Contact`, threading headers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A mail participant: optional display name plus address.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contact {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
}

impl Contact {
    pub fn new(name: Option<&str>, address: impl Into<String>) -> Self {
        Self {
            name: name.map(str::trim).filter(|n| !n.is_empty()).map(String::from),
            address: address.into(),
        }
    }

    pub fn address_only(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} <{}>", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Threading headers of a message. Ids are stored without angle brackets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    /// Oldest ancestor first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

/// A fetched message. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Mailbox UID assigned by the server.
    pub uid: u32,
    pub sender: Contact,
    pub receiver: Contact,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub headers: MessageHeaders,
}

impl Message {
    pub fn message_id(&self) -> &str {
        &self.headers.message_id
    }
}

/// Strip whitespace and enclosing angle brackets from a message id.
pub fn normalize_message_id(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

/// Render a bare id as it appears in a header.
pub fn bracket_message_id(id: &str) -> String {
    format!("<{id}>")
}
