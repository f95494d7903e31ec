//! Outbound correlation: build replies and forwards with threading headers.

use lettre::message::Mailbox;
use lettre::message::header::{HeaderName, HeaderValue};
use uuid::Uuid;

use crate::error::SendError;
use crate::mail::message::bracket_message_id;
use crate::mail::{Contact, Message};

/// Debug header carrying the engine's thread id on replies.
pub const THREAD_ID_HEADER: &str = "X-Mailroom-Thread-ID";

const REPLY_PREFIX: &str = "Re: ";
const FORWARD_PREFIX: &str = "Fwd: ";

/// A message ready for delivery. Ids are bare (no angle brackets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub message_id: String,
    pub from: Contact,
    pub to: Contact,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
    /// Oldest ancestor first.
    pub references: Vec<String>,
    pub thread_id: Option<String>,
}

impl OutboundMessage {
    /// `References` header value, or `None` when there is no chain.
    pub fn references_header(&self) -> Option<String> {
        if self.references.is_empty() {
            return None;
        }
        Some(
            self.references
                .iter()
                .map(|id| bracket_message_id(id))
                .collect::<Vec<_>>()
                .join(" "),
        )
    }

    pub fn to_lettre(&self) -> Result<lettre::Message, SendError> {
        let mut builder = lettre::Message::builder()
            .message_id(Some(bracket_message_id(&self.message_id)))
            .from(mailbox(&self.from)?)
            .to(mailbox(&self.to)?)
            .subject(self.subject.clone());

        if let Some(parent) = &self.in_reply_to {
            builder = builder.in_reply_to(bracket_message_id(parent));
        }
        if let Some(refs) = self.references_header() {
            builder = builder.references(refs);
        }
        if let Some(thread_id) = &self.thread_id {
            builder = builder.raw_header(HeaderValue::new(
                HeaderName::new_from_ascii_str(THREAD_ID_HEADER),
                thread_id.clone(),
            ));
        }

        builder
            .body(self.body.clone())
            .map_err(|e| SendError::Build(e.to_string()))
    }
}

fn mailbox(contact: &Contact) -> Result<Mailbox, SendError> {
    let address = contact
        .address
        .parse()
        .map_err(|e: lettre::address::AddressError| SendError::InvalidAddress {
            address: contact.address.clone(),
            reason: e.to_string(),
        })?;
    Ok(Mailbox::new(contact.name.clone(), address))
}

/// `prefix + subject`, unless the subject already starts with it.
fn prefixed(prefix: &str, subject: &str) -> String {
    let marker = prefix.trim_end();
    if subject
        .get(..marker.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(marker))
    {
        subject.to_string()
    } else {
        format!("{prefix}{subject}")
    }
}

/// Builds replies and forwards on behalf of one account.
#[derive(Debug, Clone)]
pub struct Correlator {
    account: String,
    msg_id_domain: String,
}

impl Correlator {
    pub fn new(account: impl Into<String>, msg_id_domain: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            msg_id_domain: msg_id_domain.into(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Fresh bare message id at the configured domain.
    pub fn new_message_id(&self) -> String {
        format!("{}@{}", Uuid::new_v4().simple(), self.msg_id_domain)
    }

    /// Our own contact for a reply. Keeps the display name the parent was
    /// addressed with when it was addressed to this account.
    fn reply_from(&self, parent: &Message) -> Contact {
        if parent.receiver.address == self.account {
            Contact {
                name: parent.receiver.name.clone(),
                address: self.account.clone(),
            }
        } else {
            Contact::address_only(self.account.clone())
        }
    }

    pub fn build_reply(&self, thread_id: &str, parent: &Message, body: &str) -> OutboundMessage {
        let parent_id = parent.message_id().to_string();
        let mut references = parent.headers.references.clone();
        references.push(parent_id.clone());

        OutboundMessage {
            message_id: self.new_message_id(),
            from: self.reply_from(parent),
            to: parent.sender.clone(),
            subject: prefixed(REPLY_PREFIX, &parent.subject),
            body: body.to_string(),
            in_reply_to: Some(parent_id),
            references,
            thread_id: Some(thread_id.to_string()),
        }
    }

    pub fn build_forward(
        &self,
        parent: &Message,
        destination: &Contact,
        comment: Option<&str>,
    ) -> OutboundMessage {
        let mut body = String::new();
        if let Some(comment) = comment.map(str::trim).filter(|c| !c.is_empty()) {
            body.push_str(comment);
            body.push_str("\n\n");
        }
        body.push_str("---------- Forwarded message ----------\n");
        body.push_str(&format!("From: {}\n", parent.sender));
        body.push_str(&format!("Date: {}\n", parent.sent_at.to_rfc2822()));
        body.push_str(&format!("Subject: {}\n", parent.subject));
        body.push_str(&format!("To: {}\n\n", parent.receiver));
        for line in parent.body.lines() {
            body.push_str("> ");
            body.push_str(line);
            body.push('\n');
        }

        OutboundMessage {
            message_id: self.new_message_id(),
            from: Contact::address_only(self.account.clone()),
            to: destination.clone(),
            subject: prefixed(FORWARD_PREFIX, &parent.subject),
            body,
            in_reply_to: None,
            references: Vec::new(),
            thread_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::MessageHeaders;

    fn parent(refs: &[&str]) -> Message {
        Message {
            uid: 5,
            sender: Contact::new(Some("Alice Tenant"), "alice@example.com"),
            receiver: Contact::new(Some("Property Desk"), "desk@example.com"),
            subject: "Broken heater".into(),
            body: "It is cold.\nPlease help.".into(),
            sent_at: chrono::Utc::now(),
            headers: MessageHeaders {
                message_id: "C@example.com".into(),
                in_reply_to: refs.last().map(|r| r.to_string()),
                references: refs.iter().map(|r| r.to_string()).collect(),
            },
        }
    }

    fn correlator() -> Correlator {
        Correlator::new("desk@example.com", "example.com")
    }

    #[test]
    fn reply_extends_reference_chain() {
        let reply = correlator().build_reply("T1", &parent(&["A@example.com", "B@example.com"]), "On it");
        assert_eq!(reply.in_reply_to.as_deref(), Some("C@example.com"));
        assert_eq!(
            reply.references,
            vec!["A@example.com", "B@example.com", "C@example.com"]
        );
        assert_eq!(
            reply.references_header().as_deref(),
            Some("<A@example.com> <B@example.com> <C@example.com>")
        );
    }

    #[test]
    fn reply_to_root_references_parent_only() {
        let reply = correlator().build_reply("T1", &parent(&[]), "On it");
        assert_eq!(reply.references, vec!["C@example.com"]);
    }

    #[test]
    fn reply_addressing_and_subject() {
        let reply = correlator().build_reply("T1", &parent(&[]), "On it");
        assert_eq!(reply.to.address, "alice@example.com");
        assert_eq!(reply.from.to_string(), "Property Desk <desk@example.com>");
        assert_eq!(reply.subject, "Re: Broken heater");
        assert_eq!(reply.thread_id.as_deref(), Some("T1"));
        assert!(reply.message_id.ends_with("@example.com"));
        assert_ne!(reply.message_id, "C@example.com");
    }

    #[test]
    fn reply_from_other_alias_drops_display_name() {
        let c = Correlator::new("agent@example.com", "example.com");
        let reply = c.build_reply("T1", &parent(&[]), "On it");
        assert_eq!(reply.from, Contact::address_only("agent@example.com"));
    }

    #[test]
    fn display_name_kept_only_on_exact_address_match() {
        let c = Correlator::new("Desk@Example.com", "example.com");
        let reply = c.build_reply("T1", &parent(&[]), "On it");
        assert_eq!(reply.from, Contact::address_only("Desk@Example.com"));
    }

    #[test]
    fn subject_prefix_not_doubled() {
        assert_eq!(prefixed(REPLY_PREFIX, "Re: Broken heater"), "Re: Broken heater");
        assert_eq!(prefixed(REPLY_PREFIX, "RE: Broken heater"), "RE: Broken heater");
        assert_eq!(prefixed(FORWARD_PREFIX, "Broken heater"), "Fwd: Broken heater");
        assert_eq!(prefixed(REPLY_PREFIX, ""), "Re: ");
    }

    #[test]
    fn forward_is_independent_and_quotes_original() {
        let fwd = correlator().build_forward(
            &parent(&["A@example.com"]),
            &Contact::address_only("plumber@example.com"),
            Some("Can you take a look?"),
        );
        assert!(fwd.in_reply_to.is_none());
        assert!(fwd.references.is_empty());
        assert!(fwd.thread_id.is_none());
        assert_eq!(fwd.subject, "Fwd: Broken heater");
        assert!(fwd.body.starts_with("Can you take a look?\n\n"));
        assert!(fwd.body.contains("> It is cold.\n> Please help.\n"));
    }

    #[test]
    fn lettre_message_carries_threading_headers() {
        let reply = correlator().build_reply("T1", &parent(&["A@example.com"]), "On it");
        let raw = String::from_utf8(reply.to_lettre().unwrap().formatted()).unwrap();
        assert!(raw.contains("In-Reply-To: <C@example.com>"));
        assert!(raw.contains("References: <A@example.com> <C@example.com>"));
        assert!(raw.contains("X-Mailroom-Thread-ID: T1"));
        assert!(raw.contains(&format!("Message-ID: <{}>", reply.message_id)));
    }

    #[test]
    fn invalid_recipient_is_rejected() {
        let mut reply = correlator().build_reply("T1", &parent(&[]), "On it");
        reply.to = Contact::address_only("not an address");
        assert!(matches!(
            reply.to_lettre(),
            Err(SendError::InvalidAddress { .. })
        ));
    }
}
