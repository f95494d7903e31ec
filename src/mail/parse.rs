//! RFC 822 parsing: raw fetched bytes into a `Message`.

use chrono::{DateTime, Utc};
use mail_parser::{Address, HeaderValue, MessageParser};
use uuid::Uuid;

use crate::mail::message::{Contact, Message, MessageHeaders, normalize_message_id};

/// Why a fetched item could not become a `Message`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageParseError {
    #[error("message #{uid} is not valid RFC 822")]
    Unparseable { uid: u32 },

    #[error("no readable body in message #{uid} from {sender}")]
    NoBody { uid: u32, sender: String },
}

/// Parse a raw message fetched under `uid`.
pub fn parse_message(uid: u32, raw: &[u8]) -> Result<Message, MessageParseError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or(MessageParseError::Unparseable { uid })?;

    let sender = first_contact(parsed.from());
    let receiver = first_contact(parsed.to());

    let body = extract_text(&parsed);
    if body.trim().is_empty() {
        return Err(MessageParseError::NoBody {
            uid,
            sender: sender.address,
        });
    }

    let sent_at = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    let message_id = parsed
        .message_id()
        .map(normalize_message_id)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("gen-{}@mailroom", Uuid::new_v4()));

    let headers = MessageHeaders {
        message_id,
        in_reply_to: header_ids(parsed.in_reply_to()).into_iter().next(),
        references: header_ids(parsed.references()),
    };

    Ok(Message {
        uid,
        sender,
        receiver,
        subject: parsed.subject().unwrap_or_default().to_string(),
        body,
        sent_at,
        headers,
    })
}

/// First mailbox of an address header.
fn first_contact(addr: Option<&Address>) -> Contact {
    addr.and_then(|a| a.first())
        .map(|a| Contact::new(a.name(), a.address().unwrap_or_default()))
        .unwrap_or_default()
}

/// Message ids carried by `In-Reply-To` / `References`, in header order.
fn header_ids(value: &HeaderValue) -> Vec<String> {
    let raw: Vec<String> = match value {
        HeaderValue::Text(t) => t.split_whitespace().map(String::from).collect(),
        HeaderValue::TextList(list) => list.iter().map(|s| s.to_string()).collect(),
        _ => Vec::new(),
    };
    raw.iter()
        .map(|id| normalize_message_id(id))
        .filter(|id| !id.is_empty())
        .collect()
}

/// Readable text. mail-parser falls back to converting the HTML part when
/// there is no plain-text one.
fn extract_text(parsed: &mail_parser::Message) -> String {
    parsed
        .body_text(0)
        .map(|text| text.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "From: Alice Tenant <alice@example.com>\r\n\
To: Property Desk <desk@example.com>\r\n\
Subject: Re: Broken heater\r\n\
Date: Tue, 14 Jan 2025 10:00:00 +0000\r\n\
Message-ID: <m3@example.com>\r\n\
In-Reply-To: <m2@example.com>\r\n\
References: <m1@example.com> <m2@example.com>\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Still cold in here.\r\n";

    #[test]
    fn parses_threading_headers() {
        let msg = parse_message(42, REPLY.as_bytes()).unwrap();
        assert_eq!(msg.uid, 42);
        assert_eq!(msg.headers.message_id, "m3@example.com");
        assert_eq!(msg.headers.in_reply_to.as_deref(), Some("m2@example.com"));
        assert_eq!(msg.headers.references, vec!["m1@example.com", "m2@example.com"]);
    }

    #[test]
    fn parses_contacts_subject_and_body() {
        let msg = parse_message(1, REPLY.as_bytes()).unwrap();
        assert_eq!(msg.sender, Contact::new(Some("Alice Tenant"), "alice@example.com"));
        assert_eq!(msg.receiver.address, "desk@example.com");
        assert_eq!(msg.receiver.name.as_deref(), Some("Property Desk"));
        assert_eq!(msg.subject, "Re: Broken heater");
        assert_eq!(msg.body, "Still cold in here.");
        assert_eq!(msg.sent_at.to_rfc3339(), "2025-01-14T10:00:00+00:00");
    }

    #[test]
    fn message_without_threading_headers() {
        let raw = "From: bob@example.com\r\nTo: desk@example.com\r\nSubject: Hi\r\nMessage-ID: <fresh@example.com>\r\n\r\nHello\r\n";
        let msg = parse_message(2, raw.as_bytes()).unwrap();
        assert_eq!(msg.headers.in_reply_to, None);
        assert!(msg.headers.references.is_empty());
    }

    #[test]
    fn missing_message_id_is_generated() {
        let raw = "From: bob@example.com\r\nSubject: Hi\r\n\r\nHello\r\n";
        let msg = parse_message(3, raw.as_bytes()).unwrap();
        assert!(msg.headers.message_id.starts_with("gen-"));
    }

    #[test]
    fn empty_body_is_rejected() {
        let raw = "From: bob@example.com\r\nSubject: Hi\r\nMessage-ID: <e@x>\r\n\r\n   \r\n";
        let err = parse_message(4, raw.as_bytes()).unwrap_err();
        assert!(matches!(err, MessageParseError::NoBody { uid: 4, .. }));
    }

    #[test]
    fn multipart_prefers_plain_text() {
        let raw = "From: bob@example.com\r\n\
Message-ID: <mp@x>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
plain version\r\n\
--b1\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>html version</p>\r\n\
--b1--\r\n";
        let msg = parse_message(5, raw.as_bytes()).unwrap();
        assert_eq!(msg.body, "plain version");
    }

    #[test]
    fn html_only_body_becomes_text() {
        let raw = "From: bob@example.com\r\n\
Message-ID: <h@x>\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<div><p>Pipe <b>burst</b> in unit 4</p></div>\r\n";
        let msg = parse_message(6, raw.as_bytes()).unwrap();
        assert!(msg.body.contains("burst"));
        assert!(!msg.body.contains('<'));
    }
}
