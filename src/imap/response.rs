//! IMAP response model and line parsers.
//!
//! A response is flattened into a list of items, in wire order:
//! untagged lines (without the leading `* `), each literal as its own item,
//! the remainder of a line after a literal, and last the text of the tagged
//! completion line (after `<tag> <status> `).
//!
//! A bulk `UID FETCH ... (RFC822)` therefore reads as
//! `[header, literal, terminator]` per message followed by the status text.

use std::sync::LazyLock;

use regex::bytes::Regex;
use tracing::{debug, warn};

use crate::error::SessionError;

/// Items that make up one message in a bulk fetch response.
pub const MESSAGE_ITEM_COUNT: usize = 3;

static UID_LINE_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+\s+FETCH\s+\(.*?\bUID\s+(\d+)").expect("valid UID regex")
});

static FLAG_LINE_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\s+FETCH\s+\(").expect("valid flag line regex"));

static UIDNEXT_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[UIDNEXT\s+(\d+)\]").expect("valid UIDNEXT regex"));

static EXISTS_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\*\s+)?\d+\s+EXISTS").expect("valid EXISTS regex"));

/// Completion status of a tagged command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

impl Status {
    pub fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_uppercase().as_str() {
            "OK" => Some(Self::Ok),
            "NO" => Some(Self::No),
            "BAD" => Some(Self::Bad),
            _ => None,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::No => "NO",
            Self::Bad => "BAD",
        };
        write!(f, "{s}")
    }
}

/// A complete command response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapResponse {
    pub status: Status,
    pub lines: Vec<Vec<u8>>,
}

impl ImapResponse {
    pub fn new(status: Status, lines: Vec<Vec<u8>>) -> Self {
        Self { status, lines }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Fail with `CommandFailed` unless the status is OK.
    pub fn ensure_ok(self, command: &str) -> Result<Self, SessionError> {
        if self.is_ok() {
            return Ok(self);
        }
        Err(SessionError::CommandFailed {
            command: command.to_string(),
            status: self.status.to_string(),
            detail: self
                .lines
                .last()
                .map(|l| String::from_utf8_lossy(l).trim().to_string())
                .unwrap_or_default(),
        })
    }
}

/// Event that ended an IDLE wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleEvent {
    /// First untagged line pushed by the server.
    Push(Vec<u8>),
    /// Nothing arrived within the timeout.
    Timeout,
}

/// UID from a FETCH line such as `12 FETCH (UID 34 ...`.
pub fn uid_from_fetch_line(line: &[u8]) -> Option<u32> {
    let caps = UID_LINE_RX.captures(line)?;
    std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?.parse().ok()
}

/// `UIDNEXT` value announced in a SELECT response.
pub fn uidnext_from_select(lines: &[Vec<u8>]) -> Option<u32> {
    lines.iter().find_map(|line| {
        let caps = UIDNEXT_RX.captures(line)?;
        std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?.parse().ok()
    })
}

/// Whether a pushed line announces new messages (`<n> EXISTS`).
pub fn is_exists_push(line: &[u8]) -> bool {
    EXISTS_RX.is_match(line)
}

/// UIDs listed by a `UID FETCH <range> (UID)` response, keeping only those
/// strictly above `marker`. Unparseable lines are skipped.
pub fn parse_uid_list(lines: &[Vec<u8>], marker: u32) -> Vec<u32> {
    let data = match lines.split_last() {
        Some((_status, data)) => data,
        None => return Vec::new(),
    };

    let mut uids = Vec::with_capacity(data.len());
    for line in data.iter().filter(|l| !l.is_empty()) {
        match uid_from_fetch_line(line) {
            Some(uid) if uid > marker => uids.push(uid),
            Some(uid) => debug!(uid, marker, "Skipping uid at or below marker"),
            None => warn!(line = %String::from_utf8_lossy(line).trim(), "Skipping unparseable fetch line"),
        }
    }
    uids
}

/// Split a bulk `(RFC822)` fetch response into `(uid, raw message)` pairs.
///
/// Trailing untagged flag updates before the status line are dropped first.
/// Any structural mismatch yields `SessionError::Protocol` and no items.
pub fn parse_bulk_fetch(lines: &[Vec<u8>]) -> Result<Vec<(u32, Vec<u8>)>, SessionError> {
    let (_status, mut items) = lines
        .split_last()
        .ok_or_else(|| SessionError::Protocol("empty bulk fetch response".into()))?;

    while let Some((last, rest)) = items.split_last() {
        if is_flag_line(last) {
            items = rest;
        } else {
            break;
        }
    }

    if items.len() % MESSAGE_ITEM_COUNT != 0 {
        return Err(SessionError::Protocol(format!(
            "bulk fetch response has {} items, not divisible by {MESSAGE_ITEM_COUNT}",
            items.len()
        )));
    }

    items
        .chunks_exact(MESSAGE_ITEM_COUNT)
        .map(|chunk| {
            let header = &chunk[0];
            let uid = uid_from_fetch_line(header).ok_or_else(|| {
                SessionError::Protocol(format!(
                    "no UID in fetch header: {}",
                    String::from_utf8_lossy(header).trim()
                ))
            })?;
            Ok((uid, chunk[1].clone()))
        })
        .collect()
}

/// An untagged FETCH line that carries no literal (e.g. a FLAGS update).
fn is_flag_line(line: &[u8]) -> bool {
    let trimmed = line.trim_ascii_end();
    FLAG_LINE_RX.is_match(trimmed) && !trimmed.ends_with(b"}")
}

/// Comma-joined UID set for a fetch command.
pub fn format_uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&[u8]]) -> Vec<Vec<u8>> {
        items.iter().map(|l| l.to_vec()).collect()
    }

    #[test]
    fn uid_from_fetch_line_variants() {
        assert_eq!(uid_from_fetch_line(b"12 FETCH (UID 34)"), Some(34));
        assert_eq!(uid_from_fetch_line(b"1 FETCH (UID 5 RFC822 {120}"), Some(5));
        assert_eq!(uid_from_fetch_line(b"1 FETCH (RFC822 {120} UID 9"), Some(9));
        assert_eq!(uid_from_fetch_line(b"OK FETCH completed"), None);
        assert_eq!(uid_from_fetch_line(b"3 FETCH (FLAGS (\\Seen))"), None);
    }

    #[test]
    fn uidnext_is_found_in_select() {
        let select = lines(&[
            b"FLAGS (\\Answered \\Seen)",
            b"5 EXISTS",
            b"OK [UIDNEXT 4392] Predicted next UID",
            b"[READ-WRITE] SELECT completed",
        ]);
        assert_eq!(uidnext_from_select(&select), Some(4392));
        assert_eq!(uidnext_from_select(&lines(&[b"OK done"])), None);
    }

    #[test]
    fn exists_push_detection() {
        assert!(is_exists_push(b"7 EXISTS"));
        assert!(is_exists_push(b"* 7 EXISTS"));
        assert!(!is_exists_push(b"3 EXPUNGE"));
        assert!(!is_exists_push(b"7 RECENT"));
    }

    #[test]
    fn uid_list_skips_garbage_and_old_ids() {
        let resp = lines(&[
            b"1 FETCH (UID 10)",
            b"garbage",
            b"",
            b"2 FETCH (UID 11)",
            b"3 FETCH (UID 12)",
            b"FETCH completed",
        ]);
        assert_eq!(parse_uid_list(&resp, 10), vec![11, 12]);
        assert!(parse_uid_list(&[], 0).is_empty());
    }

    #[test]
    fn bulk_fetch_splits_triples() {
        let resp = lines(&[
            b"1 FETCH (UID 11 RFC822 {5}",
            b"hello",
            b")",
            b"2 FETCH (UID 12 RFC822 {5}",
            b"world",
            b")",
            b"Success",
        ]);
        let items = parse_bulk_fetch(&resp).unwrap();
        assert_eq!(items, vec![(11, b"hello".to_vec()), (12, b"world".to_vec())]);
    }

    #[test]
    fn bulk_fetch_strips_trailing_flag_lines() {
        let resp = lines(&[
            b"1 FETCH (UID 11 RFC822 {5}",
            b"hello",
            b")",
            b"1 FETCH (FLAGS (\\Seen))",
            b"2 FETCH (FLAGS (\\Seen) UID 12)",
            b"Success",
        ]);
        let items = parse_bulk_fetch(&resp).unwrap();
        assert_eq!(items, vec![(11, b"hello".to_vec())]);
    }

    #[test]
    fn bulk_fetch_rejects_non_triples() {
        for len in [1_usize, 2, 4, 5, 7] {
            let mut resp: Vec<Vec<u8>> = (0..len).map(|i| format!("item {i}").into_bytes()).collect();
            resp.push(b"Success".to_vec());
            let err = parse_bulk_fetch(&resp).unwrap_err();
            assert!(matches!(err, SessionError::Protocol(_)), "len {len}");
        }
    }

    #[test]
    fn bulk_fetch_rejects_header_without_uid() {
        let resp = lines(&[b"1 FETCH (RFC822 {5}", b"hello", b")", b"Success"]);
        assert!(matches!(
            parse_bulk_fetch(&resp),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn bulk_fetch_empty_is_protocol_error() {
        assert!(parse_bulk_fetch(&[]).is_err());
        assert!(parse_bulk_fetch(&lines(&[b"Success"])).unwrap().is_empty());
    }

    #[test]
    fn ensure_ok_reports_status_text() {
        let resp = ImapResponse::new(Status::No, lines(&[b"[TRYCREATE] no such mailbox"]));
        let err = resp.ensure_ok("SELECT").unwrap_err();
        match err {
            SessionError::CommandFailed { command, status, detail } => {
                assert_eq!(command, "SELECT");
                assert_eq!(status, "NO");
                assert!(detail.contains("no such mailbox"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn uid_set_format() {
        assert_eq!(format_uid_set(&[3, 4, 9]), "3,4,9");
        assert_eq!(format_uid_set(&[]), "");
    }
}
