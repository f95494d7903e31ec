//! Raw IMAP client over TCP or rustls.
//!
//! Socket I/O is blocking and runs inside `spawn_blocking`; the async
//! wrapper only hands the wire between tasks.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::EmailConfig;
use crate::error::SessionError;
use crate::imap::response::{IdleEvent, ImapResponse, Status, is_exists_push};
use crate::imap::session::{MailSession, SessionConnector};

/// Read timeout for ordinary command round trips.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest `{n}` literal accepted from the server.
const MAX_LITERAL_SIZE: usize = 64 * 1024 * 1024;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

impl Transport {
    fn socket(&self) -> &TcpStream {
        match self {
            Self::Plain(s) => s,
            Self::Tls(s) => &s.sock,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// Blocking wire state: buffered transport plus the tag counter.
struct Wire {
    reader: BufReader<Transport>,
    next_tag: u32,
}

impl Wire {
    fn new(transport: Transport) -> Self {
        Self {
            reader: BufReader::new(transport),
            next_tag: 1,
        }
    }

    fn tag(&mut self) -> String {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;
        tag
    }

    fn set_read_timeout(&self, timeout: Duration) -> Result<(), SessionError> {
        self.reader.get_ref().socket().set_read_timeout(Some(timeout))?;
        Ok(())
    }

    /// One CRLF-terminated line, without the terminator.
    fn read_line(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf).map_err(|e| match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => SessionError::Timeout(COMMAND_TIMEOUT),
            _ => e.into(),
        })?;
        if n == 0 {
            return Err(SessionError::Connection("IMAP connection closed".into()));
        }
        while buf.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
            buf.pop();
        }
        Ok(buf)
    }

    fn write_line(&mut self, line: &str) -> Result<(), SessionError> {
        let inner = self.reader.get_mut();
        inner.write_all(line.as_bytes())?;
        inner.write_all(b"\r\n")?;
        inner.flush()?;
        Ok(())
    }

    /// Send a tagged command and collect the response.
    fn command(&mut self, cmd: &str) -> Result<ImapResponse, SessionError> {
        let tag = self.tag();
        self.write_line(&format!("{tag} {cmd}"))?;
        self.read_response(&tag)
    }

    fn read_response(&mut self, tag: &str) -> Result<ImapResponse, SessionError> {
        let prefix = format!("{tag} ");
        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(rest) = line.strip_prefix(prefix.as_bytes()) {
                let rest = String::from_utf8_lossy(rest);
                let (word, text) = rest.split_once(' ').unwrap_or((rest.as_ref(), ""));
                let status = Status::parse(word).ok_or_else(|| {
                    SessionError::Protocol(format!("unknown completion status: {rest}"))
                })?;
                lines.push(text.as_bytes().to_vec());
                return Ok(ImapResponse::new(status, lines));
            }

            let mut item = untagged(line);
            while let Some(len) = literal_len(&item) {
                if len > MAX_LITERAL_SIZE {
                    return Err(SessionError::Protocol(format!(
                        "literal of {len} bytes exceeds the {MAX_LITERAL_SIZE} byte limit"
                    )));
                }
                lines.push(item);
                let mut literal = vec![0u8; len];
                self.reader.read_exact(&mut literal)?;
                lines.push(literal);
                item = self.read_line()?;
            }
            lines.push(item);
        }
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), SessionError> {
        let cmd = format!("LOGIN {} {}", quote(username), quote(password));
        self.command(&cmd)?.ensure_ok("LOGIN")?;
        Ok(())
    }

    fn finish_idle(&mut self, tag: &str) -> Result<(), SessionError> {
        self.set_read_timeout(COMMAND_TIMEOUT)?;
        self.write_line("DONE")?;
        self.read_response(tag)?.ensure_ok("IDLE")?;
        Ok(())
    }

    /// IDLE wait; a socket read timeout becomes `IdleEvent::Timeout`.
    ///
    /// Untagged data that arrives before the continuation counts as the
    /// wake event, preferring an `EXISTS` line.
    fn idle(&mut self, timeout: Duration) -> Result<IdleEvent, SessionError> {
        let tag = self.tag();
        self.write_line(&format!("{tag} IDLE"))?;

        let mut early: Option<Vec<u8>> = None;
        loop {
            let line = self.read_line()?;
            if line.starts_with(b"+") {
                break;
            }
            if !line.starts_with(b"* ") {
                return Err(SessionError::Protocol(format!(
                    "IDLE not accepted: {}",
                    String::from_utf8_lossy(&line)
                )));
            }
            let line = untagged(line);
            if early.as_ref().is_none_or(|first| !is_exists_push(first) && is_exists_push(&line)) {
                early = Some(line);
            }
        }

        let event = match early {
            Some(line) => IdleEvent::Push(line),
            None => self.wait_for_push(timeout)?,
        };
        self.finish_idle(&tag)?;
        Ok(event)
    }

    fn wait_for_push(&mut self, timeout: Duration) -> Result<IdleEvent, SessionError> {
        self.set_read_timeout(timeout)?;
        let mut buf = Vec::new();
        match self.reader.read_until(b'\n', &mut buf) {
            Ok(0) => Err(SessionError::Connection("IMAP connection closed during IDLE".into())),
            Ok(_) => {
                while buf.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
                    buf.pop();
                }
                Ok(IdleEvent::Push(untagged(buf)))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(IdleEvent::Timeout)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Strip the `* ` marker of an untagged line.
fn untagged(line: Vec<u8>) -> Vec<u8> {
    match line.strip_prefix(b"* ") {
        Some(rest) => rest.to_vec(),
        None => line,
    }
}

/// Length announced by a trailing `{n}` literal marker.
fn literal_len(line: &[u8]) -> Option<usize> {
    let body = line.strip_suffix(b"}")?;
    let open = body.iter().rposition(|b| *b == b'{')?;
    std::str::from_utf8(&body[open + 1..]).ok()?.parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn open_transport(config: &EmailConfig) -> Result<Transport, SessionError> {
    let tcp = TcpStream::connect((config.imap_host.as_str(), config.imap_port))?;
    tcp.set_read_timeout(Some(COMMAND_TIMEOUT))?;

    if !config.use_tls {
        return Ok(Transport::Plain(tcp));
    }

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
        .map_err(|e| SessionError::Connection(format!("invalid IMAP host name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| SessionError::Connection(format!("TLS setup failed: {e}")))?;
    Ok(Transport::Tls(Box::new(rustls::StreamOwned::new(conn, tcp))))
}

fn open_blocking(config: &EmailConfig) -> Result<Wire, SessionError> {
    let mut wire = Wire::new(open_transport(config)?);

    let greeting = wire.read_line()?;
    if !(greeting.starts_with(b"* OK") || greeting.starts_with(b"* PREAUTH")) {
        return Err(SessionError::Protocol(format!(
            "unexpected greeting: {}",
            String::from_utf8_lossy(&greeting)
        )));
    }

    if !greeting.starts_with(b"* PREAUTH") {
        wire.login(&config.username, config.password.expose_secret())?;
    }
    Ok(wire)
}

/// A live IMAP session.
pub struct ImapClient {
    wire: Arc<Mutex<Wire>>,
    /// Second handle on the socket, usable while a blocking call holds the wire.
    socket: TcpStream,
}

impl ImapClient {
    fn new(wire: Wire) -> Result<Self, SessionError> {
        let socket = wire.reader.get_ref().socket().try_clone()?;
        Ok(Self {
            wire: Arc::new(Mutex::new(wire)),
            socket,
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Wire) -> Result<T, SessionError> + Send + 'static,
    {
        let wire = Arc::clone(&self.wire);
        tokio::task::spawn_blocking(move || {
            let mut guard = wire
                .lock()
                .map_err(|_| SessionError::Connection("IMAP wire poisoned".into()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| SessionError::Connection(format!("IMAP task failed: {e}")))?
    }
}

#[async_trait]
impl MailSession for ImapClient {
    async fn select(&mut self, mailbox: &str) -> Result<ImapResponse, SessionError> {
        let cmd = format!("SELECT {}", quote(mailbox));
        self.run(move |w| w.command(&cmd)).await
    }

    async fn uid_fetch(&mut self, set: &str, items: &str) -> Result<ImapResponse, SessionError> {
        let cmd = format!("UID FETCH {set} {items}");
        self.run(move |w| w.command(&cmd)).await
    }

    async fn idle(&mut self, timeout: Duration) -> Result<IdleEvent, SessionError> {
        self.run(move |w| w.idle(timeout)).await
    }

    async fn logout(&mut self) -> Result<(), SessionError> {
        self.run(|w| w.command("LOGOUT").map(|_| ())).await
    }

    fn interrupt(&mut self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            debug!(error = %e, "IMAP socket shutdown failed");
        }
    }
}

/// Opens `ImapClient` sessions for one account.
pub struct ImapConnector {
    config: EmailConfig,
}

impl ImapConnector {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionConnector for ImapConnector {
    async fn open(&self) -> Result<Box<dyn MailSession>, SessionError> {
        let config = self.config.clone();
        let wire = tokio::task::spawn_blocking(move || open_blocking(&config))
            .await
            .map_err(|e| SessionError::Connection(format!("IMAP connect task failed: {e}")))??;
        Ok(Box::new(ImapClient::new(wire)?))
    }
}
