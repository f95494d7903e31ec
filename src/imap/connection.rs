//! Connection manager: builds, owns and replaces the single live session.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::EmailConfig;
use crate::error::SessionError;
use crate::imap::session::{MailSession, SessionConnector};

/// Lifecycle state of the managed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    /// Mailbox selected, ready for commands.
    Selected,
    Idling,
    Fetching,
}

impl SessionState {
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, target),
            (Disconnected, Connecting) |
            (Connecting, Authenticated) |
            (Authenticated, Selected) |
            (Selected, Idling) | (Selected, Fetching) |
            (Idling, Selected) | (Idling, Fetching) |
            (Fetching, Selected) |
            // Any failure drops the session
            (_, Disconnected)
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Selected | Self::Idling | Self::Fetching)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Selected => "selected",
            Self::Idling => "idling",
            Self::Fetching => "fetching",
        };
        write!(f, "{s}")
    }
}

struct ActiveSession {
    generation: u64,
    session: Box<dyn MailSession>,
}

/// Holder for the current session. A reconnect swaps in a new one.
#[derive(Default)]
pub struct SessionSlot {
    active: Option<ActiveSession>,
}

impl SessionSlot {
    fn replace(&mut self, generation: u64, session: Box<dyn MailSession>) -> Option<ActiveSession> {
        self.active.replace(ActiveSession {
            generation,
            session,
        })
    }

    fn take(&mut self) -> Option<ActiveSession> {
        self.active.take()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_none()
    }
}

/// Connects with bounded retries and owns the resulting session.
pub struct ConnectionManager {
    connector: Arc<dyn SessionConnector>,
    mailbox: String,
    reconnect_delay: Duration,
    max_attempts: u32,
    state: SessionState,
    slot: SessionSlot,
    generation: u64,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        mailbox: impl Into<String>,
        reconnect_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            connector,
            mailbox: mailbox.into(),
            reconnect_delay,
            max_attempts: max_attempts.max(1),
            state: SessionState::Disconnected,
            slot: SessionSlot::default(),
            generation: 0,
        }
    }

    pub fn from_config(connector: Arc<dyn SessionConnector>, config: &EmailConfig) -> Self {
        Self::new(
            connector,
            config.mailbox.clone(),
            config.reconnect_delay,
            config.reconnect_max_attempts,
        )
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of sessions established so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    /// Record a state change. Illegal transitions are logged and ignored.
    pub fn mark(&mut self, next: SessionState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Ignoring illegal session transition");
            return false;
        }
        debug!(from = %self.state, to = %next, "Session state change");
        self.state = next;
        true
    }

    /// The live session, or `NotConnected`.
    pub fn session_mut(&mut self) -> Result<&mut dyn MailSession, SessionError> {
        match self.slot.active.as_mut() {
            Some(active) => Ok(active.session.as_mut()),
            None => Err(SessionError::NotConnected),
        }
    }

    /// Open a fresh session bound to the mailbox, replacing any current one.
    ///
    /// Fails with `SessionError::Auth` once every attempt is spent.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.teardown().await;

        let mut last_error = String::from("no attempt made");
        for attempt in 1..=self.max_attempts {
            self.mark(SessionState::Connecting);
            info!(
                attempt,
                max_attempts = self.max_attempts,
                mailbox = %self.mailbox,
                "Connecting to mail server"
            );

            match self.open_selected().await {
                Ok(session) => {
                    self.generation += 1;
                    if let Some(old) = self.slot.replace(self.generation, session) {
                        warn!(generation = old.generation, "Replaced a session that was not torn down");
                    }
                    self.mark(SessionState::Selected);
                    info!(generation = self.generation, mailbox = %self.mailbox, "Session ready");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Connection attempt failed");
                    last_error = e.to_string();
                    self.mark(SessionState::Disconnected);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.reconnect_delay).await;
                    }
                }
            }
        }

        error!(
            attempts = self.max_attempts,
            error = %last_error,
            "Giving up on mail server connection"
        );
        Err(SessionError::Auth {
            attempts: self.max_attempts,
            reason: last_error,
        })
    }

    async fn open_selected(&mut self) -> Result<Box<dyn MailSession>, SessionError> {
        let mut session = self.connector.open().await?;
        self.mark(SessionState::Authenticated);

        let selected = session
            .select(&self.mailbox)
            .await
            .and_then(|resp| resp.ensure_ok("SELECT"));
        if let Err(e) = selected {
            if let Err(logout) = session.logout().await {
                debug!(error = %logout, "Logout after failed select also failed");
            }
            return Err(e);
        }
        Ok(session)
    }

    /// Log out and drop the current session, if any.
    pub async fn teardown(&mut self) {
        if let Some(mut old) = self.slot.take() {
            info!(generation = old.generation, "Tearing down session");
            if let Err(e) = old.session.logout().await {
                debug!(generation = old.generation, error = %e, "Logout failed");
            }
        }
        self.mark(SessionState::Disconnected);
    }

    /// Drop the session without logging out. Used when a command may still
    /// be running on it; the transport is closed so that command returns.
    pub fn abandon(&mut self) {
        if let Some(mut old) = self.slot.take() {
            info!(generation = old.generation, "Abandoning session");
            old.session.interrupt();
        }
        self.mark(SessionState::Disconnected);
    }

    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        warn!(generation = self.generation, "Reconnecting");
        self.connect().await
    }
}
