//! Push/idle loop: wait for new-mail notifications and fetch on demand.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::imap::response::{IdleEvent, is_exists_push};
use crate::imap::{ConnectionManager, SessionState};
use crate::ingest::fetch::FetchEngine;
use crate::ingest::pipeline::DispatchQueue;

/// Process-wide stop request. Clones share the same flag.
#[derive(Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `trigger` has been called.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

enum Wake {
    Event(Result<IdleEvent, Error>),
    Stop,
}

/// Owns the connection for the lifetime of the listener.
pub struct IdleLoop {
    conn: ConnectionManager,
    engine: FetchEngine,
    idle_timeout: Duration,
    stop: StopSignal,
}

impl IdleLoop {
    pub fn new(
        conn: ConnectionManager,
        engine: FetchEngine,
        idle_timeout: Duration,
        stop: StopSignal,
    ) -> Self {
        Self {
            conn,
            engine,
            idle_timeout,
            stop,
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }

    /// Catch up, then idle until stopped. Only a fatal error is returned;
    /// everything else tears the session down and reconnects.
    pub async fn run(&mut self, queue: &DispatchQueue) -> Result<(), Error> {
        if let Err(e) = self.fetch(queue).await {
            self.recover(queue, e).await?;
        }

        while !self.stop.is_set() {
            match self.cycle(queue).await {
                Ok(true) => {}
                Ok(false) => {
                    // Stop arrived while an IDLE was still running on the session.
                    self.conn.abandon();
                    info!("Idle loop stopped");
                    return Ok(());
                }
                Err(e) => self.recover(queue, e).await?,
            }
        }

        self.conn.teardown().await;
        info!("Idle loop stopped");
        Ok(())
    }

    /// One IDLE round trip. `Ok(false)` means a stop interrupted the wait.
    async fn cycle(&mut self, queue: &DispatchQueue) -> Result<bool, Error> {
        self.conn.mark(SessionState::Idling);
        debug!(timeout = ?self.idle_timeout, "Entering IDLE");

        let timeout = self.idle_timeout;
        let stop = self.stop.clone();
        let session = self.conn.session_mut()?;
        let wake = tokio::select! {
            biased;
            _ = stop.wait() => Wake::Stop,
            event = session.idle(timeout) => Wake::Event(event.map_err(Error::from)),
        };

        let event = match wake {
            Wake::Stop => return Ok(false),
            Wake::Event(event) => event?,
        };
        self.conn.mark(SessionState::Selected);

        match event {
            IdleEvent::Push(line) if is_exists_push(&line) => {
                info!(push = %String::from_utf8_lossy(&line), "New messages announced");
                self.fetch(queue).await?;
            }
            IdleEvent::Push(line) => {
                debug!(push = %String::from_utf8_lossy(&line), "Ignoring notification");
            }
            IdleEvent::Timeout => debug!("IDLE timed out; re-issuing"),
        }
        Ok(true)
    }

    async fn fetch(&mut self, queue: &DispatchQueue) -> Result<usize, Error> {
        self.conn.mark(SessionState::Fetching);
        let session = self.conn.session_mut()?;
        let count = self.engine.fetch_new(session, queue).await?;
        self.conn.mark(SessionState::Selected);
        Ok(count)
    }

    /// Rebuild the session and catch up. Returns only on success, stop, or a
    /// fatal error.
    async fn recover(&mut self, queue: &DispatchQueue, cause: Error) -> Result<(), Error> {
        let mut cause = cause;
        loop {
            if cause.is_fatal() {
                error!(error = %cause, "Fatal listener error");
                return Err(cause);
            }
            warn!(error = %cause, "Session failed; reconnecting");
            self.conn.teardown().await;

            let delay = self.conn.reconnect_delay();
            tokio::select! {
                _ = self.stop.wait() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = self.conn.reconnect().await {
                cause = e.into();
                continue;
            }
            match self.fetch(queue).await {
                Ok(_) => return Ok(()),
                Err(e) => cause = e,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_signal_wakes_waiters() {
        let stop = StopSignal::new();
        let waiter = {
            let stop = stop.clone();
            tokio::spawn(async move { stop.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(!stop.is_set());
        stop.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(stop.is_set());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_set() {
        let stop = StopSignal::new();
        stop.trigger();
        tokio::time::timeout(Duration::from_millis(100), stop.wait())
            .await
            .unwrap();
    }
}
