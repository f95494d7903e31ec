//! Mail listener: connect, catch up, then idle until stopped.

use std::sync::Arc;

use tracing::info;

use crate::config::{EmailConfig, ListenerOptions};
use crate::error::Error;
use crate::handler::MessageHandler;
use crate::imap::{ConnectionManager, SessionConnector};
use crate::ingest::fetch::{FetchEngine, ProgressTracker};
use crate::ingest::idle::{IdleLoop, StopSignal};
use crate::ingest::pipeline::DispatchPipeline;
use crate::store::MailStore;
use crate::threads::ThreadResolver;

pub struct MailListener {
    email: EmailConfig,
    options: ListenerOptions,
    connector: Arc<dyn SessionConnector>,
    store: Arc<dyn MailStore>,
    handler: Arc<dyn MessageHandler>,
    stop: StopSignal,
}

impl MailListener {
    pub fn new(
        email: EmailConfig,
        options: ListenerOptions,
        connector: Arc<dyn SessionConnector>,
        store: Arc<dyn MailStore>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            email,
            options,
            connector,
            store,
            handler,
            stop: StopSignal::new(),
        }
    }

    /// Handle for requesting a stop from another task.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run until stopped or until the connection fails fatally.
    ///
    /// Workers finish every queued message before this returns.
    pub async fn start(&self) -> Result<(), Error> {
        info!(
            account = %self.email.username,
            host = %self.email.imap_host,
            mailbox = %self.email.mailbox,
            "Starting mail listener"
        );

        let mut conn = ConnectionManager::from_config(Arc::clone(&self.connector), &self.email);
        conn.connect().await?;

        let resolver = Arc::new(ThreadResolver::new(Arc::clone(&self.store)));
        let pipeline = DispatchPipeline::start(
            &self.options,
            &self.email.username,
            resolver,
            Arc::clone(&self.handler),
        );

        let progress = ProgressTracker::new(self.email.username.clone(), Arc::clone(&self.store));
        let engine = FetchEngine::new(self.email.mailbox.clone(), self.options.fetch_batch_size, progress)
            .with_stop(self.stop.clone());
        let mut idle = IdleLoop::new(conn, engine, self.email.idle_timeout, self.stop.clone());

        let queue = pipeline.queue();
        let result = idle.run(&queue).await;
        drop(queue);

        pipeline.shutdown().await;
        info!(ok = result.is_ok(), "Mail listener stopped");
        result
    }
}
