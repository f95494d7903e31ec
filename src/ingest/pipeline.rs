//! Dispatch pipeline: bounded queue plus a fixed pool of handler workers.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ListenerOptions;
use crate::handler::MessageHandler;
use crate::mail::{Message, MessageParseError, parse_message};
use crate::threads::ThreadResolver;

/// What happened to a fetched item handed to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// Sender is ignored or is the account itself.
    Ignored,
    /// Not parseable, or no readable body.
    Unreadable,
    /// The pipeline is shutting down.
    Closed,
}

/// Producer side of the pipeline. Cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<Message>,
    own_address: String,
    ignored: Arc<HashSet<String>>,
}

impl DispatchQueue {
    /// Parse, filter and enqueue one fetched item. Waits while the queue is full.
    pub async fn enqueue(&self, uid: u32, raw: &[u8]) -> EnqueueOutcome {
        let message = match parse_message(uid, raw) {
            Ok(m) => m,
            Err(e @ MessageParseError::NoBody { .. }) => {
                warn!(uid, "{e}");
                return EnqueueOutcome::Unreadable;
            }
            Err(e) => {
                error!(uid, "{e}");
                return EnqueueOutcome::Unreadable;
            }
        };

        let sender = message.sender.address.to_lowercase();
        if sender == self.own_address {
            debug!(uid, "Skipping message sent by this account");
            return EnqueueOutcome::Ignored;
        }
        if self.ignored.contains(&sender) {
            info!(uid, sender = %sender, "Ignoring message from ignored address");
            return EnqueueOutcome::Ignored;
        }

        let message_id = message.message_id().to_string();
        match self.tx.send(message).await {
            Ok(()) => {
                debug!(uid, message_id = %message_id, "Message enqueued");
                EnqueueOutcome::Enqueued
            }
            Err(_) => {
                warn!(uid, message_id = %message_id, "Dispatch queue closed; dropping message");
                EnqueueOutcome::Closed
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Running worker pool.
pub struct DispatchPipeline {
    queue: DispatchQueue,
    workers: Vec<JoinHandle<()>>,
}

impl DispatchPipeline {
    pub fn start(
        options: &ListenerOptions,
        own_address: &str,
        resolver: Arc<ThreadResolver>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let workers = (1..=options.worker_count.max(1))
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    Arc::clone(&rx),
                    Arc::clone(&resolver),
                    Arc::clone(&handler),
                ))
            })
            .collect::<Vec<_>>();

        info!(
            workers = workers.len(),
            queue_size = options.queue_size,
            "Dispatch pipeline started"
        );

        Self {
            queue: DispatchQueue {
                tx,
                own_address: own_address.to_lowercase(),
                ignored: Arc::new(options.ignore_addresses.clone()),
            },
            workers,
        }
    }

    pub fn queue(&self) -> DispatchQueue {
        self.queue.clone()
    }

    /// Close the queue and wait for the workers to drain it.
    ///
    /// Clones handed out by `queue()` keep the queue open; drop them first.
    pub async fn shutdown(self) {
        drop(self.queue);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Dispatch worker task failed: {e}");
            }
        }
        info!("Dispatch pipeline stopped");
    }
}

async fn run_worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    resolver: Arc<ThreadResolver>,
    handler: Arc<dyn MessageHandler>,
) {
    debug!(worker = id, "Worker started");
    loop {
        let next = rx.lock().await.recv().await;
        let Some(message) = next else {
            break;
        };

        let thread_id = resolver.resolve(&message).await;
        let outcome = AssertUnwindSafe(handler.consume(&thread_id, &message))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => debug!(
                worker = id,
                uid = message.uid,
                thread_id = %thread_id,
                "Message handled"
            ),
            Ok(Err(e)) => error!(
                worker = id,
                uid = message.uid,
                message_id = %message.message_id(),
                error = %e,
                "worker#{id}: cannot handle message #{}",
                message.uid
            ),
            Err(_) => error!(
                worker = id,
                uid = message.uid,
                message_id = %message.message_id(),
                "worker#{id}: handler panicked on message #{}",
                message.uid
            ),
        }
    }
    debug!(worker = id, "Worker stopped");
}
