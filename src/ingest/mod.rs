//! Inbound side: fetch, idle, dispatch.

pub mod fetch;
pub mod idle;
pub mod listener;
pub mod pipeline;

pub use fetch::{FetchEngine, ProgressTracker};
pub use idle::{IdleLoop, StopSignal};
pub use listener::MailListener;
pub use pipeline::{DispatchPipeline, DispatchQueue, EnqueueOutcome};
