//! Conversation threading.

pub mod resolver;

pub use resolver::{Resolution, ThreadResolver, new_thread_id};
