//! Mailroom: mail ingestion and threading engine.

pub mod config;
pub mod error;
pub mod handler;
pub mod imap;
pub mod ingest;
pub mod mail;
pub mod outbound;
pub mod store;
pub mod threads;
