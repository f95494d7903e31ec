use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use mailroom::config::{LogConfig, MailroomConfig};
use mailroom::handler::LoggingHandler;
use mailroom::imap::ImapConnector;
use mailroom::ingest::MailListener;
use mailroom::store::LibSqlStore;

/// How long workers get to drain after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        eprintln!("Warning: rustls crypto provider already installed");
    }

    let config = MailroomConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export MAILROOM_IMAP_HOST=imap.example.com");
        eprintln!("  export MAILROOM_USERNAME=desk@example.com");
        eprintln!("  export MAILROOM_PASSWORD=...");
        std::process::exit(1);
    });

    let _log_guard = init_tracing(&config.logging);

    eprintln!("📬 Mailroom v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Account: {}", config.email.username);
    eprintln!(
        "   IMAP: {}:{} ({})",
        config.email.imap_host, config.email.imap_port, config.email.mailbox
    );
    eprintln!("   Database: {}", config.store.db_path.display());

    let store = Arc::new(
        LibSqlStore::new_local(&config.store.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.store.db_path.display()))?,
    );

    let connector = Arc::new(ImapConnector::new(config.email.clone()));
    let listener = Arc::new(MailListener::new(
        config.email.clone(),
        config.listener.clone(),
        connector,
        store,
        Arc::new(LoggingHandler),
    ));
    let stop = listener.stop_signal();

    let mut task = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move { listener.start().await }
    });

    tokio::select! {
        joined = &mut task => {
            return joined
                .context("listener task failed")?
                .context("listener stopped with a fatal error");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!("Failed to listen for Ctrl-C: {e}");
            }
            tracing::info!("Shutdown requested");
            stop.trigger();
        }
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
        Ok(joined) => joined
            .context("listener task failed")?
            .context("listener stopped with a fatal error"),
        Err(_) => {
            tracing::warn!(grace = ?SHUTDOWN_GRACE, "Listener did not stop in time; exiting");
            Ok(())
        }
    }
}

/// Install the global subscriber. Logs go to `MAILROOM_LOG_FILE` when it can
/// be opened, stderr otherwise.
fn init_tracing(logging: &LogConfig) -> Option<WorkerGuard> {
    let default_level = logging.level.clone().unwrap_or_else(|| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let mut file_error = None;
    let (writer, guard) = match &logging.file {
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(file);
                (BoxMakeWriter::new(non_blocking), Some(guard))
            }
            Err(e) => {
                file_error = Some(format!("cannot open log file {}: {e}", path.display()));
                (BoxMakeWriter::new(std::io::stderr), None)
            }
        },
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(guard.is_none())
        .with_writer(writer)
        .init();

    if let Some(e) = file_error {
        tracing::warn!("{e}; logging to stderr");
    }
    guard
}
