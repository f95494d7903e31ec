//! Configuration types, built from `MAILROOM_*` environment variables.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Mail account and protocol settings.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    /// Plaintext IMAP is only meant for local test servers.
    pub use_tls: bool,
    pub mailbox: String,
    /// Upper bound for a single IDLE wait before it is re-issued.
    pub idle_timeout: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_max_attempts: u32,
    /// Domain used when minting `Message-ID` headers.
    pub msg_id_domain: String,
}

/// Ingestion pipeline tuning.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub worker_count: usize,
    pub fetch_batch_size: usize,
    pub queue_size: usize,
    /// Senders whose messages are dropped before dispatch (lowercase).
    pub ignore_addresses: HashSet<String>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            worker_count: 1,
            fetch_batch_size: 10,
            queue_size: 10,
            ignore_addresses: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    /// When set, forwards are written here as `.eml` files instead of sent.
    pub forwarded_messages_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub level: Option<String>,
    pub file: Option<PathBuf>,
}

/// Full process configuration.
#[derive(Debug, Clone)]
pub struct MailroomConfig {
    pub email: EmailConfig,
    pub listener: ListenerOptions,
    pub store: StoreConfig,
    pub logging: LogConfig,
}

impl MailroomConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.into()));

        let imap_host = required("MAILROOM_IMAP_HOST")?;
        let username = required("MAILROOM_USERNAME")?;
        let password = SecretString::from(required("MAILROOM_PASSWORD")?);

        let smtp_host = get("MAILROOM_SMTP_HOST").unwrap_or_else(|| imap_host.replace("imap", "smtp"));

        let msg_id_domain = match get("MAILROOM_MSG_ID_DOMAIN") {
            Some(domain) => domain,
            None => domain_of(&username).ok_or_else(|| ConfigError::InvalidValue {
                key: "MAILROOM_MSG_ID_DOMAIN".into(),
                message: format!("cannot derive a domain from username {username:?}"),
            })?,
        };

        let email = EmailConfig {
            imap_port: parse_or(&get, "MAILROOM_IMAP_PORT", 993)?,
            smtp_port: parse_or(&get, "MAILROOM_SMTP_PORT", 587)?,
            use_tls: parse_or(&get, "MAILROOM_USE_TLS", true)?,
            mailbox: get("MAILROOM_MAILBOX").unwrap_or_else(|| "INBOX".to_string()),
            idle_timeout: Duration::from_secs(parse_or(&get, "MAILROOM_IDLE_TIMEOUT_SECS", 29 * 60)?),
            reconnect_delay: Duration::from_secs(parse_or(&get, "MAILROOM_RECONNECT_DELAY_SECS", 5)?),
            reconnect_max_attempts: parse_or(&get, "MAILROOM_RECONNECT_MAX_ATTEMPTS", 3)?,
            imap_host,
            smtp_host,
            username,
            password,
            msg_id_domain,
        };

        let defaults = ListenerOptions::default();
        let listener = ListenerOptions {
            worker_count: parse_or(&get, "MAILROOM_WORKER_COUNT", defaults.worker_count)?,
            fetch_batch_size: parse_or(&get, "MAILROOM_FETCH_BATCH_SIZE", defaults.fetch_batch_size)?,
            queue_size: parse_or(&get, "MAILROOM_QUEUE_SIZE", defaults.queue_size)?,
            ignore_addresses: get("MAILROOM_IGNORE_ADDRESSES")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        let store = StoreConfig {
            db_path: get("MAILROOM_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/mailroom.db")),
            forwarded_messages_dir: get("MAILROOM_FORWARDED_DIR").map(PathBuf::from),
        };

        let logging = LogConfig {
            level: get("MAILROOM_LOG_LEVEL"),
            file: get("MAILROOM_LOG_FILE").map(PathBuf::from),
        };

        let config = Self {
            email,
            listener,
            store,
            logging,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("MAILROOM_WORKER_COUNT", self.listener.worker_count),
            ("MAILROOM_FETCH_BATCH_SIZE", self.listener.fetch_batch_size),
            ("MAILROOM_QUEUE_SIZE", self.listener.queue_size),
            (
                "MAILROOM_RECONNECT_MAX_ATTEMPTS",
                self.email.reconnect_max_attempts as usize,
            ),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: "must be at least 1".into(),
                });
            }
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.into(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Domain part of an email address.
pub fn domain_of(address: &str) -> Option<String> {
    let (local, domain) = address.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some(domain.to_string())
}
