//! libSQL backend: async `MailStore` implementation.
//!
//! Supports local file and in-memory databases. All access goes through one
//! connection behind an async mutex, so a link transaction is never observed
//! half-applied by a concurrent reader.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{MailStore, last_uid_key, message_key, thread_key};

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

async fn query_string(
    conn: &Connection,
    sql: &str,
    key: &str,
    op: &str,
) -> Result<Option<String>, StoreError> {
    let mut rows = conn
        .query(sql, params![key])
        .await
        .map_err(|e| StoreError::Query(format!("{op}: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<String>(0)
            .map(Some)
            .map_err(|e| StoreError::Query(format!("{op}: {e}"))),
        Ok(None) => Ok(None),
        Err(e) => Err(StoreError::Query(format!("{op}: {e}"))),
    }
}

fn to_uid(value: i64, op: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Query(format!("{op}: stored uid {value} out of range")))
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl MailStore for LibSqlStore {
    async fn get_last_uid(&self, account: &str) -> Result<Option<u32>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT value FROM kv_counters WHERE key = ?1",
                params![last_uid_key(account)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_last_uid: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value: i64 = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("get_last_uid: {e}")))?;
                Ok(Some(to_uid(value, "get_last_uid")?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_last_uid: {e}"))),
        }
    }

    async fn advance_last_uid(&self, account: &str, uid: u32) -> Result<u32, StoreError> {
        let key = last_uid_key(account);
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO kv_counters (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT (key) DO UPDATE SET
                value = MAX(kv_counters.value, excluded.value),
                updated_at = excluded.updated_at",
            params![key.as_str(), i64::from(uid)],
        )
        .await
        .map_err(|e| StoreError::Query(format!("advance_last_uid: {e}")))?;

        let mut rows = conn
            .query("SELECT value FROM kv_counters WHERE key = ?1", params![key.as_str()])
            .await
            .map_err(|e| StoreError::Query(format!("advance_last_uid: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("advance_last_uid: {e}")))?
            .ok_or_else(|| StoreError::Query("advance_last_uid: marker row missing".into()))?;
        let stored: i64 = row
            .get(0)
            .map_err(|e| StoreError::Query(format!("advance_last_uid: {e}")))?;
        let stored = to_uid(stored, "advance_last_uid")?;
        debug!(account, uid, stored, "Marker advanced");
        Ok(stored)
    }

    async fn get_message_thread(&self, message_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().await;
        query_string(
            &conn,
            "SELECT value FROM kv_values WHERE key = ?1",
            &message_key(message_id),
            "get_message_thread",
        )
        .await
    }

    async fn lookup_thread(&self, message_ids: &[String]) -> Result<Option<String>, StoreError> {
        if message_ids.is_empty() {
            return Ok(None);
        }
        let conn = self.conn.lock().await;
        for message_id in message_ids {
            let found = query_string(
                &conn,
                "SELECT value FROM kv_values WHERE key = ?1",
                &message_key(message_id),
                "lookup_thread",
            )
            .await?;
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    async fn link_message(&self, message_id: &str, thread_id: &str) -> Result<String, StoreError> {
        let msg_key = message_key(message_id);
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| StoreError::Transaction(format!("link_message begin: {e}")))?;

        tx.execute(
            "INSERT OR IGNORE INTO kv_values (key, value) VALUES (?1, ?2)",
            params![msg_key.as_str(), thread_id],
        )
        .await
        .map_err(|e| StoreError::Transaction(format!("link_message mapping: {e}")))?;

        let effective = query_string(
            &tx,
            "SELECT value FROM kv_values WHERE key = ?1",
            &msg_key,
            "link_message",
        )
        .await?
        .ok_or_else(|| StoreError::Transaction("link_message: mapping not visible".into()))?;

        tx.execute(
            "INSERT OR IGNORE INTO kv_sets (key, member) VALUES (?1, ?2)",
            params![thread_key(&effective), message_id],
        )
        .await
        .map_err(|e| StoreError::Transaction(format!("link_message membership: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Transaction(format!("link_message commit: {e}")))?;

        if effective != thread_id {
            debug!(
                message_id,
                requested = thread_id,
                thread_id = %effective,
                "Message already linked; keeping first thread"
            );
        }
        Ok(effective)
    }

    async fn thread_messages(&self, thread_id: &str) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT member FROM kv_sets WHERE key = ?1",
                params![thread_key(thread_id)],
            )
            .await
            .map_err(|e| StoreError::Query(format!("thread_messages: {e}")))?;

        let mut members = HashSet::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("thread_messages: {e}")))?
        {
            let member: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("thread_messages: {e}")))?;
            members.insert(member);
        }
        Ok(members)
    }
}
