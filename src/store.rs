//! SQLite message store.
//!
//! Durable home of the message rows and the small preference table that backs
//! credentials and the fetch watermark. The store is a cache of server state
//! plus the locally-owned flags that must eventually reach the server:
//! `unread` (client read state), `unread_orig` (what the server believes) and
//! `deleted` (tombstone pending confirmation).

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::Message;

/// Database connection pool type.
pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// One stored message row.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: String,
    pub title: String,
    pub body_url: String,
    pub read_url: String,
    pub message_url: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// The raw listing entry as JSON text.
    pub raw: Value,
    /// Opaque reporting payload, if the server issued one.
    pub reporting: Option<Value>,
    /// Client-side read flag.
    pub unread: bool,
    /// Server-known read flag. A row is locally read when
    /// `unread = 0 AND unread <> unread_orig`.
    pub unread_orig: bool,
    /// Tombstone flag.
    pub deleted: bool,
}

impl MessageRecord {
    /// Builds a record from a freshly parsed server message.
    pub fn from_message(message: &Message) -> MessageRecord {
        MessageRecord {
            message_id: message.id.clone(),
            title: message.title.clone(),
            body_url: message.body_url.clone(),
            read_url: message.read_url.clone(),
            message_url: message.message_url.clone(),
            sent_at: message.sent,
            expires_at: message.expiry,
            raw: message.raw.clone(),
            reporting: message.reporting.clone(),
            unread: message.unread,
            unread_orig: message.unread,
            deleted: message.deleted,
        }
    }

    /// Rebuilds the in-memory model from this row.
    pub fn to_message(&self) -> Option<Message> {
        let mut message = Message::from_payload(&self.raw)?;
        message.unread = self.unread;
        message.deleted = self.deleted;
        Some(message)
    }
}

/// Durable message store backed by SQLite.
pub struct MessageStore {
    pool: DbPool,
}

impl MessageStore {
    /// Create a new store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| Error::Database(format!("Failed to create database pool: {}", e)))?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| Error::Database(format!("Failed to create database pool: {}", e)))?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Get a connection from the pool.
    fn connection(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| Error::Database(format!("Failed to get database connection: {}", e)))
    }

    /// Initialize the database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.connection()?;

        conn.execute_batch(
            r#"
            -- Enable foreign keys and WAL mode for better concurrency
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            -- Message rows
            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                title TEXT NOT NULL DEFAULT '',
                body_url TEXT NOT NULL,
                read_url TEXT NOT NULL,
                message_url TEXT,
                sent_at TEXT NOT NULL,
                expires_at TEXT,
                raw TEXT NOT NULL,          -- JSON listing entry
                reporting TEXT,             -- JSON reporting payload
                unread INTEGER NOT NULL DEFAULT 1,
                unread_orig INTEGER NOT NULL DEFAULT 1,
                deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_messages_sent_at ON messages(sent_at DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_body_url ON messages(body_url);
            CREATE INDEX IF NOT EXISTS idx_messages_deleted ON messages(deleted);

            -- Small KV table for credentials, watermark and clocks
            CREATE TABLE IF NOT EXISTS prefs (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
        )
        .map_err(|e| Error::Database(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    // ========== Message rows ==========

    /// Insert or update message rows from a server listing.
    ///
    /// Server-origin columns are refreshed; the locally-owned flags (`unread`,
    /// `unread_orig`, `deleted`) of an existing row are never touched, so a
    /// stale server echo cannot clobber a local mark-read or delete.
    pub fn upsert_messages(&self, records: &[MessageRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        for record in records {
            tx.execute(
                "INSERT INTO messages (message_id, title, body_url, read_url, message_url,
                    sent_at, expires_at, raw, reporting, unread, unread_orig, deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(message_id) DO UPDATE SET
                    title = excluded.title,
                    body_url = excluded.body_url,
                    read_url = excluded.read_url,
                    message_url = excluded.message_url,
                    sent_at = excluded.sent_at,
                    expires_at = excluded.expires_at,
                    raw = excluded.raw,
                    reporting = excluded.reporting",
                params![
                    record.message_id,
                    record.title,
                    record.body_url,
                    record.read_url,
                    record.message_url,
                    record.sent_at.to_rfc3339(),
                    record.expires_at.map(|dt| dt.to_rfc3339()),
                    record.raw.to_string(),
                    record.reporting.as_ref().map(|v| v.to_string()),
                    record.unread as i32,
                    record.unread_orig as i32,
                    record.deleted as i32,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Get every stored row, tombstones included.
    pub fn get_all(&self) -> Result<Vec<MessageRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM messages"))?;
        let rows = stmt
            .query_map([], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Get all non-deleted, non-expired rows as of `now`.
    pub fn get_active(&self, now: DateTime<Utc>) -> Result<Vec<MessageRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE deleted = 0 AND (expires_at IS NULL OR expires_at > ?1)"
        ))?;
        let rows = stmt
            .query_map(params![now.to_rfc3339()], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Get every stored message id, tombstones included.
    pub fn get_ids(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT message_id FROM messages")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Get one row by message id.
    pub fn get(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {COLUMNS} FROM messages WHERE message_id = ?1"))?;
        Ok(stmt
            .query_row(params![message_id], Self::row_to_record)
            .optional()?)
    }

    /// Rows marked read locally but not yet echoed to the server.
    pub fn get_locally_read(&self) -> Result<Vec<MessageRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM messages WHERE unread = 0 AND unread <> unread_orig"
        ))?;
        let rows = stmt
            .query_map([], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Rows tombstoned locally, pending server confirmation.
    pub fn get_locally_deleted(&self) -> Result<Vec<MessageRecord>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {COLUMNS} FROM messages WHERE deleted = 1"))?;
        let rows = stmt
            .query_map([], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Set the client read flag for the given ids.
    pub fn set_unread(&self, message_ids: &[String], unread: bool) -> Result<()> {
        self.update_flag("unread", message_ids, unread)
    }

    /// Set the server-known read flag for the given ids.
    pub fn set_unread_orig(&self, message_ids: &[String], unread: bool) -> Result<()> {
        self.update_flag("unread_orig", message_ids, unread)
    }

    /// Tombstone the given ids.
    pub fn set_deleted(&self, message_ids: &[String], deleted: bool) -> Result<()> {
        self.update_flag("deleted", message_ids, deleted)
    }

    fn update_flag(&self, column: &str, message_ids: &[String], value: bool) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let conn = self.connection()?;
        let sql = format!(
            "UPDATE messages SET {column} = {} WHERE message_id IN ({})",
            value as i32,
            placeholders(message_ids.len())
        );
        let changed = conn.execute(&sql, params_from_iter(message_ids))?;
        debug!(column, changed, "Updated message flags");
        Ok(())
    }

    /// Physically remove the given rows.
    pub fn delete_messages(&self, message_ids: &[String]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let conn = self.connection()?;
        let sql = format!(
            "DELETE FROM messages WHERE message_id IN ({})",
            placeholders(message_ids.len())
        );
        let deleted = conn.execute(&sql, params_from_iter(message_ids))?;
        debug!(deleted, "Deleted message rows");
        Ok(())
    }

    /// Remove every message row.
    pub fn delete_all(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM messages", [])?;
        Ok(())
    }

    fn row_to_record(row: &Row) -> std::result::Result<MessageRecord, rusqlite::Error> {
        let sent_at: String = row.get(5)?;
        let expires_at: Option<String> = row.get(6)?;
        let raw: String = row.get(7)?;
        let reporting: Option<String> = row.get(8)?;

        Ok(MessageRecord {
            message_id: row.get(0)?,
            title: row.get(1)?,
            body_url: row.get(2)?,
            read_url: row.get(3)?,
            message_url: row.get(4)?,
            sent_at: parse_rfc3339(&sent_at).unwrap_or_else(Utc::now),
            expires_at: expires_at.as_deref().and_then(parse_rfc3339),
            raw: serde_json::from_str(&raw).unwrap_or(Value::Null),
            reporting: reporting.as_deref().and_then(|r| serde_json::from_str(r).ok()),
            unread: row.get::<_, i32>(9)? != 0,
            unread_orig: row.get::<_, i32>(10)? != 0,
            deleted: row.get::<_, i32>(11)? != 0,
        })
    }

    // ========== Preferences ==========

    /// Get a preference value.
    pub fn get_pref(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        Ok(conn
            .query_row("SELECT value FROM prefs WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    /// Set a preference value.
    pub fn set_pref(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO prefs (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Remove a preference.
    pub fn remove_pref(&self, key: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM prefs WHERE key = ?1", params![key])?;
        Ok(())
    }
}

const COLUMNS: &str = "message_id, title, body_url, read_url, message_url, \
                       sent_at, expires_at, raw, reporting, unread, unread_orig, deleted";

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> MessageRecord {
        let payload = json!({
            "message_id": id,
            "message_body_url": format!("https://example.com/{id}/body/"),
            "message_read_url": format!("https://example.com/{id}/read/"),
            "message_sent": "2024-03-01T10:00:00Z",
            "title": id,
            "unread": true,
            "message_reporting": { "sent_id": id }
        });
        MessageRecord::from_message(&Message::from_payload(&payload).unwrap())
    }

    #[test]
    fn test_upsert_and_get() {
        let store = MessageStore::in_memory().unwrap();
        store.upsert_messages(&[record("m1"), record("m2")]).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 2);

        let m1 = store.get("m1").unwrap().unwrap();
        assert_eq!(m1.title, "m1");
        assert!(m1.unread);
        assert!(m1.unread_orig);
        assert!(!m1.deleted);
        assert_eq!(m1.reporting, Some(json!({ "sent_id": "m1" })));
    }

    #[test]
    fn test_upsert_preserves_local_flags() {
        let store = MessageStore::in_memory().unwrap();
        store.upsert_messages(&[record("m1"), record("m2")]).unwrap();

        store.set_unread(&["m1".to_string()], false).unwrap();
        store.set_deleted(&["m2".to_string()], true).unwrap();

        // A second listing still reports both as unread and live.
        store.upsert_messages(&[record("m1"), record("m2")]).unwrap();

        let m1 = store.get("m1").unwrap().unwrap();
        assert!(!m1.unread, "local read flag clobbered by server echo");
        let m2 = store.get("m2").unwrap().unwrap();
        assert!(m2.deleted, "tombstone clobbered by server echo");
    }

    #[test]
    fn test_upsert_idempotent() {
        let store = MessageStore::in_memory().unwrap();
        let records = [record("m1"), record("m2")];
        store.upsert_messages(&records).unwrap();
        store.upsert_messages(&records).unwrap();
        assert_eq!(store.get_all().unwrap().len(), 2);
    }

    #[test]
    fn test_locally_read_query() {
        let store = MessageStore::in_memory().unwrap();
        store.upsert_messages(&[record("m1"), record("m2"), record("m3")]).unwrap();

        store.set_unread(&["m1".to_string(), "m2".to_string()], false).unwrap();
        let mut pending: Vec<String> = store
            .get_locally_read()
            .unwrap()
            .into_iter()
            .map(|r| r.message_id)
            .collect();
        pending.sort();
        assert_eq!(pending, ["m1", "m2"]);

        // Server confirmed m1; it no longer matches.
        store.set_unread_orig(&["m1".to_string()], false).unwrap();
        let pending: Vec<String> = store
            .get_locally_read()
            .unwrap()
            .into_iter()
            .map(|r| r.message_id)
            .collect();
        assert_eq!(pending, ["m2"]);
    }

    #[test]
    fn test_locally_deleted_and_delete() {
        let store = MessageStore::in_memory().unwrap();
        store.upsert_messages(&[record("m1"), record("m2")]).unwrap();

        store.set_deleted(&["m1".to_string()], true).unwrap();
        assert_eq!(store.get_locally_deleted().unwrap().len(), 1);

        // Tombstones stay out of the active set but keep their row.
        let active = store.get_active(Utc::now()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(store.get_all().unwrap().len(), 2);

        store.delete_messages(&["m1".to_string()]).unwrap();
        assert_eq!(store.get_all().unwrap().len(), 1);
    }

    #[test]
    fn test_get_active_excludes_expired() {
        let store = MessageStore::in_memory().unwrap();
        let mut expired = record("m1");
        expired.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.upsert_messages(&[expired, record("m2")]).unwrap();

        let active = store.get_active(Utc::now()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].message_id, "m2");
    }

    #[test]
    fn test_prefs_roundtrip() {
        let store = MessageStore::in_memory().unwrap();
        assert!(store.get_pref("watermark").unwrap().is_none());

        store.set_pref("watermark", "Fri, 01 Mar 2024 10:00:00 GMT").unwrap();
        assert_eq!(
            store.get_pref("watermark").unwrap().unwrap(),
            "Fri, 01 Mar 2024 10:00:00 GMT"
        );

        store.set_pref("watermark", "updated").unwrap();
        assert_eq!(store.get_pref("watermark").unwrap().unwrap(), "updated");

        store.remove_pref("watermark").unwrap();
        assert!(store.get_pref("watermark").unwrap().is_none());
    }

    #[test]
    fn test_on_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox.db");
        {
            let store = MessageStore::new(&path).unwrap();
            store.upsert_messages(&[record("m1")]).unwrap();
        }
        let store = MessageStore::new(&path).unwrap();
        assert_eq!(store.get_all().unwrap().len(), 1);
    }
}
