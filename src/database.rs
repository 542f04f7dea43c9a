use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::DateTime;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::message::MessageRecord;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to create database directory {path:?}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open database {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Upsert of message {message_id} affected no rows")]
    NoRowsAffected { message_id: String },

    #[error("Database connection lock poisoned")]
    Poisoned,
}

/// Anything that can persist classified messages. Ingest only needs this much.
pub trait RecordSink: Sync {
    fn upsert(&self, record: &MessageRecord) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderStats {
    pub folder: String,
    pub total: u64,
    pub unseen: u64,
    pub flagged: u64,
    pub receipts: u64,
    pub with_attachments: u64,
}

/// SQLite-backed message store. The connection sits behind a mutex so parallel
/// account workers can share one store.
pub struct MessageStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

const COLUMNS: &str = "message_id, seq_num, uid, from_address, from_name, to_address, subject,
    received_at, size_bytes, folder, is_seen, is_flagged, is_receipt, has_attachment,
    attachment_names, attributes";

impl MessageStore {
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let conn = Connection::open(db_path).map_err(|source| StoreError::Open {
            path: db_path.to_path_buf(),
            source,
        })?;

        let store = MessageStore {
            conn: Mutex::new(conn),
            db_path: Some(db_path.to_path_buf()),
        };
        store.initialize_schema()?;
        log::info!("Opened message store at {:?}", db_path);
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = MessageStore {
            conn: Mutex::new(Connection::open_in_memory()?),
            db_path: None,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn database_path(&self) -> String {
        match &self.db_path {
            Some(path) => path.to_string_lossy().to_string(),
            None => ":memory:".to_string(),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                message_id TEXT NOT NULL UNIQUE,
                seq_num INTEGER NOT NULL,
                uid INTEGER NOT NULL,
                from_address TEXT NOT NULL,
                from_name TEXT NOT NULL,
                to_address TEXT NOT NULL,
                subject TEXT NOT NULL,
                received_at INTEGER NOT NULL, -- Unix timestamp
                size_bytes INTEGER NOT NULL,
                folder TEXT NOT NULL,
                is_seen BOOLEAN NOT NULL DEFAULT 0,
                is_flagged BOOLEAN NOT NULL DEFAULT 0,
                is_receipt BOOLEAN NOT NULL DEFAULT 0,
                has_attachment BOOLEAN NOT NULL DEFAULT 0,
                attachment_names TEXT NOT NULL,
                attributes TEXT NOT NULL,     -- JSON object
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_folder ON messages(folder)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_received ON messages(received_at DESC)",
            [],
        )?;

        Ok(())
    }

    /// Insert or fully overwrite the row with this record's message-id.
    pub fn upsert(&self, record: &MessageRecord) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "INSERT INTO messages ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(message_id) DO UPDATE SET
                seq_num = excluded.seq_num,
                uid = excluded.uid,
                from_address = excluded.from_address,
                from_name = excluded.from_name,
                to_address = excluded.to_address,
                subject = excluded.subject,
                received_at = excluded.received_at,
                size_bytes = excluded.size_bytes,
                folder = excluded.folder,
                is_seen = excluded.is_seen,
                is_flagged = excluded.is_flagged,
                is_receipt = excluded.is_receipt,
                has_attachment = excluded.has_attachment,
                attachment_names = excluded.attachment_names,
                attributes = excluded.attributes,
                updated_at = strftime('%s', 'now')"
        );
        let affected = conn.execute(
            &sql,
            params![
                record.message_id,
                record.seq_num,
                record.uid,
                record.from,
                record.from_name,
                record.to,
                record.subject,
                record.received_at.timestamp(),
                record.size_bytes,
                record.folder,
                record.is_seen,
                record.is_flagged,
                record.is_receipt,
                record.has_attachment,
                record.attachment_names,
                record.attributes,
            ],
        )?;

        if affected == 0 {
            return Err(StoreError::NoRowsAffected {
                message_id: record.message_id.clone(),
            });
        }
        Ok(affected)
    }

    pub fn find_by_message_id(&self, message_id: &str) -> Result<Option<MessageRecord>, StoreError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {COLUMNS} FROM messages WHERE message_id = ?1");
        let record = conn
            .query_row(&sql, params![message_id], record_from_row)
            .optional()?;
        Ok(record)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn folder_stats(&self) -> Result<Vec<FolderStats>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT folder,
                    COUNT(*),
                    SUM(CASE WHEN is_seen THEN 0 ELSE 1 END),
                    SUM(is_flagged),
                    SUM(is_receipt),
                    SUM(has_attachment)
             FROM messages
             GROUP BY folder
             ORDER BY folder",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(FolderStats {
                folder: row.get(0)?,
                total: row.get::<_, i64>(1)? as u64,
                unseen: row.get::<_, i64>(2)? as u64,
                flagged: row.get::<_, i64>(3)? as u64,
                receipts: row.get::<_, i64>(4)? as u64,
                with_attachments: row.get::<_, i64>(5)? as u64,
            })
        })?;

        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }
}

impl RecordSink for MessageStore {
    fn upsert(&self, record: &MessageRecord) -> Result<usize, StoreError> {
        MessageStore::upsert(self, record)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let received: i64 = row.get(7)?;
    Ok(MessageRecord {
        message_id: row.get(0)?,
        seq_num: row.get(1)?,
        uid: row.get(2)?,
        from: row.get(3)?,
        from_name: row.get(4)?,
        to: row.get(5)?,
        subject: row.get(6)?,
        received_at: DateTime::from_timestamp(received, 0).unwrap_or_default(),
        size_bytes: row.get(8)?,
        folder: row.get(9)?,
        is_seen: row.get(10)?,
        is_flagged: row.get(11)?,
        is_receipt: row.get(12)?,
        has_attachment: row.get(13)?,
        attachment_names: row.get(14)?,
        attributes: row.get(15)?,
    })
}
