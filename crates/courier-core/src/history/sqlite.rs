//! SQLite-backed message history.

use super::{ChatHistoryQuery, ChatHistoryResult, HistoryStore, MessageRecord};
use crate::error::{CourierError, Result};
use chrono::DateTime;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Message history stored in a single SQLite table.
///
/// Thread-safe via internal mutex on the connection.
#[derive(Debug)]
pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    /// Open (or create) the history database at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CourierError::Io {
                    message: format!(
                        "Failed to create history directory {}: {}",
                        parent.display(),
                        e
                    ),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path).map_err(|e| CourierError::Database {
            message: format!("Failed to open history database: {}", e),
            source: Some(e),
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| CourierError::Database {
                message: format!("Failed to set pragmas: {}", e),
                source: Some(e),
            })?;

        let store = Self::from_connection(conn)?;
        info!("Message history opened at {}", db_path.display());
        Ok(store)
    }

    /// A history that lives only as long as the process.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| CourierError::Database {
            message: format!("Failed to open in-memory history: {}", e),
            source: Some(e),
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS message_history (
                message_id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_phone TEXT NOT NULL,
                message_type TEXT NOT NULL,
                text TEXT NOT NULL DEFAULT '',
                timestamp_ms INTEGER NOT NULL,
                is_group INTEGER NOT NULL DEFAULT 0,
                is_from_me INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_history_chat_time
                ON message_history(chat_id, timestamp_ms DESC);

            CREATE INDEX IF NOT EXISTS idx_history_sender
                ON message_history(chat_id, sender_phone);
            "#,
        )
        .map_err(|e| CourierError::Database {
            message: format!("Failed to initialize history schema: {}", e),
            source: Some(e),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| CourierError::Database {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
        let timestamp_ms: i64 = row.get(6)?;
        Ok(MessageRecord {
            message_id: row.get(0)?,
            chat_id: row.get(1)?,
            sender: row.get(2)?,
            sender_phone: row.get(3)?,
            message_type: row.get(4)?,
            text: row.get(5)?,
            timestamp: DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_default(),
            is_group: row.get(7)?,
            is_from_me: row.get(8)?,
        })
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn store_message(&self, record: &MessageRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO message_history
                (message_id, chat_id, sender, sender_phone, message_type, text,
                 timestamp_ms, is_group, is_from_me)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.message_id,
                record.chat_id,
                record.sender,
                record.sender_phone,
                record.message_type,
                record.text,
                record.timestamp.timestamp_millis(),
                record.is_group,
                record.is_from_me,
            ],
        )?;
        debug!("Stored message {} in history", record.message_id);
        Ok(())
    }

    fn chat_history(&self, query: &ChatHistoryQuery) -> Result<ChatHistoryResult> {
        let conn = self.lock()?;

        let mut filter = String::from("chat_id = ?1");
        let mut args: Vec<String> = vec![query.chat_id.clone()];
        if let Some(sender_phone) = &query.sender_phone {
            args.push(sender_phone.clone());
            filter.push_str(&format!(" AND sender_phone = ?{}", args.len()));
        }
        if query.text_only {
            filter.push_str(" AND text != ''");
        }

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM message_history WHERE {filter}"),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT message_id, chat_id, sender, sender_phone, message_type, text,
                    timestamp_ms, is_group, is_from_me
             FROM message_history
             WHERE {filter}
             ORDER BY timestamp_ms DESC
             LIMIT {} OFFSET {}",
            query.limit, query.offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let total = u64::try_from(total).unwrap_or(0);
        let seen = u64::from(query.offset) + messages.len() as u64;
        Ok(ChatHistoryResult {
            has_more: seen < total,
            total,
            messages,
        })
    }

    fn clear(&self) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM message_history", [])?;
        info!("Cleared {} messages from history", removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, SqliteHistoryStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteHistoryStore::open(temp_dir.path().join("history.db")).unwrap();
        (temp_dir, store)
    }

    fn record(id: &str, chat: &str, sender_phone: &str, text: &str, minute: u32) -> MessageRecord {
        MessageRecord {
            message_id: id.into(),
            chat_id: chat.into(),
            sender: format!("{sender_phone}@user"),
            sender_phone: sender_phone.into(),
            message_type: if text.is_empty() { "image" } else { "text" }.into(),
            text: text.into(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 15, 12, minute, 0).unwrap(),
            is_group: false,
            is_from_me: false,
        }
    }

    #[test]
    fn test_store_creation() {
        let (temp_dir, _store) = create_test_store();
        assert!(temp_dir.path().join("history.db").exists());
    }

    #[test]
    fn test_newest_first_with_paging() {
        let (_dir, store) = create_test_store();
        for minute in 0..5 {
            store
                .store_message(&record(&format!("m{minute}"), "chat", "1", "hi", minute))
                .unwrap();
        }

        let page = store
            .chat_history(&ChatHistoryQuery::new("chat").with_limit(2))
            .unwrap();
        assert_eq!(page.total, 5);
        assert!(page.has_more);
        let ids: Vec<_> = page.messages.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m4", "m3"]);

        let last = store
            .chat_history(&ChatHistoryQuery::new("chat").with_limit(2).with_offset(4))
            .unwrap();
        assert_eq!(last.messages.len(), 1);
        assert!(!last.has_more);
    }

    #[test]
    fn test_filters() {
        let (_dir, store) = create_test_store();
        store.store_message(&record("a", "chat", "1", "hello", 0)).unwrap();
        store.store_message(&record("b", "chat", "2", "", 1)).unwrap();
        store.store_message(&record("c", "chat", "2", "yo", 2)).unwrap();
        store.store_message(&record("d", "other", "2", "x", 3)).unwrap();

        let by_sender = store
            .chat_history(&ChatHistoryQuery::new("chat").with_sender_phone("2"))
            .unwrap();
        assert_eq!(by_sender.total, 2);

        let text_only = store
            .chat_history(&ChatHistoryQuery::new("chat").text_only(true))
            .unwrap();
        assert_eq!(text_only.total, 2);
        assert!(text_only.messages.iter().all(|m| !m.text.is_empty()));
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let (_dir, store) = create_test_store();
        store.store_message(&record("a", "chat", "1", "first", 0)).unwrap();
        store.store_message(&record("a", "chat", "1", "second", 1)).unwrap();

        let page = store.chat_history(&ChatHistoryQuery::new("chat")).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.messages[0].text, "first");
    }

    #[test]
    fn test_clear() {
        let store = SqliteHistoryStore::in_memory().unwrap();
        store.store_message(&record("a", "chat", "1", "x", 0)).unwrap();
        store.store_message(&record("b", "chat", "1", "y", 1)).unwrap();

        assert_eq!(store.clear().unwrap(), 2);
        assert_eq!(
            store.chat_history(&ChatHistoryQuery::new("chat")).unwrap().total,
            0
        );
    }

    #[test]
    fn test_timestamp_round_trip() {
        let store = SqliteHistoryStore::in_memory().unwrap();
        let original = record("a", "chat", "1", "x", 7);
        store.store_message(&original).unwrap();
        let page = store.chat_history(&ChatHistoryQuery::new("chat")).unwrap();
        assert_eq!(page.messages[0], original);
    }
}
