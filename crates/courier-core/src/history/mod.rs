//! Persistent message history.
//!
//! Inbound messages are recorded so clients can page back through a chat.
//! Writes happen off the event path and failures there are only logged.

mod sqlite;

pub use sqlite::SqliteHistoryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::config::HistoryConfig;
use crate::error::Result;
use crate::transport::InboundMessage;

/// One stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub chat_id: String,
    pub sender: String,
    pub sender_phone: String,
    pub message_type: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_group: bool,
    pub is_from_me: bool,
}

impl From<&InboundMessage> for MessageRecord {
    fn from(message: &InboundMessage) -> Self {
        Self {
            message_id: message.id.clone(),
            chat_id: message.chat_id.clone(),
            sender: message.sender.clone(),
            sender_phone: message.sender_phone.clone(),
            message_type: message.content.type_name().to_string(),
            text: message.content.text().unwrap_or_default().to_string(),
            timestamp: message.timestamp,
            is_group: message.is_group,
            is_from_me: message.is_from_me,
        }
    }
}

/// Page request for one chat, newest messages first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatHistoryQuery {
    pub chat_id: String,
    pub limit: u32,
    pub offset: u32,
    /// Only messages from this sender.
    pub sender_phone: Option<String>,
    /// Only messages with non-empty text.
    pub text_only: bool,
}

impl ChatHistoryQuery {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            limit: HistoryConfig::DEFAULT_PAGE_SIZE,
            offset: 0,
            sender_phone: None,
            text_only: false,
        }
    }

    /// Page size; zero means the default and values above the maximum are capped.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = match limit {
            0 => HistoryConfig::DEFAULT_PAGE_SIZE,
            n => n.min(HistoryConfig::MAX_PAGE_SIZE),
        };
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_sender_phone(mut self, sender_phone: impl Into<String>) -> Self {
        self.sender_phone = Some(sender_phone.into());
        self
    }

    pub fn text_only(mut self, text_only: bool) -> Self {
        self.text_only = text_only;
        self
    }
}

/// One page of chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatHistoryResult {
    pub messages: Vec<MessageRecord>,
    /// Matching messages across all pages.
    pub total: u64,
    pub has_more: bool,
}

/// Storage backend for message history.
///
/// Implementations are synchronous; async callers run them on the blocking
/// thread pool.
pub trait HistoryStore: Send + Sync + Debug {
    /// Store a message. Storing the same id twice keeps the first copy.
    fn store_message(&self, record: &MessageRecord) -> Result<()>;

    fn chat_history(&self, query: &ChatHistoryQuery) -> Result<ChatHistoryResult>;

    /// Delete every stored message, returning how many were removed.
    fn clear(&self) -> Result<usize>;
}
