//! Port to the remote messaging network.
//!
//! The service talks to the network only through [`MessagingTransport`].
//! Asynchronous happenings on the network side (connection changes, pairing
//! codes, inbound messages) come back as [`TransportEvent`]s on the channel
//! handed to the [`TransportProvider`] when a transport is created.

mod loopback;

pub use loopback::{LoopbackProvider, LoopbackTransport};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{CourierError, Result};

/// Destination of a message or presence signal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTarget {
    /// A user addressed by phone number.
    Phone(String),
    /// A group addressed by its group id.
    Group(String),
    /// A fully qualified chat id, used verbatim.
    Jid(String),
}

impl ChatTarget {
    /// Key the rate governor tracks this recipient under.
    pub fn recipient_key(&self) -> &str {
        match self {
            ChatTarget::Phone(id) | ChatTarget::Group(id) | ChatTarget::Jid(id) => id,
        }
    }
}

impl std::fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatTarget::Phone(phone) => write!(f, "phone:{phone}"),
            ChatTarget::Group(group) => write!(f, "group:{group}"),
            ChatTarget::Jid(jid) => f.write_str(jid),
        }
    }
}

/// Per-chat typing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPresence {
    Composing,
    Paused,
}

impl FromStr for ChatPresence {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "composing" => Ok(ChatPresence::Composing),
            "paused" => Ok(ChatPresence::Paused),
            other => Err(CourierError::invalid_params(format!(
                "state must be 'composing' or 'paused', got '{other}'"
            ))),
        }
    }
}

/// What the user appears to be composing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceMedia {
    #[default]
    Text,
    Audio,
}

impl FromStr for PresenceMedia {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "text" => Ok(PresenceMedia::Text),
            "audio" => Ok(PresenceMedia::Audio),
            other => Err(CourierError::invalid_params(format!(
                "media must be 'text' or 'audio', got '{other}'"
            ))),
        }
    }
}

/// Account-wide online status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Available,
    Unavailable,
}

impl FromStr for Presence {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" | "online" => Ok(Presence::Available),
            "unavailable" | "offline" => Ok(Presence::Unavailable),
            other => Err(CourierError::invalid_params(format!(
                "status must be 'available' or 'unavailable', got '{other}'"
            ))),
        }
    }
}

/// Acknowledgement of a completed send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
        }
    }
}

/// Media payload of an outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMedia {
    pub kind: MediaKind,
    pub data: Vec<u8>,
    pub mime_type: String,
    pub filename: Option<String>,
    pub caption: Option<String>,
}

/// Message an outbound text replies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotedMessage {
    pub message_id: String,
    pub sender: String,
    pub content: String,
}

/// Validated body of an outbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingContent {
    Text {
        body: String,
        reply: Option<QuotedMessage>,
    },
    Media(OutgoingMedia),
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
    Contact {
        display_name: String,
        vcard: String,
    },
}

impl OutgoingContent {
    pub fn type_name(&self) -> &'static str {
        match self {
            OutgoingContent::Text { .. } => "text",
            OutgoingContent::Media(media) => media.kind.as_str(),
            OutgoingContent::Location { .. } => "location",
            OutgoingContent::Contact { .. } => "contact",
        }
    }

    /// True when the visible text carries an http(s) link.
    pub fn has_links(&self) -> bool {
        let text = match self {
            OutgoingContent::Text { body, .. } => Some(body.as_str()),
            OutgoingContent::Media(media) => media.caption.as_deref(),
            _ => None,
        };
        text.is_some_and(|t| t.contains("http://") || t.contains("https://"))
    }
}

/// Where to fetch an inbound attachment from, plus what it claims to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    /// Transport-specific handle used to download the attachment.
    pub locator: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_length: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactCard {
    pub display_name: String,
    pub vcard: String,
}

/// Body of an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundContent {
    Text(String),
    Image(MediaInfo),
    Video(MediaInfo),
    Audio { media: MediaInfo, voice_note: bool },
    Document(MediaInfo),
    Sticker(MediaInfo),
    Location {
        latitude: f64,
        longitude: f64,
        name: Option<String>,
        address: Option<String>,
    },
    Contact(ContactCard),
    Contacts(Vec<ContactCard>),
    Reaction { target_id: String, emoji: String },
    /// Edits, revokes and other control messages.
    Protocol,
    Unknown,
}

impl InboundContent {
    pub fn type_name(&self) -> &'static str {
        match self {
            InboundContent::Text(_) => "text",
            InboundContent::Image(_) => "image",
            InboundContent::Video(_) => "video",
            InboundContent::Audio { .. } => "audio",
            InboundContent::Document(_) => "document",
            InboundContent::Sticker(_) => "sticker",
            InboundContent::Location { .. } => "location",
            InboundContent::Contact(_) => "contact",
            InboundContent::Contacts(_) => "contacts",
            InboundContent::Reaction { .. } => "reaction",
            InboundContent::Protocol => "protocol",
            InboundContent::Unknown => "unknown",
        }
    }

    pub fn media(&self) -> Option<&MediaInfo> {
        match self {
            InboundContent::Image(media)
            | InboundContent::Video(media)
            | InboundContent::Document(media)
            | InboundContent::Sticker(media)
            | InboundContent::Audio { media, .. } => Some(media),
            _ => None,
        }
    }

    /// Human-readable text: the body of a text message or a media caption.
    pub fn text(&self) -> Option<&str> {
        match self {
            InboundContent::Text(text) => Some(text),
            other => other.media().and_then(|m| m.caption.as_deref()),
        }
    }

    /// Reactions, control messages and unrecognized payloads are cached but
    /// not forwarded to clients.
    pub fn is_forwardable(&self) -> bool {
        !matches!(
            self,
            InboundContent::Reaction { .. } | InboundContent::Protocol | InboundContent::Unknown
        )
    }
}

/// A message received from the network.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub chat_id: String,
    pub sender: String,
    pub sender_phone: String,
    pub push_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
    pub is_group: bool,
    pub group_name: Option<String>,
    pub content: InboundContent,
    /// Id of the message this one quotes, if any.
    pub quoted_id: Option<String>,
    pub forwarded: bool,
}

/// Downloaded attachment bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub data: Vec<u8>,
    pub mime_type: String,
}

/// Something that happened on the network side.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    ConnectFailure { reason: String },
    LoggedOut { reason: String },
    TemporaryBan { code: i32, expires_in_secs: Option<u64> },
    PairingCode { code: String },
    PairSuccess { device_id: String },
    Message(Box<InboundMessage>),
    /// Backfilled messages delivered after pairing.
    HistorySync(Vec<InboundMessage>),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Operations the service needs from the messaging network.
#[async_trait]
pub trait MessagingTransport: Send + Sync + Debug {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn is_logged_in(&self) -> bool;

    /// Id of the paired device, if a session exists.
    fn device_id(&self) -> Option<String>;

    /// Begin pairing a new device. Codes arrive as [`TransportEvent::PairingCode`].
    async fn start_pairing(&self) -> Result<()>;

    async fn logout(&self) -> Result<()>;

    async fn delete_session(&self) -> Result<()>;

    async fn send(&self, target: &ChatTarget, content: &OutgoingContent) -> Result<SentMessage>;

    async fn download_attachment(&self, message: &InboundMessage) -> Result<Attachment>;

    async fn send_chat_presence(
        &self,
        target: &ChatTarget,
        state: ChatPresence,
        media: PresenceMedia,
    ) -> Result<()>;

    async fn set_presence(&self, presence: Presence) -> Result<()>;

    async fn mark_read(
        &self,
        message_ids: &[String],
        chat: &ChatTarget,
        sender: Option<&ChatTarget>,
    ) -> Result<()>;

    /// Chat id under which messages exchanged with `target` are recorded.
    fn resolve_chat_id(&self, target: &ChatTarget) -> String;
}

/// Factory for transports. A full reset discards the current transport and
/// asks the provider for a fresh one.
pub trait TransportProvider: Send + Sync + Debug {
    fn create(&self, events: TransportEventSender) -> Result<Arc<dyn MessagingTransport>>;
}
