//! In-memory transport.
//!
//! Nothing leaves the process: sends and presence signals are recorded,
//! pairing completes locally, and attachments are served from a table that
//! callers fill in. The RPC binary runs on it when no network transport is
//! linked, and the test suites use it to drive the service.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Attachment, ChatPresence, ChatTarget, InboundMessage, MessagingTransport, OutgoingContent,
    Presence, PresenceMedia, SentMessage, TransportEvent, TransportEventSender, TransportProvider,
};
use crate::error::{CourierError, Result};

const USER_DOMAIN: &str = "user.loopback";
const GROUP_DOMAIN: &str = "group.loopback";

#[derive(Debug, Default)]
struct LoopbackState {
    connected: bool,
    device_id: Option<String>,
    manual_pairing: bool,
    sent: Vec<(ChatTarget, OutgoingContent, SentMessage)>,
    chat_presences: Vec<(ChatTarget, ChatPresence, PresenceMedia)>,
    presence: Option<Presence>,
    read_receipts: Vec<(Vec<String>, ChatTarget)>,
    attachments: HashMap<String, Attachment>,
    fail_sends: bool,
    fail_presence: bool,
}

/// Transport that keeps everything in memory.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    state: Mutex<LoopbackState>,
    events: Option<TransportEventSender>,
}

impl LoopbackTransport {
    /// A transport with no session and no event channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that reports network events on `events`.
    pub fn with_events(events: TransportEventSender) -> Self {
        Self {
            state: Mutex::default(),
            events: Some(events),
        }
    }

    /// Start with an existing paired session.
    pub fn with_session(self, device_id: impl Into<String>) -> Self {
        self.lock().device_id = Some(device_id.into());
        self
    }

    /// Stop `start_pairing` after emitting the code; call
    /// [`complete_pairing`](Self::complete_pairing) to finish.
    pub fn with_manual_pairing(self) -> Self {
        self.lock().manual_pairing = true;
        self
    }

    /// Finish a pending pairing as if the code had been scanned.
    pub fn complete_pairing(&self) -> String {
        let device_id = format!("{}.0@{}", Uuid::new_v4().simple(), USER_DOMAIN);
        {
            let mut state = self.lock();
            state.device_id = Some(device_id.clone());
            state.connected = true;
        }
        self.emit(TransportEvent::PairSuccess {
            device_id: device_id.clone(),
        });
        self.emit(TransportEvent::Connected);
        device_id
    }

    /// Push an event as if it came from the network.
    pub fn inject(&self, event: TransportEvent) {
        self.emit(event);
    }

    /// Make `locator` downloadable.
    pub fn register_attachment(&self, locator: impl Into<String>, attachment: Attachment) {
        self.lock().attachments.insert(locator.into(), attachment);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    pub fn fail_presence(&self, fail: bool) {
        self.lock().fail_presence = fail;
    }

    /// Every successful send, oldest first.
    pub fn sent(&self) -> Vec<(ChatTarget, OutgoingContent, SentMessage)> {
        self.lock().sent.clone()
    }

    pub fn chat_presences(&self) -> Vec<(ChatTarget, ChatPresence, PresenceMedia)> {
        self.lock().chat_presences.clone()
    }

    pub fn presence(&self) -> Option<Presence> {
        self.lock().presence
    }

    pub fn read_receipts(&self) -> Vec<(Vec<String>, ChatTarget)> {
        self.lock().read_receipts.clone()
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("Loopback event receiver dropped");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessagingTransport for LoopbackTransport {
    async fn connect(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.device_id.is_none() {
                return Err(CourierError::transport("no session, pairing required"));
            }
            state.connected = true;
        }
        self.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        let was_connected = std::mem::replace(&mut self.lock().connected, false);
        if was_connected {
            self.emit(TransportEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn is_logged_in(&self) -> bool {
        let state = self.lock();
        state.connected && state.device_id.is_some()
    }

    fn device_id(&self) -> Option<String> {
        self.lock().device_id.clone()
    }

    async fn start_pairing(&self) -> Result<()> {
        let code = format!("2@{}", Uuid::new_v4().simple());
        info!("Loopback pairing code issued");
        self.emit(TransportEvent::PairingCode { code });
        if !self.lock().manual_pairing {
            self.complete_pairing();
        }
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        {
            let mut state = self.lock();
            state.connected = false;
            state.device_id = None;
        }
        self.emit(TransportEvent::LoggedOut {
            reason: "logged out locally".into(),
        });
        Ok(())
    }

    async fn delete_session(&self) -> Result<()> {
        self.lock().device_id = None;
        Ok(())
    }

    async fn send(&self, target: &ChatTarget, content: &OutgoingContent) -> Result<SentMessage> {
        let mut state = self.lock();
        if !state.connected {
            return Err(CourierError::NotConnected);
        }
        if state.fail_sends {
            return Err(CourierError::transport("simulated send failure"));
        }
        let sent = SentMessage {
            id: Uuid::new_v4().simple().to_string().to_uppercase(),
            timestamp: Utc::now(),
        };
        state
            .sent
            .push((target.clone(), content.clone(), sent.clone()));
        Ok(sent)
    }

    async fn download_attachment(&self, message: &InboundMessage) -> Result<Attachment> {
        let media = message.content.media().ok_or_else(|| CourierError::NoMedia {
            message_id: message.id.clone(),
        })?;
        self.lock()
            .attachments
            .get(&media.locator)
            .cloned()
            .ok_or_else(|| CourierError::transport(format!("attachment {} unavailable", media.locator)))
    }

    async fn send_chat_presence(
        &self,
        target: &ChatTarget,
        state: ChatPresence,
        media: PresenceMedia,
    ) -> Result<()> {
        let mut inner = self.lock();
        if inner.fail_presence {
            return Err(CourierError::transport("simulated presence failure"));
        }
        inner.chat_presences.push((target.clone(), state, media));
        Ok(())
    }

    async fn set_presence(&self, presence: Presence) -> Result<()> {
        self.lock().presence = Some(presence);
        Ok(())
    }

    async fn mark_read(
        &self,
        message_ids: &[String],
        chat: &ChatTarget,
        _sender: Option<&ChatTarget>,
    ) -> Result<()> {
        self.lock()
            .read_receipts
            .push((message_ids.to_vec(), chat.clone()));
        Ok(())
    }

    fn resolve_chat_id(&self, target: &ChatTarget) -> String {
        match target {
            ChatTarget::Phone(phone) => format!("{phone}@{USER_DOMAIN}"),
            ChatTarget::Group(group) if group.contains('@') => group.clone(),
            ChatTarget::Group(group) => format!("{group}@{GROUP_DOMAIN}"),
            ChatTarget::Jid(jid) => jid.clone(),
        }
    }
}

/// Provider that hands out [`LoopbackTransport`]s and remembers the latest.
#[derive(Debug, Default)]
pub struct LoopbackProvider {
    session: Option<String>,
    manual_pairing: bool,
    current: Mutex<Option<Arc<LoopbackTransport>>>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first transport created starts with this paired session.
    pub fn with_session(mut self, device_id: impl Into<String>) -> Self {
        self.session = Some(device_id.into());
        self
    }

    pub fn with_manual_pairing(mut self) -> Self {
        self.manual_pairing = true;
        self
    }

    /// The transport most recently created.
    pub fn current(&self) -> Option<Arc<LoopbackTransport>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TransportProvider for LoopbackProvider {
    fn create(&self, events: TransportEventSender) -> Result<Arc<dyn MessagingTransport>> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        let mut transport = LoopbackTransport::with_events(events);
        // A reset deletes the session, so only the first transport inherits it.
        if current.is_none() {
            if let Some(device_id) = &self.session {
                transport = transport.with_session(device_id.clone());
            }
        }
        if self.manual_pairing {
            transport = transport.with_manual_pairing();
        }

        let transport = Arc::new(transport);
        *current = Some(Arc::clone(&transport));
        Ok(transport)
    }
}
