//! Handling of events coming from the transport.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::MessagingService;
use crate::events::EventKind;
use crate::history::MessageRecord;
use crate::transport::{InboundContent, InboundMessage, TransportEvent};

impl MessagingService {
    /// React to a transport event: update lifecycle flags, remember inbound
    /// messages and publish the matching client event.
    pub fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                info!("Transport connected");
                self.finish_pairing();
                let device_id = self.transport().device_id();
                self.emit(EventKind::Connected, json!({ "device_id": device_id }));
            }
            TransportEvent::Disconnected => {
                warn!("Transport disconnected");
                self.emit(EventKind::Disconnected, json!({}));
            }
            TransportEvent::ConnectFailure { reason } => {
                error!("Transport connection failed: {}", reason);
                self.emit(EventKind::ConnectionFailure, json!({ "reason": reason }));
            }
            TransportEvent::LoggedOut { reason } => {
                warn!("Logged out: {}", reason);
                self.emit(EventKind::LoggedOut, json!({ "reason": reason }));
            }
            TransportEvent::TemporaryBan {
                code,
                expires_in_secs,
            } => {
                error!("Temporary ban (code {}), expires in {:?}s", code, expires_in_secs);
                self.emit(
                    EventKind::TemporaryBan,
                    json!({ "code": code, "expires_in": expires_in_secs }),
                );
            }
            TransportEvent::PairingCode { code } => {
                let pairing_code = self.set_pairing_code(code);
                info!("New pairing code available");
                self.emit(
                    EventKind::QrCode,
                    json!({ "code": pairing_code.code, "timestamp": pairing_code.issued_at }),
                );
            }
            TransportEvent::PairSuccess { device_id } => {
                info!("Pairing succeeded for device {}", device_id);
                self.finish_pairing();
            }
            TransportEvent::Message(message) => self.handle_inbound_message(*message),
            TransportEvent::HistorySync(messages) => {
                let mut stored = 0;
                for message in messages.iter().filter(|m| m.content.is_forwardable()) {
                    self.persist(MessageRecord::from(message));
                    stored += 1;
                }
                info!("History sync: persisting {} messages", stored);
            }
        }
    }

    fn handle_inbound_message(&self, message: InboundMessage) {
        let message = Arc::new(message);
        self.cache.put(message.id.clone(), Arc::clone(&message));

        if !message.content.is_forwardable() {
            debug!(
                "Skipping {} message {} for broadcast",
                message.content.type_name(),
                message.id
            );
            return;
        }

        self.persist(MessageRecord::from(message.as_ref()));

        if !message.is_from_me {
            self.governor.record_response();
        }

        debug!(
            "Received {} message {} in {}",
            message.content.type_name(),
            message.id,
            message.chat_id
        );
        self.emit(EventKind::MessageReceived, inbound_event_data(&message));
    }

    /// Store a record on the blocking pool without waiting for it.
    fn persist(&self, record: MessageRecord) {
        let history = Arc::clone(&self.history);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = history.store_message(&record) {
                warn!("Failed to store message {}: {}", record.message_id, e);
            }
        });
    }
}

/// Payload of a `message_received` event.
fn inbound_event_data(message: &InboundMessage) -> Value {
    let mut data = Map::new();
    data.insert("message_id".into(), json!(message.id));
    data.insert("sender".into(), json!(message.sender));
    data.insert("sender_phone".into(), json!(message.sender_phone));
    data.insert("chat_id".into(), json!(message.chat_id));
    data.insert("timestamp".into(), json!(message.timestamp));
    data.insert("is_from_me".into(), json!(message.is_from_me));
    data.insert("is_group".into(), json!(message.is_group));
    data.insert("message_type".into(), json!(message.content.type_name()));
    data.insert(
        "content".into(),
        json!(message.content.text().unwrap_or_default()),
    );

    if let Some(push_name) = &message.push_name {
        data.insert("push_name".into(), json!(push_name));
    }
    if message.is_group {
        data.insert(
            "group_info".into(),
            json!({ "group_id": message.chat_id, "name": message.group_name }),
        );
    }
    if message.forwarded {
        data.insert("forwarded".into(), json!(true));
    }
    if let Some(quoted_id) = &message.quoted_id {
        data.insert("is_reply".into(), json!(true));
        data.insert("quoted_message_id".into(), json!(quoted_id));
    }

    if let Some(media) = message.content.media() {
        data.insert("has_media".into(), json!(true));
        data.insert("mime_type".into(), json!(media.mime_type));
        if let Some(filename) = &media.filename {
            data.insert("filename".into(), json!(filename));
        }
        if let Some(file_length) = media.file_length {
            data.insert("file_length".into(), json!(file_length));
        }
    }

    match &message.content {
        InboundContent::Audio { voice_note, .. } => {
            data.insert("voice_note".into(), json!(voice_note));
        }
        InboundContent::Location {
            latitude,
            longitude,
            name,
            address,
        } => {
            data.insert(
                "location".into(),
                json!({ "latitude": latitude, "longitude": longitude, "name": name, "address": address }),
            );
        }
        InboundContent::Contact(card) => {
            data.insert("contact".into(), json!(card));
        }
        InboundContent::Contacts(cards) => {
            data.insert("contacts".into(), json!(cards));
        }
        _ => {}
    }

    Value::Object(data)
}
