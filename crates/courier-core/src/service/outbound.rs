//! Outbound operations: sends, attachment downloads and presence signals.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use super::MessagingService;
use crate::error::{CourierError, Result};
use crate::events::EventKind;
use crate::rate_limit::AdmitOptions;
use crate::transport::{
    Attachment, ChatPresence, ChatTarget, MediaKind, OutgoingContent, OutgoingMedia, Presence,
    PresenceMedia, QuotedMessage, SentMessage,
};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Base64 media attached to a send request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaData {
    pub data: String,
    pub mime_type: String,
    pub filename: Option<String>,
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationData {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactData {
    pub display_name: String,
    pub vcard: String,
}

/// A client's request to send one message, as received over RPC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageRequest {
    pub phone: Option<String>,
    pub group_id: Option<String>,
    pub message: String,
    /// text, image, document, audio, video, location, sticker or contact.
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    pub media_data: Option<MediaData>,
    pub location: Option<LocationData>,
    pub contact: Option<ContactData>,
    pub reply: Option<QuotedMessage>,
    /// Opaque client data, accepted and ignored.
    pub metadata: Option<HashMap<String, Value>>,
}

/// A validated send: where it goes and what it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub target: ChatTarget,
    pub content: OutgoingContent,
}

impl MessageRequest {
    /// Resolve the target and decode the content.
    ///
    /// Every shape error is reported here, before anything is sent.
    pub fn into_outgoing(self) -> Result<OutgoingMessage> {
        let target = match (non_empty(self.group_id), non_empty(self.phone)) {
            (Some(group_id), _) => ChatTarget::Group(group_id),
            (None, Some(phone)) => ChatTarget::Phone(phone.trim_start_matches('+').to_string()),
            (None, None) => {
                return Err(CourierError::invalid_params("phone or group_id is required"))
            }
        };

        let message_type = self.message_type.unwrap_or_default();
        let content = match message_type.as_str() {
            "" | "text" => {
                if self.message.trim().is_empty() {
                    return Err(CourierError::invalid_params(
                        "message is required for text messages",
                    ));
                }
                OutgoingContent::Text {
                    body: self.message,
                    reply: self.reply,
                }
            }
            "image" => media(MediaKind::Image, self.media_data, self.message)?,
            "video" => media(MediaKind::Video, self.media_data, self.message)?,
            "audio" => media(MediaKind::Audio, self.media_data, self.message)?,
            "document" => media(MediaKind::Document, self.media_data, self.message)?,
            "sticker" => media(MediaKind::Sticker, self.media_data, self.message)?,
            "location" => {
                let location = self.location.ok_or_else(|| {
                    CourierError::invalid_params("location is required for location messages")
                })?;
                if !(-90.0..=90.0).contains(&location.latitude)
                    || !(-180.0..=180.0).contains(&location.longitude)
                {
                    return Err(CourierError::invalid_params("location is out of range"));
                }
                OutgoingContent::Location {
                    latitude: location.latitude,
                    longitude: location.longitude,
                    name: location.name,
                    address: location.address,
                }
            }
            "contact" => {
                let contact = self
                    .contact
                    .filter(|c| !c.vcard.trim().is_empty())
                    .ok_or_else(|| {
                        CourierError::invalid_params("contact with a vcard is required")
                    })?;
                OutgoingContent::Contact {
                    display_name: contact.display_name,
                    vcard: contact.vcard,
                }
            }
            other => {
                return Err(CourierError::invalid_params(format!(
                    "unsupported message type: {other}"
                )))
            }
        };

        Ok(OutgoingMessage { target, content })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn media(kind: MediaKind, media_data: Option<MediaData>, message: String) -> Result<OutgoingContent> {
    let media_data = media_data.filter(|m| !m.data.is_empty()).ok_or_else(|| {
        CourierError::invalid_params(format!("media_data is required for {} messages", kind.as_str()))
    })?;
    let data = BASE64_STANDARD
        .decode(media_data.data.as_bytes())
        .map_err(|e| CourierError::invalid_params(format!("invalid base64 media data: {e}")))?;

    let mime_type = if media_data.mime_type.is_empty() {
        DEFAULT_MIME_TYPE.to_string()
    } else {
        media_data.mime_type
    };
    let caption = non_empty(media_data.caption).or_else(|| non_empty(Some(message)));

    Ok(OutgoingContent::Media(OutgoingMedia {
        kind,
        data,
        mime_type,
        filename: non_empty(media_data.filename),
        caption,
    }))
}

impl MessagingService {
    /// Send one message through the full pipeline.
    ///
    /// Order: validate, check connection, rate-governor admission, pacing
    /// delay, typing indicator, transport send, confirm the send, publish
    /// `message_sent`. Admission holds a window slot until the send finishes;
    /// a transport failure gives it back and leaves the counters untouched.
    /// `max_wait` bounds how long admission may wait; shutting the service
    /// down cancels a pending admission.
    pub async fn send_message(
        &self,
        request: MessageRequest,
        max_wait: Option<Duration>,
    ) -> Result<SentMessage> {
        let outgoing = request.into_outgoing()?;

        let transport = self.transport();
        if !transport.is_connected() {
            return Err(CourierError::NotConnected);
        }

        let recipient = outgoing.target.recipient_key().to_string();
        let options = AdmitOptions {
            max_wait,
            cancel: Some(self.lifecycle_token()),
        };
        let permit = self.governor.admit_with(&recipient, &options).await?;
        self.governor
            .apply_pacing_delay(outgoing.content.has_links())
            .await;
        self.governor
            .simulate_typing_if_enabled(transport.as_ref(), &outgoing.target)
            .await;

        let sent = transport
            .send(&outgoing.target, &outgoing.content)
            .await
            .inspect_err(|e| warn!("Send to {} failed: {}", outgoing.target, e))?;

        permit.confirm();
        info!(
            "Sent {} message {} to {}",
            outgoing.content.type_name(),
            sent.id,
            outgoing.target
        );
        self.emit(
            EventKind::MessageSent,
            json!({
                "message_id": sent.id,
                "to": recipient,
                "type": outgoing.content.type_name(),
                "timestamp": sent.timestamp,
            }),
        );
        Ok(sent)
    }

    /// Download the attachment of a recently received message.
    pub async fn download_media(&self, message_id: &str) -> Result<Attachment> {
        let message = self
            .cache
            .get(message_id)
            .ok_or_else(|| CourierError::MessageNotCached {
                message_id: message_id.to_string(),
                cached: self.cache.len(),
            })?;
        if message.content.media().is_none() {
            return Err(CourierError::NoMedia {
                message_id: message_id.to_string(),
            });
        }
        self.transport().download_attachment(&message).await
    }

    pub async fn send_typing(
        &self,
        target: &ChatTarget,
        state: ChatPresence,
        media: PresenceMedia,
    ) -> Result<()> {
        self.transport()
            .send_chat_presence(target, state, media)
            .await
    }

    pub async fn set_presence(&self, presence: Presence) -> Result<()> {
        self.transport().set_presence(presence).await
    }

    pub async fn mark_read(
        &self,
        message_ids: &[String],
        chat: &ChatTarget,
        sender: Option<&ChatTarget>,
    ) -> Result<()> {
        if message_ids.is_empty() {
            return Err(CourierError::invalid_params("message_ids must not be empty"));
        }
        self.transport().mark_read(message_ids, chat, sender).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitConfig;
    use crate::service::inbound::tests::{image_message, text_message};
    use crate::service::tests::{connected_harness, harness_with, settle};
    use crate::transport::{LoopbackProvider, TransportEvent};
    use std::sync::Arc;

    fn text_request(phone: &str, message: &str) -> MessageRequest {
        MessageRequest {
            phone: Some(phone.into()),
            message: message.into(),
            ..MessageRequest::default()
        }
    }

    #[test]
    fn test_validation_requires_target() {
        let err = MessageRequest {
            message: "hi".into(),
            ..MessageRequest::default()
        }
        .into_outgoing()
        .unwrap_err();
        assert_eq!(err.to_rpc_error_code(), -32602);
    }

    #[test]
    fn test_group_wins_over_phone() {
        let outgoing = MessageRequest {
            phone: Some("1".into()),
            group_id: Some("g1".into()),
            message: "hi".into(),
            ..MessageRequest::default()
        }
        .into_outgoing()
        .unwrap();
        assert_eq!(outgoing.target, ChatTarget::Group("g1".into()));
    }

    #[test]
    fn test_media_validation() {
        let mut request = text_request("1", "caption here");
        request.message_type = Some("image".into());
        assert!(request.clone().into_outgoing().is_err());

        request.media_data = Some(MediaData {
            data: "not base64!!".into(),
            ..MediaData::default()
        });
        assert!(request.clone().into_outgoing().is_err());

        request.media_data = Some(MediaData {
            data: BASE64_STANDARD.encode(b"png"),
            mime_type: "image/png".into(),
            ..MediaData::default()
        });
        match request.into_outgoing().unwrap().content {
            OutgoingContent::Media(media) => {
                assert_eq!(media.data, b"png");
                assert_eq!(media.caption.as_deref(), Some("caption here"));
            }
            other => panic!("expected media, got {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_type() {
        let mut request = text_request("1", "x");
        request.message_type = Some("poll".into());
        let err = request.into_outgoing().unwrap_err();
        assert!(err.to_string().contains("unsupported message type: poll"));
    }

    #[tokio::test]
    async fn test_send_pipeline_order_and_event() {
        let harness = connected_harness().await;
        settle().await;
        harness.service.hub().drain();

        let sent = harness
            .service
            .send_message(text_request("+15550001", "hello https://example.com"), None)
            .await
            .unwrap();

        let transport = harness.transport();
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent()[0].0, ChatTarget::Phone("15550001".into()));
        assert_eq!(transport.chat_presences().len(), 1);

        // Pacing (min 3s, max 8s, +5s for the link) then typing (2s).
        let sleeps = harness.clock.sleeps();
        assert_eq!(sleeps.len(), 2);
        assert!(sleeps[0] >= Duration::from_secs(8) && sleeps[0] < Duration::from_secs(13));
        assert_eq!(sleeps[1], Duration::from_secs(2));

        let stats = harness.service.rate_limit_stats();
        assert_eq!(stats.messages_sent_today, 1);
        assert_eq!(stats.new_contacts_today, 1);

        let event = harness.service.hub().queue().try_recv().unwrap();
        assert_eq!(event.kind, EventKind::MessageSent);
        assert_eq!(event.data["message_id"], sent.id);
        assert_eq!(event.data["to"], "15550001");
    }

    #[tokio::test]
    async fn test_failed_send_is_not_recorded() {
        let harness = connected_harness().await;
        harness.transport().fail_sends(true);

        let err = harness
            .service
            .send_message(text_request("1", "hi"), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_rpc_error_code(), -32000);
        assert_eq!(harness.service.rate_limit_stats().messages_sent_today, 0);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let harness = harness_with(
            LoopbackProvider::new().with_session("dev-1"),
            RateLimitConfig::default(),
        )
        .await;
        let err = harness
            .service
            .send_message(text_request("1", "hi"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::NotConnected));
    }

    #[tokio::test]
    async fn test_invalid_request_has_no_side_effects() {
        let harness = connected_harness().await;
        let _ = harness
            .service
            .send_message(MessageRequest::default(), None)
            .await
            .unwrap_err();
        assert!(harness.clock.sleeps().is_empty());
        assert!(harness.transport().chat_presences().is_empty());
    }

    #[tokio::test]
    async fn test_new_contact_cap_rejects_without_waiting() {
        let harness = connected_harness().await;
        harness.service.set_rate_limit_config(RateLimitConfig {
            max_new_contacts_per_day: 1,
            min_delay_ms: 0,
            simulate_typing: false,
            ..RateLimitConfig::default()
        });

        harness
            .service
            .send_message(text_request("1", "a"), None)
            .await
            .unwrap();
        let err = harness
            .service
            .send_message(text_request("2", "b"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::NewContactLimit { .. }));
        assert!(harness.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_max_wait_bounds_admission() {
        let harness = connected_harness().await;
        harness.service.set_rate_limit_config(RateLimitConfig {
            max_messages_per_minute: 1,
            min_delay_ms: 0,
            simulate_typing: false,
            ..RateLimitConfig::default()
        });
        harness
            .service
            .send_message(text_request("1", "a"), None)
            .await
            .unwrap();

        let err = harness
            .service
            .send_message(text_request("1", "b"), Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::AdmissionTimeout { .. }));
        assert_eq!(harness.transport().sent().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sends_share_the_minute_window() {
        let harness = connected_harness().await;
        harness.service.set_rate_limit_config(RateLimitConfig {
            max_messages_per_minute: 1,
            max_messages_per_hour: 0,
            max_new_contacts_per_day: 0,
            min_delay_ms: 1000,
            randomize_delays: false,
            simulate_typing: false,
            ..RateLimitConfig::default()
        });

        let (first, second) = tokio::join!(
            harness.service.send_message(text_request("1", "a"), None),
            harness.service.send_message(text_request("2", "b"), None),
        );
        first.unwrap();
        second.unwrap();

        // One of the two had to wait out the other's slot.
        assert!(
            harness
                .clock
                .sleeps()
                .iter()
                .any(|d| *d >= Duration::from_secs(59)),
            "sleeps: {:?}",
            harness.clock.sleeps()
        );
        let stats = harness.service.rate_limit_stats();
        assert_eq!(stats.messages_sent_today, 2);
        assert_eq!(stats.messages_sent_last_minute, 1);
        assert_eq!(harness.transport().sent().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_send_releases_its_slot() {
        let harness = connected_harness().await;
        harness.service.set_rate_limit_config(RateLimitConfig {
            max_messages_per_minute: 1,
            min_delay_ms: 0,
            simulate_typing: false,
            ..RateLimitConfig::default()
        });

        harness.transport().fail_sends(true);
        harness
            .service
            .send_message(text_request("1", "a"), None)
            .await
            .unwrap_err();
        let stats = harness.service.rate_limit_stats();
        assert_eq!(stats.messages_sent_last_minute, 0);
        assert_eq!(stats.new_contacts_today, 0);

        harness.transport().fail_sends(false);
        harness
            .service
            .send_message(text_request("1", "a"), None)
            .await
            .unwrap();
        assert!(harness.clock.sleeps().is_empty());
        assert_eq!(harness.service.rate_limit_stats().messages_sent_last_minute, 1);
    }

    #[tokio::test]
    async fn test_download_media() {
        let harness = connected_harness().await;
        let transport = harness.transport();
        transport.register_attachment(
            "blob-1",
            Attachment {
                data: b"jpg".to_vec(),
                mime_type: "image/jpeg".into(),
            },
        );
        harness
            .service
            .handle_transport_event(TransportEvent::Message(Box::new(image_message(
                "m1", "blob-1",
            ))));

        let attachment = harness.service.download_media("m1").await.unwrap();
        assert_eq!(attachment.data, b"jpg");

        harness
            .service
            .handle_transport_event(TransportEvent::Message(Box::new(text_message("m2", "hi"))));
        assert!(matches!(
            harness.service.download_media("m2").await,
            Err(CourierError::NoMedia { .. })
        ));
    }

    #[tokio::test]
    async fn test_download_evicted_message_fails() {
        let harness = connected_harness().await;
        for i in 0..101 {
            harness
                .service
                .handle_transport_event(TransportEvent::Message(Box::new(image_message(
                    &format!("m{i}"),
                    "blob",
                ))));
        }
        let err = harness.service.download_media("m0").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "message not found or expired (message_id: m0, cached: 100)"
        );
    }

    #[tokio::test]
    async fn test_presence_and_read_receipts() {
        let harness = connected_harness().await;
        harness.service.set_presence(Presence::Available).await.unwrap();
        harness
            .service
            .mark_read(
                &["a".to_string()],
                &ChatTarget::Jid("c@user.loopback".into()),
                None,
            )
            .await
            .unwrap();

        let transport: Arc<_> = harness.transport();
        assert_eq!(transport.presence(), Some(Presence::Available));
        assert_eq!(transport.read_receipts().len(), 1);
        assert!(harness
            .service
            .mark_read(&[], &ChatTarget::Jid("c".into()), None)
            .await
            .is_err());
    }
}
