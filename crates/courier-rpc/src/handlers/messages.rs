//! Messaging handlers: send, media download, presence and history.

use super::{get_bool_param, get_i64_param, get_str_param, require_str_param};
use crate::server::AppState;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use courier_core::{
    ChatHistoryQuery, ChatPresence, ChatTarget, CourierError, MessageRequest, Presence,
    PresenceMedia, Result,
};
use serde_json::{json, Value};
use std::time::Duration;

/// A chat addressed by a raw id, or by phone number when it carries no domain.
fn target_from_jid(jid: &str) -> ChatTarget {
    if jid.contains('@') {
        ChatTarget::Jid(jid.to_string())
    } else {
        ChatTarget::Phone(jid.trim_start_matches('+').to_string())
    }
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

pub async fn send(state: &AppState, params: &Value) -> Result<Value> {
    let request: MessageRequest = serde_json::from_value(params.clone())
        .map_err(|e| CourierError::invalid_params(format!("invalid send request: {e}")))?;
    let max_wait = get_i64_param(params, "max_wait_ms", "maxWaitMs")
        .map(|ms| {
            u64::try_from(ms).map(Duration::from_millis).map_err(|_| {
                CourierError::invalid_params(format!("max_wait_ms must be non-negative, got {ms}"))
            })
        })
        .transpose()?;

    let sent = state.service.send_message(request, max_wait).await?;
    Ok(json!({
        "message": "Sent",
        "message_id": sent.id,
        "timestamp": sent.timestamp,
    }))
}

pub async fn media(state: &AppState, params: &Value) -> Result<Value> {
    let message_id = require_str_param(params, "message_id", "messageId")?;
    let attachment = state.service.download_media(&message_id).await?;
    Ok(json!({
        "data": BASE64_STANDARD.encode(&attachment.data),
        "mime_type": attachment.mime_type,
    }))
}

pub async fn typing(state: &AppState, params: &Value) -> Result<Value> {
    let jid = require_str_param(params, "jid", "jid")?;
    let chat_state: ChatPresence = require_str_param(params, "state", "state")?.parse()?;
    let media: PresenceMedia = get_str_param(params, "media", "media")
        .unwrap_or_default()
        .parse()?;

    state
        .service
        .send_typing(&target_from_jid(&jid), chat_state, media)
        .await?;
    let label = match chat_state {
        ChatPresence::Composing => "composing",
        ChatPresence::Paused => "paused",
    };
    Ok(json!({ "message": format!("Typing state set to {label}") }))
}

pub async fn presence(state: &AppState, params: &Value) -> Result<Value> {
    let presence: Presence = require_str_param(params, "status", "status")?.parse()?;
    state.service.set_presence(presence).await?;
    let label = match presence {
        Presence::Available => "available",
        Presence::Unavailable => "unavailable",
    };
    Ok(json!({ "message": format!("Presence set to {label}") }))
}

pub async fn mark_read(state: &AppState, params: &Value) -> Result<Value> {
    let ids = params
        .get("message_ids")
        .or_else(|| params.get("messageIds"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| CourierError::invalid_params("Missing required parameter: message_ids"))?;
    let message_ids = ids
        .iter()
        .map(|id| id.as_str().map(String::from))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| CourierError::invalid_params("message_ids must be strings"))?;

    let chat = target_from_jid(&require_str_param(params, "chat_jid", "chatJid")?);
    let sender = get_str_param(params, "sender_jid", "senderJid").map(target_from_jid);

    state
        .service
        .mark_read(&message_ids, &chat, sender.as_ref())
        .await?;
    Ok(json!({ "message": format!("Marked {} messages as read", message_ids.len()) }))
}

pub async fn chat_history(state: &AppState, params: &Value) -> Result<Value> {
    let chat_id = if let Some(chat_id) = get_str_param(params, "chat_id", "chatId") {
        chat_id.to_string()
    } else if let Some(phone) = get_str_param(params, "phone", "phone") {
        state
            .service
            .resolve_chat_id(&ChatTarget::Phone(phone.trim_start_matches('+').to_string()))
    } else if let Some(group_id) = get_str_param(params, "group_id", "groupId") {
        state
            .service
            .resolve_chat_id(&ChatTarget::Group(group_id.to_string()))
    } else {
        return Err(CourierError::invalid_params(
            "chat_id, phone or group_id is required",
        ));
    };

    let mut query = ChatHistoryQuery::new(chat_id);
    if let Some(limit) = get_i64_param(params, "limit", "limit") {
        query = query.with_limit(to_u32(limit));
    }
    if let Some(offset) = get_i64_param(params, "offset", "offset") {
        query = query.with_offset(to_u32(offset));
    }
    if let Some(sender_phone) = get_str_param(params, "sender_phone", "senderPhone") {
        query = query.with_sender_phone(sender_phone);
    }
    if let Some(text_only) = get_bool_param(params, "text_only", "textOnly") {
        query = query.text_only(text_only);
    }

    let page = state.service.chat_history(query).await?;
    Ok(serde_json::to_value(page)?)
}
