//! JSON-RPC request handlers, split by domain.

mod messages;
mod rate_limit;
mod service;

use crate::server::AppState;
use courier_core::{CourierError, Result};
use serde_json::{json, Value};

// ============================================================================
// Parameter extraction helpers
// ============================================================================

/// Extract an optional string parameter, supporting both snake_case and camelCase.
pub(crate) fn get_str_param<'a>(params: &'a Value, snake: &str, camel: &str) -> Option<&'a str> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_str())
}

/// Extract a required string parameter or return an error.
pub(crate) fn require_str_param(params: &Value, snake: &str, camel: &str) -> Result<String> {
    get_str_param(params, snake, camel)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            CourierError::invalid_params(format!("Missing required parameter: {}", snake))
        })
}

/// Extract an optional bool parameter, supporting both snake_case and camelCase.
pub(crate) fn get_bool_param(params: &Value, snake: &str, camel: &str) -> Option<bool> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_bool())
}

/// Extract an optional i64 parameter, supporting both snake_case and camelCase.
pub(crate) fn get_i64_param(params: &Value, snake: &str, camel: &str) -> Option<i64> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_i64())
}

// ============================================================================
// Method dispatcher
// ============================================================================

/// Dispatch a method call to the matching handler.
pub async fn dispatch_method(state: &AppState, method: &str, params: &Value) -> Result<Value> {
    match method {
        "health_check" => Ok(json!({ "status": "ok" })),

        // Service lifecycle
        "status" => service::status(state, params).await,
        "start" => service::start(state, params).await,
        "stop" => service::stop(state, params).await,
        "restart" => service::restart(state, params).await,
        "reset" => service::reset(state, params).await,
        "diagnostics" => service::diagnostics(state, params).await,
        "qr" => service::qr(state, params).await,

        // Messaging
        "send" => messages::send(state, params).await,
        "media" => messages::media(state, params).await,
        "typing" => messages::typing(state, params).await,
        "presence" => messages::presence(state, params).await,
        "mark_read" => messages::mark_read(state, params).await,
        "chat_history" => messages::chat_history(state, params).await,

        // Rate limiting
        "rate_limit_get" => rate_limit::get(state, params).await,
        "rate_limit_set" => rate_limit::set(state, params).await,
        "rate_limit_stats" => rate_limit::stats(state, params).await,
        "rate_limit_unpause" => rate_limit::unpause(state, params).await,

        _ => Err(CourierError::MethodNotFound(method.to_string())),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Local;
    use courier_core::{LoopbackProvider, MessagingService, MockClock, RateLimitConfig};
    use std::sync::Arc;

    pub(crate) async fn test_state() -> Arc<AppState> {
        test_state_with(Arc::new(LoopbackProvider::new().with_session("dev-1"))).await
    }

    /// A started service on a loopback transport, with rate limiting off.
    pub(crate) async fn test_state_with(provider: Arc<LoopbackProvider>) -> Arc<AppState> {
        let service = MessagingService::builder(provider)
            .clock(Arc::new(MockClock::new(Local::now())))
            .rate_limit(RateLimitConfig::disabled())
            .build()
            .await
            .unwrap();
        service.start().await.unwrap();
        AppState::new(service)
    }

    pub(crate) async fn call(state: &AppState, method: &str, params: Value) -> Result<Value> {
        dispatch_method(state, method, &params).await
    }

    #[test]
    fn test_param_helpers_accept_both_cases() {
        let params = json!({"chatId": "c1", "text_only": true, "limit": 5});
        assert_eq!(get_str_param(&params, "chat_id", "chatId"), Some("c1"));
        assert_eq!(get_bool_param(&params, "text_only", "textOnly"), Some(true));
        assert_eq!(get_i64_param(&params, "limit", "limit"), Some(5));

        let err = require_str_param(&json!({"jid": ""}), "jid", "jid").unwrap_err();
        assert_eq!(err.to_string(), "Invalid params: Missing required parameter: jid");
    }

    #[tokio::test]
    async fn test_health_and_unknown_method() {
        let state = test_state().await;
        assert_eq!(
            call(&state, "health_check", json!({})).await.unwrap()["status"],
            "ok"
        );

        let err = call(&state, "does_not_exist", json!({})).await.unwrap_err();
        assert_eq!(err.to_rpc_error_code(), -32601);
    }
}
