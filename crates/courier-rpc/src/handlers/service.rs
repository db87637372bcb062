//! Service lifecycle and status handlers.

use crate::server::AppState;
use courier_core::Result;
use serde_json::{json, Value};

pub async fn status(state: &AppState, _params: &Value) -> Result<Value> {
    Ok(serde_json::to_value(state.service.status())?)
}

pub async fn start(state: &AppState, _params: &Value) -> Result<Value> {
    state.service.start().await?;
    Ok(json!({ "message": "Started" }))
}

pub async fn stop(state: &AppState, _params: &Value) -> Result<Value> {
    state.service.shutdown().await;
    Ok(json!({ "message": "Stopped" }))
}

pub async fn restart(state: &AppState, _params: &Value) -> Result<Value> {
    state.service.restart().await?;
    Ok(json!({ "message": "Restarted (session cleared)" }))
}

pub async fn reset(state: &AppState, _params: &Value) -> Result<Value> {
    state.service.reset().await?;
    Ok(json!({ "message": "Reset" }))
}

pub async fn diagnostics(state: &AppState, _params: &Value) -> Result<Value> {
    Ok(state.service.diagnostics())
}

pub async fn qr(state: &AppState, _params: &Value) -> Result<Value> {
    let code = state.service.current_pairing_code()?;
    Ok(json!({
        "has_qr": true,
        "code": code.code,
        "timestamp": code.issued_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::tests::{call, test_state};
    use serde_json::json;

    #[tokio::test]
    async fn test_status_reports_connection() {
        let state = test_state().await;
        let status = call(&state, "status", json!({})).await.unwrap();
        assert_eq!(status["connected"], true);
        assert_eq!(status["running"], true);
        assert_eq!(status["device_id"], "dev-1");
    }

    #[tokio::test]
    async fn test_stop_then_start() {
        let state = test_state().await;
        let stopped = call(&state, "stop", json!({})).await.unwrap();
        assert_eq!(stopped["message"], "Stopped");
        assert_eq!(call(&state, "status", json!({})).await.unwrap()["running"], false);

        let started = call(&state, "start", json!({})).await.unwrap();
        assert_eq!(started["message"], "Started");
        assert_eq!(call(&state, "status", json!({})).await.unwrap()["connected"], true);
    }

    #[tokio::test]
    async fn test_qr_without_code() {
        let state = test_state().await;
        let err = call(&state, "qr", json!({})).await.unwrap_err();
        assert_eq!(err.to_rpc_error_code(), -32001);
        assert_eq!(err.to_string(), "No QR available");
    }

    #[tokio::test]
    async fn test_restart_clears_session() {
        let state = test_state().await;
        let result = call(&state, "restart", json!({})).await.unwrap();
        assert_eq!(result["message"], "Restarted (session cleared)");

        let status = call(&state, "status", json!({})).await.unwrap();
        assert_ne!(status["device_id"], "dev-1");
    }

    #[tokio::test]
    async fn test_diagnostics() {
        let state = test_state().await;
        let diagnostics = call(&state, "diagnostics", json!({})).await.unwrap();
        assert_eq!(diagnostics["transport"]["connected"], true);
        assert_eq!(diagnostics["rate_limit"]["enabled"], false);
    }
}
