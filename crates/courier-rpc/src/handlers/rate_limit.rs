//! Rate-limit policy and statistics handlers.

use crate::server::AppState;
use courier_core::Result;
use serde_json::{json, Value};

pub async fn get(state: &AppState, _params: &Value) -> Result<Value> {
    Ok(json!({
        "config": state.service.rate_limit_config(),
        "stats": state.service.rate_limit_stats(),
    }))
}

/// Merge the given fields over the current policy. Absent fields keep their value.
pub async fn set(state: &AppState, params: &Value) -> Result<Value> {
    let merged = state.service.rate_limit_config().merged(params)?;
    let config = state.service.set_rate_limit_config(merged);
    Ok(json!({
        "message": "Rate limit config updated",
        "config": config,
    }))
}

pub async fn stats(state: &AppState, _params: &Value) -> Result<Value> {
    Ok(serde_json::to_value(state.service.rate_limit_stats())?)
}

pub async fn unpause(state: &AppState, _params: &Value) -> Result<Value> {
    let stats = state.service.unpause_rate_limiting();
    Ok(json!({
        "message": "Rate limiting unpaused",
        "stats": stats,
    }))
}
