//! JSON-RPC 2.0 wire types and length-prefixed framing.
//!
//! Both transports carry the same UTF-8 JSON payloads. On the TCP listener
//! each payload is framed with a 4-byte big-endian length prefix:
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use courier_core::config::ServerConfig;
use courier_core::{CourierError, Event, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request structure.
///
/// `jsonrpc` may be omitted; when present it must be `"2.0"`. A request
/// without an `id` (or with a null one) is one-way and gets no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: Option<Value>) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            method: method.into(),
            params: Some(params),
            id,
        }
    }
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Error response carrying the code and message of `err`.
    pub fn from_error(id: Option<Value>, err: &CourierError) -> Self {
        Self::error(id, err.to_rpc_error_code(), err.to_string())
    }
}

/// Server-initiated message without an id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    pub params: Value,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

impl From<Event> for JsonRpcNotification {
    fn from(event: Event) -> Self {
        Self::new(event.notification_method(), event.data)
    }
}

/// A decoded frame.
#[derive(Debug, Clone)]
pub enum Incoming {
    Request(JsonRpcRequest),
    /// Valid JSON that is not a request. `id` is whatever could be recovered.
    Invalid { id: Option<Value>, reason: String },
}

/// Decode one frame.
///
/// Fails only when the payload is not JSON at all.
pub fn parse_frame(frame: &[u8]) -> Result<Incoming> {
    let value: Value =
        serde_json::from_slice(frame).map_err(|e| CourierError::ParseError(e.to_string()))?;

    if !value.is_object() {
        return Ok(Incoming::Invalid {
            id: None,
            reason: "request must be a JSON object".to_string(),
        });
    }
    let id = value.get("id").filter(|id| !id.is_null()).cloned();

    let request: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(request) => request,
        Err(e) => {
            return Ok(Incoming::Invalid {
                id,
                reason: e.to_string(),
            })
        }
    };

    if let Some(version) = &request.jsonrpc {
        if version != JSONRPC_VERSION {
            return Ok(Incoming::Invalid {
                id,
                reason: "expected jsonrpc 2.0".to_string(),
            });
        }
    }

    Ok(Incoming::Request(request))
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > ServerConfig::MAX_FRAME_SIZE {
        return Err(CourierError::transport(format!(
            "frame size {} exceeds maximum {}",
            len,
            ServerConfig::MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= ServerConfig::MAX_FRAME_SIZE)
        .ok_or_else(|| {
            CourierError::transport(format!("frame of {} bytes is too large", payload.len()))
        })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
