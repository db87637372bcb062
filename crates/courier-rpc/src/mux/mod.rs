//! Duplex multiplexing of request/response traffic and pushed events over
//! one connection.
//!
//! A connection is served by two tasks: the read loop, which dispatches
//! requests one at a time and writes their responses, and the forwarder,
//! which writes hub events as notifications. Both write through the
//! connection's single write lock, so frames never interleave.

mod connection;
mod framed;
mod websocket;

pub use connection::{serve_connection, Connection, ConnectionState};
pub use framed::{FramedSink, FramedSource};
pub use websocket::{split_websocket, WsSink, WsSource};

use async_trait::async_trait;
use courier_core::Result;
use serde_json::Value;

/// Receiving half of a frame transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next complete frame, or `None` once the peer has closed.
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Sending half of a frame transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: String) -> Result<()>;

    /// Best-effort close once the connection is done.
    async fn close(&mut self) {}
}

/// Executes JSON-RPC methods for a connection.
#[async_trait]
pub trait RpcDispatch: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value>;

    /// Payload of the `event.status` notification sent when a connection opens.
    fn status_snapshot(&self) -> Value;
}
