//! WebSocket frames: one text message carries one JSON-RPC payload.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use courier_core::{CourierError, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use super::{FrameSink, FrameSource};

pub struct WsSource {
    stream: SplitStream<WebSocket>,
}

pub struct WsSink {
    sink: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into its frame halves.
pub fn split_websocket(socket: WebSocket) -> (WsSource, WsSink) {
    let (sink, stream) = socket.split();
    (WsSource { stream }, WsSink { sink })
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.into_bytes())),
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                // Pings are answered by the socket itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Err(e)) => return Err(CourierError::transport(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: String) -> Result<()> {
        self.sink
            .send(Message::Text(frame))
            .await
            .map_err(|e| CourierError::transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}
