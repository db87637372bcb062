//! Per-connection read loop, event forwarder and write serialization.

use courier_core::{
    CancellationToken, CourierError, Event, EventHub, EventKind, EventSubscription, Result,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::{FrameSink, FrameSource, RpcDispatch};
use crate::protocol::{parse_frame, Incoming, JsonRpcNotification, JsonRpcResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One duplex link: its state, its write lock and its done signal.
#[derive(Debug)]
pub struct Connection<W> {
    id: u64,
    state: Mutex<ConnectionState>,
    writer: tokio::sync::Mutex<W>,
    done: CancellationToken,
}

impl<W: FrameSink> Connection<W> {
    pub fn new(id: u64, sink: W) -> Self {
        Self {
            id,
            state: Mutex::new(ConnectionState::Connecting),
            writer: tokio::sync::Mutex::new(sink),
            done: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Cancelled when the connection starts closing.
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    pub async fn send_response(&self, response: &JsonRpcResponse) -> Result<()> {
        self.write(response).await
    }

    pub async fn send_notification(&self, notification: &JsonRpcNotification) -> Result<()> {
        self.write(notification).await
    }

    /// Encode outside the lock, write the whole frame under it.
    async fn write<T: Serialize>(&self, message: &T) -> Result<()> {
        let frame = serde_json::to_string(message)?;
        self.writer.lock().await.send_frame(frame).await
    }
}

/// Serve one connection until the peer leaves, a frame cannot be decoded,
/// or `shutdown` is cancelled.
pub async fn serve_connection<R, W, D>(
    id: u64,
    mut source: R,
    sink: W,
    dispatch: Arc<D>,
    hub: Arc<EventHub>,
    shutdown: CancellationToken,
) where
    R: FrameSource,
    W: FrameSink + 'static,
    D: RpcDispatch + ?Sized,
{
    let conn = Arc::new(Connection::new(id, sink));
    let subscription = hub.subscribe();
    conn.set_state(ConnectionState::Open);
    debug!("Connection {} open", id);

    let status = Event::new(EventKind::Status, dispatch.status_snapshot());
    let forwarder = match conn.send_notification(&JsonRpcNotification::from(status)).await {
        Ok(()) => Some(tokio::spawn(forward_events(Arc::clone(&conn), subscription))),
        Err(e) => {
            debug!("Connection {}: initial status failed: {}", id, e);
            None
        }
    };

    if forwarder.is_some() {
        read_loop(&conn, &mut source, dispatch.as_ref(), &shutdown).await;
    }

    conn.set_state(ConnectionState::Closing);
    conn.done.cancel();
    if let Some(forwarder) = forwarder {
        if let Err(e) = forwarder.await {
            warn!("Connection {}: forwarder task failed: {}", id, e);
        }
    }
    conn.writer.lock().await.close().await;
    conn.set_state(ConnectionState::Closed);
    info!("Connection {} closed", id);
}

async fn read_loop<R, W, D>(
    conn: &Connection<W>,
    source: &mut R,
    dispatch: &D,
    shutdown: &CancellationToken,
) where
    R: FrameSource,
    W: FrameSink,
    D: RpcDispatch + ?Sized,
{
    loop {
        let frame = tokio::select! {
            result = source.next_frame() => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Connection {}: peer closed", conn.id);
                    return;
                }
                Err(e) => {
                    debug!("Connection {}: frame decode failed: {}", conn.id, e);
                    return;
                }
            },
            _ = shutdown.cancelled() => {
                debug!("Connection {}: server shutting down", conn.id);
                return;
            }
        };

        let request = match parse_frame(&frame) {
            Ok(Incoming::Request(request)) => request,
            Ok(Incoming::Invalid { id, reason }) => {
                let err = CourierError::InvalidRequest(reason);
                if conn.send_response(&JsonRpcResponse::from_error(id, &err)).await.is_err() {
                    return;
                }
                continue;
            }
            Err(e) => {
                warn!("Connection {}: {}", conn.id, e);
                let _ = conn.send_response(&JsonRpcResponse::from_error(None, &e)).await;
                return;
            }
        };

        let params = request
            .params
            .unwrap_or_else(|| Value::Object(Map::new()));
        debug!("RPC call: {}", request.method);
        let result = dispatch.dispatch(&request.method, params).await;

        let Some(id) = request.id else {
            if let Err(e) = result {
                debug!("One-way {} failed: {}", request.method, e);
            }
            continue;
        };

        let response = match result {
            Ok(value) => JsonRpcResponse::success(Some(id), value),
            Err(e) => {
                warn!("RPC error for {}: {}", request.method, e);
                JsonRpcResponse::from_error(Some(id), &e)
            }
        };
        if let Err(e) = conn.send_response(&response).await {
            debug!("Connection {}: response write failed: {}", conn.id, e);
            return;
        }
    }
}

async fn forward_events<W: FrameSink>(conn: Arc<Connection<W>>, mut subscription: EventSubscription) {
    loop {
        let event = tokio::select! {
            _ = conn.done.cancelled() => break,
            event = subscription.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let kind = event.kind;
        if let Err(e) = conn.send_notification(&JsonRpcNotification::from(event)).await {
            debug!("Connection {}: failed to forward {} event: {}", conn.id, kind, e);
            break;
        }
    }
    debug!("Connection {}: forwarder stopped", conn.id);
}
