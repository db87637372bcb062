//! Listeners: an Axum WebSocket endpoint and a length-prefixed TCP endpoint.
//!
//! Both feed accepted links into [`serve_connection`], so request handling,
//! event forwarding and shutdown behave the same on either transport.

use crate::handlers::dispatch_method;
use crate::mux::{serve_connection, split_websocket, FramedSink, FramedSource, RpcDispatch};
use async_trait::async_trait;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use courier_core::config::ServerConfig;
use courier_core::{CancellationToken, EventHub, MessagingService, Result};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Application state shared by every connection.
pub struct AppState {
    pub service: Arc<MessagingService>,
    /// Cancelled once when the process begins shutting down.
    pub shutdown: CancellationToken,
    next_connection_id: AtomicU64,
}

impl AppState {
    pub fn new(service: Arc<MessagingService>) -> Arc<Self> {
        Arc::new(Self {
            service,
            shutdown: CancellationToken::new(),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn hub(&self) -> Arc<EventHub> {
        Arc::clone(self.service.hub())
    }
}

#[async_trait]
impl RpcDispatch for AppState {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        dispatch_method(self, method, &params).await
    }

    fn status_snapshot(&self) -> Value {
        serde_json::to_value(self.service.status()).unwrap_or_else(|_| json!({}))
    }
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "type": "websocket-rpc" }))
}

async fn handle_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(ServerConfig::MAX_FRAME_SIZE)
        .on_upgrade(move |socket| async move {
            let (source, sink) = split_websocket(socket);
            let id = state.next_connection_id();
            let hub = state.hub();
            let shutdown = state.shutdown.clone();
            serve_connection(id, source, sink, state, hub, shutdown).await;
        })
}

/// Start the WebSocket JSON-RPC server.
///
/// Returns the actual address the server is bound to (useful when port=0).
/// The server stops accepting once `state.shutdown` is cancelled.
pub async fn start_server(state: Arc<AppState>, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let shutdown = state.shutdown.clone();
    let app = Router::new()
        .route(ServerConfig::HEALTH_PATH, get(handle_health))
        .route(ServerConfig::WS_RPC_PATH, get(handle_ws))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("WebSocket RPC listening on ws://{}{}", actual_addr, ServerConfig::WS_RPC_PATH);

    tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            error!("WebSocket server error: {}", e);
        }
    });

    Ok(actual_addr)
}

/// Handle to a running framed server. Dropping shuts it down.
pub struct FramedServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown: CancellationToken,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl FramedServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and close every open framed connection.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.conn_shutdown.cancel();
    }
}

impl Drop for FramedServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// JSON-RPC over TCP with a 4-byte big-endian length prefix per message.
pub struct FramedServer;

impl FramedServer {
    pub async fn start(state: Arc<AppState>, host: &str, port: u16) -> Result<FramedServerHandle> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;

        info!("Framed RPC listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let conn_shutdown = CancellationToken::new();
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            state,
            shutdown_rx,
            conn_shutdown.clone(),
            active_connections,
        ));

        Ok(FramedServerHandle {
            addr,
            port: addr.port(),
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        state: Arc<AppState>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown: CancellationToken,
        active_connections: Arc<AtomicUsize>,
    ) {
        let app_shutdown = state.shutdown.clone();
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = app_shutdown.cancelled() => break,
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= ServerConfig::MAX_FRAMED_CONNECTIONS {
                                warn!(
                                    "Rejecting framed connection from {}: at max capacity ({})",
                                    peer_addr,
                                    ServerConfig::MAX_FRAMED_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let state = Arc::clone(&state);
                            let conns = Arc::clone(&active_connections);
                            let shutdown = conn_shutdown.clone();

                            tokio::spawn(async move {
                                debug!("Framed connection from {}", peer_addr);
                                let (reader, writer) = stream.into_split();
                                let id = state.next_connection_id();
                                let hub = state.hub();
                                serve_connection(
                                    id,
                                    FramedSource::new(reader),
                                    FramedSink::new(writer),
                                    state,
                                    hub,
                                    shutdown,
                                )
                                .await;
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Framed accept error: {}", e);
                        }
                    }
                }
            }
        }
        info!("Framed RPC server shutting down");
        conn_shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::test_state;
    use crate::protocol::{read_frame, write_frame};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn next_json(stream: &mut TcpStream) -> Option<Value> {
        let frame = tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
            .await
            .unwrap()
            .unwrap()?;
        Some(serde_json::from_slice(&frame).unwrap())
    }

    async fn send_json(stream: &mut TcpStream, value: Value) {
        write_frame(stream, &serde_json::to_vec(&value).unwrap())
            .await
            .unwrap();
    }

    /// Read frames until a response with the given id shows up.
    async fn response_for(stream: &mut TcpStream, id: i64) -> Value {
        loop {
            let frame = next_json(stream).await.unwrap();
            if frame["id"] == id {
                return frame;
            }
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = test_state().await;
        let addr = start_server(Arc::clone(&state), "127.0.0.1", 0).await.unwrap();
        assert!(addr.port() > 0);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains("websocket-rpc"));

        state.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_framed_server_round_trip() {
        let state = test_state().await;
        let mut handle = FramedServer::start(Arc::clone(&state), "127.0.0.1", 0)
            .await
            .unwrap();
        assert_eq!(handle.addr().ip(), std::net::Ipv4Addr::LOCALHOST);

        let mut stream = TcpStream::connect(handle.addr).await.unwrap();
        let status = next_json(&mut stream).await.unwrap();
        assert_eq!(status["method"], "event.status");
        assert_eq!(status["params"]["connected"], true);

        send_json(
            &mut stream,
            json!({"jsonrpc": "2.0", "method": "health_check", "id": 1}),
        )
        .await;
        let response = response_for(&mut stream, 1).await;
        assert_eq!(response["result"]["status"], "ok");

        send_json(
            &mut stream,
            json!({"jsonrpc": "2.0", "method": "nope", "params": {}, "id": 2}),
        )
        .await;
        let response = response_for(&mut stream, 2).await;
        assert_eq!(response["error"]["code"], -32601);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_send_emits_notification() {
        let state = test_state().await;
        let handle = FramedServer::start(Arc::clone(&state), "127.0.0.1", 0)
            .await
            .unwrap();

        let mut stream = TcpStream::connect(handle.addr).await.unwrap();
        let _status = next_json(&mut stream).await.unwrap();

        send_json(
            &mut stream,
            json!({
                "jsonrpc": "2.0",
                "method": "send",
                "params": {"phone": "15550001", "message": "hello"},
                "id": 7
            }),
        )
        .await;

        let mut saw_response = false;
        let mut saw_event = false;
        while !(saw_response && saw_event) {
            let frame = next_json(&mut stream).await.unwrap();
            if frame["id"] == 7 {
                assert_eq!(frame["result"]["message"], "Sent");
                saw_response = true;
            } else if frame["method"] == "event.message_sent" {
                assert_eq!(frame["params"]["type"], "text");
                saw_event = true;
            }
        }
    }

    #[tokio::test]
    async fn test_app_shutdown_closes_framed_connections() {
        let state = test_state().await;
        let handle = FramedServer::start(Arc::clone(&state), "127.0.0.1", 0)
            .await
            .unwrap();
        let mut stream = TcpStream::connect(handle.addr).await.unwrap();
        let _status = next_json(&mut stream).await.unwrap();

        state.shutdown.cancel();
        let eof = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match read_frame(&mut stream).await {
                    Ok(None) | Err(_) => return,
                    Ok(Some(_)) => continue,
                }
            }
        })
        .await;
        assert!(eof.is_ok());
    }
}
