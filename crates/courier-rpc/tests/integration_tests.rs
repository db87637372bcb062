//! Integration tests for the courier-rpc binary.
//!
//! The binary is started on OS-assigned ports; the tests talk to it over the
//! length-prefixed TCP endpoint and over plain HTTP for the health route.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct RpcServerHandle {
    child: tokio::process::Child,
    rpc_port: u16,
    framed_port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
    _data_dir: TempDir,
}

impl RpcServerHandle {
    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

fn port_from(line: &str, prefix: &str) -> Option<u16> {
    line.strip_prefix(prefix)
        .and_then(|value| value.trim().parse().ok())
}

/// Start the binary and read both announced ports from stdout.
async fn start_rpc_server() -> Result<RpcServerHandle, String> {
    let data_dir = TempDir::new().map_err(|e| e.to_string())?;
    let binary = PathBuf::from(env!("CARGO_BIN_EXE_courier-rpc"));

    let mut child = tokio::process::Command::new(&binary)
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .arg("--framed-port")
        .arg("0")
        .arg("--history-db")
        .arg(data_dir.path().join("history.db"))
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn courier-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut rpc_port = None;
    let mut framed_port = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while (rpc_port.is_none() || framed_port.is_none()) && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                rpc_port = rpc_port.or_else(|| port_from(&line, "RPC_PORT="));
                framed_port = framed_port.or_else(|| port_from(&line, "FRAMED_PORT="));
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read courier-rpc stdout: {err}")),
            Err(_) => continue,
        }
    }

    let rpc_port = rpc_port.ok_or("RPC_PORT line not emitted by courier-rpc")?;
    let framed_port = framed_port.ok_or("FRAMED_PORT line not emitted by courier-rpc")?;

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(RpcServerHandle {
        child,
        rpc_port,
        framed_port,
        stdout_drain: Some(stdout_drain),
        _data_dir: data_dir,
    })
}

async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_u32(payload.len() as u32).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.flush().await.unwrap();
}

/// Next frame as JSON, or `None` on a clean close.
async fn read_json(stream: &mut TcpStream) -> Option<Value> {
    let read = async {
        let len = match stream.read_u32().await {
            Ok(len) => len,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return None,
            Err(e) => panic!("read error: {e}"),
        };
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await.unwrap();
        Some(serde_json::from_slice(&buf).unwrap())
    };
    tokio::time::timeout(Duration::from_secs(10), read)
        .await
        .expect("timed out waiting for a frame")
}

async fn send_request(stream: &mut TcpStream, request: Value) {
    write_frame(stream, &serde_json::to_vec(&request).unwrap()).await;
}

/// Read until the response carrying `id`, collecting every other frame seen.
async fn response_for(stream: &mut TcpStream, id: i64) -> (Value, Vec<Value>) {
    let mut skipped = Vec::new();
    loop {
        let frame = read_json(stream).await.expect("connection closed early");
        if frame["id"] == id {
            return (frame, skipped);
        }
        skipped.push(frame);
    }
}

async fn connect(port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let status = read_json(&mut stream).await.unwrap();
    assert_eq!(status["jsonrpc"], "2.0");
    assert_eq!(status["method"], "event.status");
    assert!(status.get("id").is_none());
    stream
}

#[tokio::test]
async fn test_framed_rpc_session() {
    let server = start_rpc_server().await.unwrap();
    let mut stream = connect(server.framed_port).await;

    send_request(
        &mut stream,
        json!({"jsonrpc": "2.0", "method": "health_check", "id": 1}),
    )
    .await;
    let (response, _) = response_for(&mut stream, 1).await;
    assert_eq!(response["result"]["status"], "ok");

    send_request(
        &mut stream,
        json!({"jsonrpc": "2.0", "method": "rate_limit_set", "params": {"enabled": false}, "id": 2}),
    )
    .await;
    let (response, _) = response_for(&mut stream, 2).await;
    assert_eq!(response["result"]["config"]["enabled"], false);

    send_request(
        &mut stream,
        json!({
            "jsonrpc": "2.0",
            "method": "send",
            "params": {"phone": "+15550001", "message": "hello"},
            "id": 3
        }),
    )
    .await;
    let (response, mut skipped) = response_for(&mut stream, 3).await;
    assert_eq!(response["result"]["message"], "Sent");
    let message_id = response["result"]["message_id"].clone();

    let sent_event = loop {
        if let Some(pos) = skipped
            .iter()
            .position(|f| f["method"] == "event.message_sent")
        {
            break skipped.remove(pos);
        }
        skipped.push(read_json(&mut stream).await.unwrap());
    };
    assert_eq!(sent_event["params"]["message_id"], message_id);
    assert_eq!(sent_event["params"]["to"], "15550001");

    send_request(
        &mut stream,
        json!({"jsonrpc": "2.0", "method": "no_such_method", "id": 4}),
    )
    .await;
    let (response, _) = response_for(&mut stream, 4).await;
    assert_eq!(response["error"]["code"], -32601);

    server.stop().await;
}

#[tokio::test]
async fn test_one_way_request_gets_no_response() {
    let server = start_rpc_server().await.unwrap();
    let mut stream = connect(server.framed_port).await;

    send_request(
        &mut stream,
        json!({"jsonrpc": "2.0", "method": "health_check"}),
    )
    .await;
    send_request(
        &mut stream,
        json!({"jsonrpc": "2.0", "method": "health_check", "id": 10}),
    )
    .await;

    let (response, skipped) = response_for(&mut stream, 10).await;
    assert_eq!(response["result"]["status"], "ok");
    assert!(
        skipped.iter().all(|f| f.get("method").is_some()),
        "unexpected response frames: {skipped:?}"
    );

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_request_keeps_connection_open() {
    let server = start_rpc_server().await.unwrap();
    let mut stream = connect(server.framed_port).await;

    send_request(&mut stream, json!({"jsonrpc": "1.0", "method": "status", "id": 5})).await;
    let (response, _) = response_for(&mut stream, 5).await;
    assert_eq!(response["error"]["code"], -32600);

    send_request(&mut stream, json!({"jsonrpc": "2.0", "method": "status", "id": 6})).await;
    let (response, _) = response_for(&mut stream, 6).await;
    assert_eq!(response["result"]["running"], true);

    server.stop().await;
}

#[tokio::test]
async fn test_parse_error_closes_connection() {
    let server = start_rpc_server().await.unwrap();
    let mut stream = connect(server.framed_port).await;

    write_frame(&mut stream, b"{not json").await;

    let error = loop {
        let frame = read_json(&mut stream).await.expect("closed before error");
        if frame.get("error").is_some() {
            break frame;
        }
    };
    assert_eq!(error["error"]["code"], -32700);
    assert!(error["id"].is_null());

    loop {
        if read_json(&mut stream).await.is_none() {
            break;
        }
    }

    server.stop().await;
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_rpc_server().await.unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", server.rpc_port))
        .await
        .unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut body = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut body))
        .await
        .unwrap()
        .unwrap();
    assert!(body.starts_with("HTTP/1.1 200"));
    assert!(body.contains("websocket-rpc"));

    server.stop().await;
}
