//! Shared helpers: a real server on an ephemeral port plus raw clients.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use timetable_collab::{PresenceEvent, PresenceMessage, ServerConfig, SyncMessage, SyncServer};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to wait before concluding that nothing is coming.
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// Start a server on a free port.
pub async fn start_test_server(config: ServerConfig) -> (Arc<SyncServer>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(SyncServer::new(config));
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, addr)
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        broadcast_capacity: 64,
        ..ServerConfig::default()
    }
}

pub async fn connect_sync(addr: SocketAddr, document: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/sync/{document}"))
        .await
        .unwrap();
    ws
}

pub async fn connect_presence(addr: SocketAddr) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/presence"))
        .await
        .unwrap();
    ws
}

pub async fn send_sync(ws: &mut Client, msg: SyncMessage) {
    ws.send(Message::binary(msg.encode().unwrap())).await.unwrap();
}

pub async fn send_presence(ws: &mut Client, msg: &PresenceMessage) {
    ws.send(Message::text(msg.encode().unwrap())).await.unwrap();
}

/// Next data frame, skipping transport pings. `None` on timeout.
async fn next_data(ws: &mut Client, wait: Duration) -> Option<Message> {
    loop {
        let frame = timeout(wait, ws.next()).await.ok()??.unwrap();
        match frame {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return Some(other),
        }
    }
}

pub async fn recv_sync(ws: &mut Client) -> SyncMessage {
    match next_data(ws, RECV_TIMEOUT).await {
        Some(Message::Binary(data)) => SyncMessage::decode(&data).unwrap(),
        other => panic!("Expected binary sync frame, got {other:?}"),
    }
}

pub async fn recv_presence(ws: &mut Client) -> PresenceEvent {
    match next_data(ws, RECV_TIMEOUT).await {
        Some(Message::Text(text)) => PresenceEvent::decode(text.as_str()).unwrap(),
        other => panic!("Expected presence text frame, got {other:?}"),
    }
}

/// Assert the client receives no data frame for a while.
pub async fn assert_quiet(ws: &mut Client) {
    if let Some(frame) = next_data(ws, QUIET_PERIOD).await {
        panic!("Expected no message, got {frame:?}");
    }
}

/// Poll until `check` holds or the receive timeout elapses.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Condition not reached within {RECV_TIMEOUT:?}");
}
