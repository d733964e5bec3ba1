//! WebSocket sync server with document-routed sessions.
//!
//! Architecture:
//! ```text
//! /sync/{doc} ──┐                                        ┌──► conn A
//!               ├─► ConnectionManager ─► Session(doc) ───┼──► conn B
//! /presence  ───┘    admit / release     Yrs doc         └──► conn C
//!                                        AwarenessStore
//!                                        broadcast fan-out
//! ```
//!
//! One task per connection owns its socket and loops over three sources:
//! inbound frames, the session's fan-out receiver, and the heartbeat timer.
//! Whatever ends the loop (close frame, transport error, failed send,
//! server shutdown), the connection is released exactly once afterwards.
//! A peer that sends nothing at all, not even a pong, between two heartbeat
//! pings is treated as gone and released the same way.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::lifecycle::{ConnectionHandle, ConnectionManager};
use crate::protocol::{Outbound, PresenceEvent, PresenceMessage, ProtocolError, SyncMessage};
use crate::registry::SessionRegistry;
use crate::session::SessionEvent;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Which channel a connection asked for in its request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/sync/{document}`: binary CRDT sync, admitted on connect.
    Sync(String),
    /// `/presence`: JSON presence, admitted on `join`.
    Presence,
}

/// Parse a request path into a route.
pub fn parse_route(path: &str) -> Option<Route> {
    if path == "/presence" || path == "/presence/" {
        return Some(Route::Presence);
    }
    let document = path.strip_prefix("/sync/")?.trim_end_matches('/');
    if document.is_empty() {
        return None;
    }
    Some(Route::Sync(document.to_string()))
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Inbound messages dropped as undecodable or out of state.
    pub dropped_messages: u64,
    /// Fan-out events lost by lagging connections.
    pub lagged_events: u64,
    /// Connections dropped for not answering heartbeats.
    pub timed_out: u64,
    pub active_sessions: usize,
}

/// Lock-free counters behind [`ServerStats`].
#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    dropped_messages: AtomicU64,
    lagged_events: AtomicU64,
    timed_out: AtomicU64,
}

impl AtomicServerStats {
    fn record_inbound(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_dropped(&self) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared by the accept loop and every connection task.
struct ServerContext {
    config: ServerConfig,
    manager: ConnectionManager,
    stats: AtomicServerStats,
    shutdown: watch::Sender<bool>,
}

/// The sync server.
pub struct SyncServer {
    ctx: Arc<ServerContext>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.idle_timeout,
            config.broadcast_capacity,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            ctx: Arc::new(ServerContext {
                config,
                manager: ConnectionManager::new(registry),
                stats: AtomicServerStats::default(),
                shutdown,
            }),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.ctx.config.bind_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown = self.ctx.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, ctx).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }

        log::info!("Sync server stopped accepting connections");
        Ok(())
    }

    /// Stop accepting and close every open connection.
    pub fn shutdown(&self) {
        self.ctx.shutdown.send_replace(true);
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let s = &self.ctx.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            dropped_messages: s.dropped_messages.load(Ordering::Relaxed),
            lagged_events: s.lagged_events.load(Ordering::Relaxed),
            timed_out: s.timed_out.load(Ordering::Relaxed),
            active_sessions: self.registry().session_count().await,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.ctx.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.ctx.manager.registry()
    }
}

/// Handle a single WebSocket connection from handshake to release.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<(), ServerError> {
    let mut route = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        match parse_route(req.uri().path()) {
            Some(r) => {
                route = Some(r);
                Ok(resp)
            }
            None => {
                let mut reject = ErrorResponse::new(Some("unknown route".to_string()));
                *reject.status_mut() = StatusCode::NOT_FOUND;
                Err(reject)
            }
        }
    })
    .await?;
    let Some(route) = route else {
        return Ok(());
    };

    log::info!("WebSocket connection established from {addr} ({route:?})");
    ctx.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    ctx.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let (sink, stream) = ws_stream.split();
    let mut task = ConnectionTask {
        ctx: ctx.clone(),
        addr,
        route,
        sink,
        conn: None,
    };
    let result = task.drive(stream).await;

    if let Some(handle) = task.conn.take() {
        ctx.manager.release(handle).await;
    }
    ctx.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    result
}

struct ConnectionTask {
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
    route: Route,
    sink: WsSink,
    conn: Option<ConnectionHandle>,
}

impl ConnectionTask {
    async fn drive(&mut self, mut stream: WsStream) -> Result<(), ServerError> {
        if let Route::Sync(document) = &self.route {
            let admission = self.ctx.manager.admit(document).await;
            self.conn = Some(admission.handle);
            self.send_all(admission.onboarding).await?;
        }

        let period = self.ctx.config.heartbeat_period();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        // A peer that sends nothing between two pings is considered gone.
        let mut last_seen = Instant::now();
        let mut last_ping: Option<Instant> = None;
        let mut shutdown = self.ctx.shutdown.subscribe();
        if *shutdown.borrow() {
            let _ = self.sink.send(Message::Close(None)).await;
            return Ok(());
        }

        loop {
            tokio::select! {
                inbound = stream.next() => {
                    if matches!(inbound, Some(Ok(_))) {
                        last_seen = Instant::now();
                    }
                    match inbound {
                        Some(Ok(Message::Binary(data))) => {
                            self.ctx.stats.record_inbound(data.len());
                            let replies = self.handle_binary(&data).await;
                            self.send_all(replies).await?;
                        }
                        Some(Ok(Message::Text(text))) => {
                            self.ctx.stats.record_inbound(text.len());
                            let replies = self.handle_text(text.as_str()).await;
                            self.send_all(replies).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            self.sink.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {}", self.addr);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {}: {e}", self.addr);
                            break;
                        }
                    }
                }

                event = next_event(&mut self.conn) => {
                    let Some(handle) = self.conn.as_ref() else {
                        continue;
                    };
                    let frames = match event {
                        Ok(event) => self.ctx.manager.engine().render(&event, handle.id(), handle.channel()),
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("{} lagged by {n} events, resyncing", handle.id());
                            self.ctx.stats.lagged_events.fetch_add(n, Ordering::Relaxed);
                            let state = handle.session().lock().await;
                            self.ctx.manager.engine().resync(&state, handle.channel())
                        }
                        Err(RecvError::Closed) => break,
                    };
                    self.send_all(frames).await?;
                }

                _ = heartbeat.tick() => {
                    if last_ping.is_some_and(|sent| last_seen < sent) {
                        log::warn!("{} missed a heartbeat, dropping connection", self.addr);
                        self.ctx.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    self.sink.send(Message::Ping(Vec::new().into())).await?;
                    last_ping = Some(Instant::now());
                }

                _ = shutdown.changed() => {
                    let _ = self.sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        Ok(())
    }

    /// CRDT channel frame.
    async fn handle_binary(&mut self, data: &[u8]) -> Vec<Outbound> {
        match self.try_handle_binary(data).await {
            Ok(replies) => replies,
            Err(e) => {
                self.ctx.stats.record_dropped();
                log::warn!("Dropped binary message from {}: {e}", self.addr);
                Vec::new()
            }
        }
    }

    async fn try_handle_binary(&mut self, data: &[u8]) -> Result<Vec<Outbound>, ProtocolError> {
        self.check_size(data.len())?;
        let handle = match (&self.route, self.conn.as_ref()) {
            (Route::Sync(_), Some(handle)) => handle,
            (Route::Sync(_), None) => return Err(ProtocolError::NotJoined),
            (Route::Presence, _) => return Err(ProtocolError::WrongChannel("binary sync")),
        };
        let msg = SyncMessage::decode(data)?;
        log::trace!("{:?} from {}", msg.kind(), handle.id());
        self.ctx
            .manager
            .engine()
            .handle_sync_message(handle.session(), handle.id(), msg)
            .await
    }

    /// Presence channel frame; a `join` admits the connection.
    async fn handle_text(&mut self, text: &str) -> Vec<Outbound> {
        match self.try_handle_text(text).await {
            Ok(replies) => replies,
            Err(e) => {
                self.ctx.stats.record_dropped();
                log::warn!("Dropped text message from {}: {e}", self.addr);
                Vec::new()
            }
        }
    }

    async fn try_handle_text(&mut self, text: &str) -> Result<Vec<Outbound>, ProtocolError> {
        self.check_size(text.len())?;
        if self.route != Route::Presence {
            return Err(ProtocolError::WrongChannel("JSON presence"));
        }
        let msg = PresenceMessage::decode(text)?;
        if self.conn.is_none() {
            return self.join(msg).await;
        }

        let Some(handle) = self.conn.as_ref() else {
            return Err(ProtocolError::NotJoined);
        };
        let client_id = handle.client_id().ok_or(ProtocolError::NotJoined)?;
        self.ctx
            .manager
            .engine()
            .handle_presence(handle.session(), handle.id(), client_id, msg)
            .await
    }

    /// Messages before `join`: only `join` and `ping` are accepted.
    async fn join(&mut self, msg: PresenceMessage) -> Result<Vec<Outbound>, ProtocolError> {
        match msg {
            PresenceMessage::Join {
                schedule_id,
                client_id,
                user,
            } => {
                if schedule_id.is_empty() {
                    return Err(ProtocolError::Deserialization("empty scheduleId".into()));
                }
                log::debug!(
                    "{} joining {schedule_id} (client-supplied id {client_id:?})",
                    self.addr
                );
                let admission = self.ctx.manager.admit_presence(&schedule_id, user).await;
                self.conn = Some(admission.handle);
                Ok(admission.onboarding)
            }
            PresenceMessage::Ping => Ok(vec![Outbound::Presence(PresenceEvent::Pong)]),
            _ => Err(ProtocolError::NotJoined),
        }
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        let limit = self.ctx.config.max_message_bytes;
        if size > limit {
            return Err(ProtocolError::TooLarge { size, limit });
        }
        Ok(())
    }

    async fn send_all(&mut self, frames: Vec<Outbound>) -> Result<(), ServerError> {
        if frames.is_empty() {
            return Ok(());
        }
        for frame in frames {
            self.sink.feed(to_message(frame)?).await?;
        }
        self.sink.flush().await?;
        Ok(())
    }
}

async fn next_event(conn: &mut Option<ConnectionHandle>) -> Result<Arc<SessionEvent>, RecvError> {
    match conn {
        Some(handle) => handle.events().recv().await,
        // Not joined yet: nothing to fan out
        None => std::future::pending().await,
    }
}

fn to_message(frame: Outbound) -> Result<Message, ProtocolError> {
    Ok(match frame {
        Outbound::Sync(msg) => Message::Binary(msg.encode()?.into()),
        Outbound::Presence(event) => Message::Text(event.encode()?.into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route() {
        assert_eq!(
            parse_route("/sync/schedule-cs-100-fall"),
            Some(Route::Sync("schedule-cs-100-fall".into()))
        );
        assert_eq!(parse_route("/sync/doc/"), Some(Route::Sync("doc".into())));
        assert_eq!(parse_route("/presence"), Some(Route::Presence));
        assert_eq!(parse_route("/presence/"), Some(Route::Presence));
        assert_eq!(parse_route("/sync/"), None);
        assert_eq!(parse_route("/"), None);
        assert_eq!(parse_route("/courses"), None);
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.dropped_messages, 0);
        assert_eq!(stats.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_serve_after_shutdown_returns() {
        let server = SyncServer::with_defaults();
        server.shutdown();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        server.serve(listener).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            bind_addr: taken.local_addr().unwrap().to_string(),
            ..ServerConfig::default()
        };
        let result = SyncServer::new(config).run().await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[test]
    fn test_to_message_kinds() {
        let binary = to_message(Outbound::Sync(SyncMessage::Ping)).unwrap();
        assert!(matches!(binary, Message::Binary(_)));
        let text = to_message(Outbound::Presence(PresenceEvent::Pong)).unwrap();
        assert!(matches!(text, Message::Text(_)));
    }
}
