//! WebSocket front end of the collaboration relay.
//!
//! ```text
//! socket ──► ClientEvent ──► RoomSession ──► room actor
//! socket ◄── ServerEvent ◄── outbox ◄────────┘
//! ```
//!
//! One task per socket. A socket is in at most one room at a time; a second
//! `JoinRoom` leaves the previous room first.

use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use folio_core::{DocumentKey, ProjectStore};

use crate::broadcast::Frame;
use crate::protocol::{ClientEvent, ProtocolError};
use crate::registry::{DocumentRegistry, RegistryConfig, RoomSession};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub registry: RegistryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            registry: RegistryConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub active_rooms: usize,
}

pub struct CollabServer {
    bind_addr: String,
    registry: DocumentRegistry,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Must be called from within a tokio runtime.
    pub fn new(config: ServerConfig, store: Arc<dyn ProjectStore>) -> Self {
        Self::with_registry(config.bind_addr, DocumentRegistry::new(store, config.registry))
    }

    pub fn with_registry(bind_addr: impl Into<String>, registry: DocumentRegistry) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count();
        stats
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        log::info!("Collaboration server listening on {}", self.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, stats.clone()).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.write().await.active_connections -= 1;
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: DocumentRegistry,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    let mut session: Option<RoomSession> = None;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        let result = match ClientEvent::decode(&data) {
                            Ok(event) => handle_event(event, &mut session, &registry).await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = result {
                            stats.write().await.malformed_messages += 1;
                            log::warn!("Dropping message from {addr}: {e}");
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        ws_sender.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                }
            }
            frame = next_frame(&mut session) => {
                match frame {
                    Some(frame) => {
                        ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                    }
                    None => {
                        // The room dropped us; the client has to reconnect and resync.
                        log::warn!("Connection {addr} dropped by its room, closing");
                        break;
                    }
                }
            }
        }
    }

    drop(session);
    let _ = ws_sender.close().await;
    log::info!("WebSocket connection closed: {addr}");
    Ok(())
}

async fn handle_event(
    event: ClientEvent,
    session: &mut Option<RoomSession>,
    registry: &DocumentRegistry,
) -> Result<(), ProtocolError> {
    match event {
        ClientEvent::JoinRoom { document_key, user } => {
            let key = DocumentKey::parse(&document_key)?;
            // Leave the previous room before joining the next one.
            session.take();
            *session = Some(registry.join(key, user).await?);
            Ok(())
        }
        ClientEvent::Sync(payload) => session.as_ref().ok_or(ProtocolError::NotJoined)?.sync(payload),
        ClientEvent::Update(payload) => session.as_ref().ok_or(ProtocolError::NotJoined)?.update(payload),
    }
}

async fn next_frame(session: &mut Option<RoomSession>) -> Option<Frame> {
    match session {
        Some(session) => session.recv().await,
        None => std::future::pending().await,
    }
}
