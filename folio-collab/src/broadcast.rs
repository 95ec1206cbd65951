//! Per-room fan-out to connected sockets.
//!
//! Every connection owns a bounded outbox. Frames are encoded once and
//! shared as `Arc<Vec<u8>>` across recipients. A connection whose outbox
//! is full (or whose session has gone away) is evicted from the group
//! instead of silently missing CRDT updates; the room then tears down its
//! presence like a normal disconnect and the client resyncs on reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::{ConnectionId, ProtocolError, ServerEvent};

pub type Frame = Arc<Vec<u8>>;
pub type Outbox = mpsc::Sender<Frame>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Fan-out group for a single room. Owned by the room actor, so no locking.
pub struct BroadcastGroup {
    peers: HashMap<ConnectionId, Outbox>,
    evicted: Vec<ConnectionId>,
    messages_sent: u64,
    messages_dropped: u64,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            evicted: Vec::new(),
            messages_sent: 0,
            messages_dropped: 0,
        }
    }

    pub fn add_peer(&mut self, connection: ConnectionId, outbox: Outbox) {
        self.peers.insert(connection, outbox);
    }

    pub fn remove_peer(&mut self, connection: &ConnectionId) -> bool {
        self.peers.remove(connection).is_some()
    }

    /// Send one event to a single connection.
    pub fn send_to(&mut self, connection: ConnectionId, event: &ServerEvent) -> Result<(), ProtocolError> {
        let frame = Arc::new(event.encode()?);
        self.deliver(connection, frame);
        Ok(())
    }

    /// Send one event to every connection except `sender`.
    ///
    /// Returns the number of connections the frame was queued for.
    pub fn broadcast_except(
        &mut self,
        sender: Option<ConnectionId>,
        event: &ServerEvent,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(event.encode()?);
        let targets: Vec<ConnectionId> = self
            .peers
            .keys()
            .filter(|id| Some(**id) != sender)
            .copied()
            .collect();

        let mut delivered = 0;
        for connection in targets {
            if self.deliver(connection, frame.clone()) {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    fn deliver(&mut self, connection: ConnectionId, frame: Frame) -> bool {
        let Some(outbox) = self.peers.get(&connection) else {
            return false;
        };
        match outbox.try_send(frame) {
            Ok(()) => {
                self.messages_sent += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::warn!("Connection {connection} lagging, evicting from room");
                self.evict(connection);
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Connection {connection} outbox closed");
                self.evict(connection);
                false
            }
        }
    }

    fn evict(&mut self, connection: ConnectionId) {
        self.messages_dropped += 1;
        if self.peers.remove(&connection).is_some() {
            self.evicted.push(connection);
        }
    }

    /// Connections dropped since the last call.
    pub fn take_evicted(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.evicted)
    }

    pub fn has_peer(&self, connection: &ConnectionId) -> bool {
        self.peers.contains_key(connection)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            messages_dropped: self.messages_dropped,
            active_peers: self.peers.len(),
        }
    }
}

impl Default for BroadcastGroup {
    fn default() -> Self {
        Self::new()
    }
}
