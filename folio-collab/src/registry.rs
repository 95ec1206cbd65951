//! Document registry: one room actor per document key.
//!
//! Rooms are created lazily on the first join and unregister themselves
//! after sitting empty for `room_idle_timeout`, leaving their replica behind
//! for the next room of the same key. Equal keys always reach the same live
//! actor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use folio_core::{DocumentKey, ProjectStore};

use crate::broadcast::Frame;
use crate::debounce::Debouncer;
use crate::protocol::{ConnectionId, ProtocolError, UserIdentity};
use crate::room::{lock_rooms, Room, RoomCommand, RoomEntry, RoomMap, RoomSnapshot, Rooms};

const JOIN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Frames buffered per connection before it is dropped as lagging.
    pub outbox_capacity: usize,
    /// How long an empty room lingers before eviction.
    pub room_idle_timeout: Duration,
    pub debounce_window: Duration,
    /// Bound on each store call a room makes while a client joins.
    pub store_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            room_idle_timeout: Duration::from_secs(600),
            debounce_window: Duration::from_secs(2),
            store_timeout: Duration::from_secs(10),
        }
    }
}

struct RegistryInner {
    config: RegistryConfig,
    store: Arc<dyn ProjectStore>,
    debouncer: Arc<Debouncer>,
    rooms: RoomMap,
    next_room_id: AtomicU64,
}

/// Cheap to clone; every clone shares the same rooms.
#[derive(Clone)]
pub struct DocumentRegistry {
    inner: Arc<RegistryInner>,
}

impl DocumentRegistry {
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn ProjectStore>, config: RegistryConfig) -> Self {
        let debouncer = Arc::new(Debouncer::new(store.clone(), config.debounce_window));
        Self {
            inner: Arc::new(RegistryInner {
                config,
                store,
                debouncer,
                rooms: Arc::new(Mutex::new(Rooms::default())),
                next_room_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn debouncer(&self) -> &Arc<Debouncer> {
        &self.inner.debouncer
    }

    /// Join `key` with a fresh connection id.
    pub async fn join(
        &self,
        key: DocumentKey,
        user: UserIdentity,
    ) -> Result<RoomSession, ProtocolError> {
        self.join_as(key, Uuid::new_v4(), user).await
    }

    /// Join `key` as `connection`. Resolves once the room has hydrated and
    /// queued the handshake frames on the session.
    pub async fn join_as(
        &self,
        key: DocumentKey,
        connection: ConnectionId,
        user: UserIdentity,
    ) -> Result<RoomSession, ProtocolError> {
        for _ in 0..JOIN_ATTEMPTS {
            let (room_id, commands) = self.room_for(&key);
            let (outbox, inbox) = mpsc::channel(self.inner.config.outbox_capacity);
            let (ack, acked) = oneshot::channel();

            let sent = commands.send(RoomCommand::Join {
                connection,
                user: user.clone(),
                outbox,
                ack,
            });
            if sent.is_ok() && acked.await.is_ok() {
                return Ok(RoomSession {
                    key,
                    connection,
                    commands,
                    inbox,
                });
            }

            // The actor shut down between lookup and join.
            log::debug!("Room {key} closed during join, retrying");
            self.forget(&key, room_id);
        }
        Err(ProtocolError::RoomClosed)
    }

    fn room_for(&self, key: &DocumentKey) -> (u64, mpsc::UnboundedSender<RoomCommand>) {
        let mut rooms = lock_rooms(&self.inner.rooms);
        if let Some(entry) = rooms.live.get(key) {
            if !entry.commands.is_closed() {
                return (entry.id, entry.commands.clone());
            }
        }

        let id = self.inner.next_room_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut room = Room::new(
            key.clone(),
            self.inner.store.clone(),
            self.inner.config.store_timeout,
            self.inner.debouncer.clone(),
        );
        if let Some(state) = rooms.dormant.remove(key) {
            room.restore(&state);
        }
        tokio::spawn(room.run(
            rx,
            self.inner.rooms.clone(),
            id,
            self.inner.config.room_idle_timeout,
        ));
        rooms.live.insert(
            key.clone(),
            RoomEntry {
                id,
                commands: tx.clone(),
            },
        );
        log::info!("Created room {key}");
        (id, tx)
    }

    fn forget(&self, key: &DocumentKey, room_id: u64) {
        let mut rooms = lock_rooms(&self.inner.rooms);
        if rooms.live.get(key).is_some_and(|entry| entry.id == room_id) {
            rooms.live.remove(key);
        }
    }

    /// Number of live rooms.
    pub fn room_count(&self) -> usize {
        lock_rooms(&self.inner.rooms).live.len()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        lock_rooms(&self.inner.rooms).live.contains_key(key)
    }

    /// Inspect a live room. `None` if no room exists for `key`.
    pub async fn snapshot(&self, key: &DocumentKey) -> Option<RoomSnapshot> {
        let commands = lock_rooms(&self.inner.rooms).live.get(key)?.commands.clone();
        let (reply, rx) = oneshot::channel();
        commands.send(RoomCommand::Snapshot { reply }).ok()?;
        rx.await.ok()
    }
}

/// One connection's membership in a room. Dropping it leaves the room.
pub struct RoomSession {
    key: DocumentKey,
    connection: ConnectionId,
    commands: mpsc::UnboundedSender<RoomCommand>,
    inbox: mpsc::Receiver<Frame>,
}

impl RoomSession {
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    /// Forward a y-sync payload to the room.
    pub fn sync(&self, payload: Vec<u8>) -> Result<(), ProtocolError> {
        self.commands
            .send(RoomCommand::Sync {
                connection: self.connection,
                payload,
            })
            .map_err(|_| ProtocolError::RoomClosed)
    }

    /// Forward a raw yrs update to the room.
    pub fn update(&self, payload: Vec<u8>) -> Result<(), ProtocolError> {
        self.commands
            .send(RoomCommand::Update {
                connection: self.connection,
                payload,
            })
            .map_err(|_| ProtocolError::RoomClosed)
    }

    /// Next encoded [`ServerEvent`](crate::protocol::ServerEvent) for this
    /// connection. `None` once the room has dropped the connection.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.inbox.try_recv().ok()
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        let _ = self.commands.send(RoomCommand::Leave {
            connection: self.connection,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{MemoryProjectStore, ResourceId};

    fn registry(idle: Duration) -> DocumentRegistry {
        let store = Arc::new(MemoryProjectStore::new("/tmp/folio").with_project("p1", "alice"));
        DocumentRegistry::new(
            store,
            RegistryConfig {
                room_idle_timeout: idle,
                ..RegistryConfig::default()
            },
        )
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::new(ResourceId::from("p1"), path)
    }

    #[tokio::test]
    async fn test_same_key_same_room() {
        let registry = registry(Duration::from_secs(60));
        let _a = registry.join(key("main.tex"), UserIdentity::new("alice", "Alice")).await.unwrap();
        let _b = registry.join(key("main.tex"), UserIdentity::new("bob", "Bob")).await.unwrap();
        let _c = registry.join(key("other.tex"), UserIdentity::new("bob", "Bob")).await.unwrap();

        assert_eq!(registry.room_count(), 2);
        let snapshot = registry.snapshot(&key("main.tex")).await.unwrap();
        assert_eq!(snapshot.connections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_room_is_evicted() {
        let registry = registry(Duration::from_secs(60));
        let session = registry.join(key("main.tex"), UserIdentity::new("alice", "Alice")).await.unwrap();
        drop(session);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(registry.contains(&key("main.tex")));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!registry.contains(&key("main.tex")));
        assert!(registry.snapshot(&key("main.tex")).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_after_eviction_creates_fresh_room() {
        let registry = registry(Duration::from_secs(1));
        drop(registry.join(key("main.tex"), UserIdentity::new("alice", "Alice")).await.unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(registry.room_count(), 0);

        let _session = registry.join(key("main.tex"), UserIdentity::new("alice", "Alice")).await.unwrap();
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_room_leaves_replica_for_successor() {
        let registry = registry(Duration::from_secs(1));
        drop(registry.join(key("main.tex"), UserIdentity::new("alice", "Alice")).await.unwrap());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(lock_rooms(&registry.inner.rooms).dormant.contains_key(&key("main.tex")));

        let _session = registry.join(key("main.tex"), UserIdentity::new("alice", "Alice")).await.unwrap();
        assert!(lock_rooms(&registry.inner.rooms).dormant.is_empty());
    }
}
