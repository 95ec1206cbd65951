//! Room actor: the authoritative replica of one document key.
//!
//! ```text
//!  RoomSession A ──┐                     ┌──► outbox A
//!  RoomSession B ──┼─► RoomCommand ─► Room ─┼──► outbox B
//!  RoomSession C ──┘   (unbounded)     │ └──► outbox C
//!                                      │
//!                 yrs Doc + Awareness ─┤
//!                 PresenceTracker ─────┤
//!                 Debouncer ◄──────────┘ (text after each applied update)
//! ```
//!
//! Commands are handled one at a time, which gives the two sequencing
//! guarantees the relay depends on: hydration completes before the joiner
//! receives anything, and an update is applied to the replica before any
//! other connection sees it.
//!
//! An evicted room leaves its encoded replica behind in [`Rooms::dormant`].
//! The next room for the same key starts from that replica instead of the
//! stored text, so clients still holding the old history merge into it
//! rather than duplicating it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use yrs::block::ClientID;
use yrs::sync::awareness::AwarenessUpdate;
use yrs::sync::{Awareness, Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use folio_core::{DocumentKey, ProjectStore, StoreError, UserId};

use crate::broadcast::{BroadcastGroup, Outbox};
use crate::debounce::Debouncer;
use crate::presence::PresenceTracker;
use crate::protocol::{
    self, ConnectionId, PresenceEntry, ProtocolError, ServerEvent, UserIdentity,
};

/// Name of the shared text field in every room document.
pub const CONTENT_FIELD: &str = "content";

pub(crate) enum RoomCommand {
    Join {
        connection: ConnectionId,
        user: UserIdentity,
        outbox: Outbox,
        ack: oneshot::Sender<()>,
    },
    Sync {
        connection: ConnectionId,
        payload: Vec<u8>,
    },
    Update {
        connection: ConnectionId,
        payload: Vec<u8>,
    },
    Leave {
        connection: ConnectionId,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

/// Point-in-time view of a room, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub key: DocumentKey,
    pub content: String,
    pub connections: usize,
    pub users: Vec<PresenceEntry>,
    pub malformed_messages: u64,
}

pub(crate) struct RoomEntry {
    pub id: u64,
    pub commands: mpsc::UnboundedSender<RoomCommand>,
}

#[derive(Default)]
pub(crate) struct Rooms {
    pub live: HashMap<DocumentKey, RoomEntry>,
    /// Full-state updates of evicted rooms, taken by the next room for the key.
    pub dormant: HashMap<DocumentKey, Vec<u8>>,
}

pub(crate) type RoomMap = Arc<Mutex<Rooms>>;

pub(crate) fn lock_rooms(rooms: &RoomMap) -> MutexGuard<'_, Rooms> {
    rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct Room {
    key: DocumentKey,
    awareness: Awareness,
    presence: PresenceTracker,
    group: BroadcastGroup,
    /// Awareness client ids announced by each connection.
    awareness_clients: HashMap<ConnectionId, HashSet<ClientID>>,
    owner: Option<UserId>,
    /// Set once the owner lookup succeeded or the resource had none.
    owner_resolved: bool,
    hydrated: bool,
    malformed: u64,
    store: Arc<dyn ProjectStore>,
    store_timeout: Duration,
    debouncer: Arc<Debouncer>,
}

impl Room {
    pub(crate) fn new(
        key: DocumentKey,
        store: Arc<dyn ProjectStore>,
        store_timeout: Duration,
        debouncer: Arc<Debouncer>,
    ) -> Self {
        Self {
            key,
            awareness: Awareness::new(Doc::new()),
            presence: PresenceTracker::new(),
            group: BroadcastGroup::new(),
            awareness_clients: HashMap::new(),
            owner: None,
            owner_resolved: false,
            hydrated: false,
            malformed: 0,
            store,
            store_timeout,
            debouncer,
        }
    }

    /// Continue from the replica an evicted room left behind. The room
    /// counts as hydrated unless the state cannot be applied.
    pub(crate) fn restore(&mut self, state: &[u8]) {
        match self.apply(state) {
            Ok(()) => {
                self.hydrated = true;
                log::info!("Restored {} from its evicted replica", self.key);
            }
            Err(e) => log::warn!("Could not restore {}, hydrating from storage: {e}", self.key),
        }
    }

    /// Actor loop. Exits once the room has had no connections for
    /// `idle_timeout` and no command is waiting.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RoomCommand>,
        rooms: RoomMap,
        room_id: u64,
        idle_timeout: Duration,
    ) {
        loop {
            let command = if self.group.is_empty() {
                tokio::select! {
                    command = commands.recv() => command,
                    _ = tokio::time::sleep(idle_timeout) => {
                        if self.unregister_if_idle(&commands, &rooms, room_id) {
                            break;
                        }
                        continue;
                    }
                }
            } else {
                commands.recv().await
            };

            let Some(command) = command else { break };
            self.handle(command).await;
            self.reap_evicted();
        }

        // Joins that raced with eviction see their ack dropped and retry.
        commands.close();
        log::info!("Room {} evicted", self.key);
    }

    fn unregister_if_idle(
        &self,
        commands: &mpsc::UnboundedReceiver<RoomCommand>,
        rooms: &RoomMap,
        room_id: u64,
    ) -> bool {
        let mut rooms = lock_rooms(rooms);
        if !commands.is_empty() {
            return false;
        }
        if rooms.live.get(&self.key).is_some_and(|entry| entry.id == room_id) {
            rooms.live.remove(&self.key);
            // A room that never loaded anything leaves hydration to its successor.
            if self.hydrated || !self.content().is_empty() {
                rooms.dormant.insert(self.key.clone(), self.encoded_state());
            }
        }
        true
    }

    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join {
                connection,
                user,
                outbox,
                ack,
            } => {
                self.join(connection, user, outbox).await;
                let _ = ack.send(());
            }
            RoomCommand::Sync {
                connection,
                payload,
            } => self.handle_sync(connection, payload),
            RoomCommand::Update {
                connection,
                payload,
            } => self.handle_raw_update(connection, payload),
            RoomCommand::Leave { connection } => self.leave(connection),
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn join(&mut self, connection: ConnectionId, user: UserIdentity, outbox: Outbox) {
        self.resolve_owner().await;
        self.hydrate().await;

        let entry = self.presence.join(connection, &user, self.owner.as_ref());
        self.group.add_peer(connection, outbox);

        self.send(connection, ServerEvent::Sync(protocol::step1_for(&self.awareness)));
        match self.awareness.update() {
            Ok(update) => self.send(connection, ServerEvent::Sync(protocol::awareness_message(update))),
            Err(e) => log::warn!("Awareness snapshot for {} failed: {e}", self.key),
        }
        self.send(connection, ServerEvent::CurrentUsers(self.presence.current_users()));
        self.broadcast(Some(connection), ServerEvent::UserJoined(entry.clone()));

        log::info!(
            "{} ({}) joined {} as {connection}",
            entry.display_name,
            entry.user_id,
            self.key
        );
    }

    /// Look the owner up once. A resource without one is remembered as such;
    /// other failures are retried on the next join.
    async fn resolve_owner(&mut self) {
        if self.owner_resolved {
            return;
        }
        let lookup = self.store.resolve_resource_owner(&self.key.resource_id);
        match tokio::time::timeout(self.store_timeout, lookup).await {
            Ok(Ok(owner)) => {
                self.owner = Some(owner);
                self.owner_resolved = true;
            }
            Ok(Err(StoreError::NotFound(_))) => {
                log::debug!("{} has no owner", self.key);
                self.owner_resolved = true;
            }
            Ok(Err(e)) => log::warn!("Owner lookup for {} failed: {e}", self.key),
            Err(_) => log::warn!(
                "Owner lookup for {} timed out after {:?}",
                self.key,
                self.store_timeout
            ),
        }
    }

    /// Load stored content into an empty replica, once per room.
    async fn hydrate(&mut self) {
        if self.hydrated {
            return;
        }
        if !self.content().is_empty() {
            self.hydrated = true;
            return;
        }

        let read = self
            .store
            .read_file_content(&self.key.resource_id, &self.key.path);
        let stored = match tokio::time::timeout(self.store_timeout, read).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("no answer within {:?}", self.store_timeout)),
        };
        match stored {
            Ok(stored) => {
                if let Some(stored) = stored.filter(|s| !s.is_empty()) {
                    let doc = self.awareness.doc();
                    let mut txn = doc.transact_mut();
                    let text = txn.get_or_insert_text(CONTENT_FIELD);
                    text.insert(&mut txn, 0, &stored);
                    log::info!("Hydrated {} ({} bytes)", self.key, stored.len());
                }
                self.hydrated = true;
            }
            Err(e) => {
                log::warn!("Hydration of {} failed, starting empty: {e}", self.key);
            }
        }
    }

    fn handle_sync(&mut self, connection: ConnectionId, payload: Vec<u8>) {
        let message = match Message::decode_v1(&payload) {
            Ok(message) => message,
            Err(e) => {
                self.reject(connection, ProtocolError::Crdt(e.to_string()));
                return;
            }
        };

        match message {
            Message::Sync(SyncMessage::SyncStep1(remote_sv)) => {
                let diff = self.diff(&remote_sv);
                self.send(connection, ServerEvent::Sync(protocol::sync_step2(diff)));
            }
            Message::Sync(SyncMessage::SyncStep2(update)) => {
                if let Err(e) = self.apply(&update) {
                    self.reject(connection, e);
                    return;
                }
                self.broadcast(
                    Some(connection),
                    ServerEvent::Sync(protocol::sync_update(update)),
                );
                self.schedule_persist();
            }
            Message::Sync(SyncMessage::Update(update)) => {
                if let Err(e) = self.apply(&update) {
                    self.reject(connection, e);
                    return;
                }
                self.broadcast(Some(connection), ServerEvent::Sync(payload));
                self.schedule_persist();
            }
            Message::Awareness(update) => self.handle_awareness(connection, update, payload),
            Message::AwarenessQuery => match self.awareness.update() {
                Ok(update) => {
                    self.send(connection, ServerEvent::Sync(protocol::awareness_message(update)))
                }
                Err(e) => log::warn!("Awareness snapshot for {} failed: {e}", self.key),
            },
            _ => log::debug!("Ignoring unsupported y-sync message in {}", self.key),
        }
    }

    fn handle_awareness(&mut self, connection: ConnectionId, update: AwarenessUpdate, raw: Vec<u8>) {
        let clients: Vec<ClientID> = update.clients.keys().copied().collect();
        if let Err(e) = self.awareness.apply_update(update) {
            self.reject(connection, ProtocolError::Crdt(e.to_string()));
            return;
        }
        self.awareness_clients
            .entry(connection)
            .or_default()
            .extend(clients);
        self.broadcast(Some(connection), ServerEvent::Sync(raw));
    }

    fn handle_raw_update(&mut self, connection: ConnectionId, payload: Vec<u8>) {
        if let Err(e) = self.apply(&payload) {
            self.reject(connection, e);
            return;
        }
        self.broadcast(Some(connection), ServerEvent::Update(payload));
        self.schedule_persist();
    }

    fn leave(&mut self, connection: ConnectionId) {
        self.group.remove_peer(&connection);

        if let Some(clients) = self.awareness_clients.remove(&connection) {
            for client in &clients {
                self.awareness.remove_state(*client);
            }
            match self.awareness.update_with_clients(clients) {
                Ok(update) => self.broadcast(None, ServerEvent::Sync(protocol::awareness_message(update))),
                Err(e) => log::debug!("No awareness removal to announce in {}: {e}", self.key),
            }
        }

        if let Some(entry) = self.presence.leave(&connection) {
            log::info!("{} left {}", entry.user_id, self.key);
            self.broadcast(None, ServerEvent::UserLeft { user_id: entry.user_id });
        }
    }

    /// Tear down connections the fan-out dropped, until none remain.
    fn reap_evicted(&mut self) {
        loop {
            let evicted = self.group.take_evicted();
            if evicted.is_empty() {
                break;
            }
            for connection in evicted {
                self.leave(connection);
            }
        }
    }

    fn apply(&mut self, update: &[u8]) -> Result<(), ProtocolError> {
        let update = Update::decode_v1(update).map_err(|e| ProtocolError::Crdt(e.to_string()))?;
        let mut txn = self.awareness.doc().transact_mut();
        txn.apply_update(update)
            .map_err(|e| ProtocolError::Crdt(e.to_string()))
    }

    fn diff(&self, remote_sv: &StateVector) -> Vec<u8> {
        self.awareness.doc().transact().encode_diff_v1(remote_sv)
    }

    fn encoded_state(&self) -> Vec<u8> {
        self.diff(&StateVector::default())
    }

    fn content(&self) -> String {
        let txn = self.awareness.doc().transact();
        txn.get_text(CONTENT_FIELD)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    fn schedule_persist(&self) {
        self.debouncer.schedule(self.key.clone(), self.content());
    }

    fn reject(&mut self, connection: ConnectionId, error: ProtocolError) {
        self.malformed += 1;
        log::warn!("Dropping message from {connection} in {}: {error}", self.key);
    }

    fn send(&mut self, connection: ConnectionId, event: ServerEvent) {
        if let Err(e) = self.group.send_to(connection, &event) {
            log::error!("Failed to encode event for {connection}: {e}");
        }
    }

    fn broadcast(&mut self, sender: Option<ConnectionId>, event: ServerEvent) {
        if let Err(e) = self.group.broadcast_except(sender, &event) {
            log::error!("Failed to encode broadcast in {}: {e}", self.key);
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            key: self.key.clone(),
            content: self.content(),
            connections: self.group.peer_count(),
            users: self.presence.current_users(),
            malformed_messages: self.malformed,
        }
    }
}
