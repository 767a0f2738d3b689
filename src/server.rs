//! The server: a map of rooms keyed by connection path, and the per-client
//! serve loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::{TransportError, YClient, YWebsocket};
use crate::protocol::{ProtocolError, YMessage};
use crate::room::YRoom;
use crate::store::{StoreError, YStore};
use crate::sync::{handshake_message, process_sync_message, SyncError, SyncOutcome};

/// Server construction parameters.
#[derive(Clone)]
pub struct WebsocketServerConfig {
    /// Whether newly created rooms are immediately ready.
    pub rooms_ready: bool,
    /// Delete a room once its last client departs.
    pub auto_clean_rooms: bool,
    /// Store attached to every room this server creates.
    pub ystore: Option<Arc<dyn YStore>>,
}

impl Default for WebsocketServerConfig {
    fn default() -> Self {
        Self {
            rooms_ready: true,
            auto_clean_rooms: true,
            ystore: None,
        }
    }
}

/// Selects the room an operation applies to.
pub enum RoomTarget<'a> {
    Name(&'a str),
    Room(&'a Arc<YRoom>),
}

/// Failures surfaced by server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is not started")]
    NotStarted,
    #[error("room not found")]
    RoomNotFound,
    #[error("a room named {0} already exists")]
    RoomExists(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Serves every connection the transport hands over, routing each to the
/// room named by its path.
pub struct WebsocketServer {
    config: WebsocketServerConfig,
    rooms: RwLock<HashMap<String, Arc<YRoom>>>,
    running: AtomicBool,
}

impl WebsocketServer {
    pub fn new(config: WebsocketServerConfig) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stop serving: every room's broadcast task is cancelled and further
    /// `serve` calls are rejected until the server is started again.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for room in self.rooms.read().await.values() {
            room.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Look up or create the room for `name`. Created rooms take the
    /// server's configured readiness and store.
    pub async fn get_room(&self, name: &str) -> Arc<YRoom> {
        if let Some(room) = self.rooms.read().await.get(name) {
            return room.clone();
        }
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }
        let room = Arc::new(YRoom::new(
            name,
            self.config.rooms_ready,
            self.config.ystore.clone(),
        ));
        rooms.insert(name.to_string(), room.clone());
        info!(room = name, "created room");
        room
    }

    /// The name a room is currently registered under.
    pub async fn room_name(&self, room: &Arc<YRoom>) -> Option<String> {
        self.rooms
            .read()
            .await
            .iter()
            .find(|(_, r)| Arc::ptr_eq(r, room))
            .map(|(name, _)| name.clone())
    }

    /// Atomically re-key a room. Fails when the source is unknown or the
    /// destination name is taken.
    pub async fn rename_room(&self, to: &str, from: RoomTarget<'_>) -> Result<(), ServerError> {
        let mut rooms = self.rooms.write().await;
        let from_name = resolve_name(&rooms, from)?;
        if rooms.contains_key(to) {
            return Err(ServerError::RoomExists(to.to_string()));
        }
        let room = rooms.remove(&from_name).ok_or(ServerError::RoomNotFound)?;
        rooms.insert(to.to_string(), room);
        info!(from = %from_name, to = %to, "renamed room");
        Ok(())
    }

    /// Atomically stop and remove a room.
    pub async fn delete_room(&self, target: RoomTarget<'_>) -> Result<(), ServerError> {
        let room = {
            let mut rooms = self.rooms.write().await;
            let name = resolve_name(&rooms, target)?;
            let room = rooms.remove(&name).ok_or(ServerError::RoomNotFound)?;
            info!(room = %name, "deleted room");
            room
        };
        room.stop().await;
        Ok(())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Serve one connection until it closes or fails. The connection's path
    /// selects the room; the room is created and started on first use.
    pub async fn serve<T: YWebsocket>(&self, mut conn: T) -> Result<(), ServerError> {
        if !self.is_running() {
            return Err(ServerError::NotStarted);
        }
        let path = conn.path().to_string();
        let room = self.get_room(&path).await;
        room.start().await;
        room.started().wait().await;
        self.ensure_ready(&room).await?;

        let client = YClient::new(&path, conn.sender());
        let client_id = client.id();
        room.add_client(client.clone()).await;
        debug!(room = %path, client = %client_id, "client joined");

        let result = self.serve_client(&room, &client, &mut conn).await;

        room.remove_client(client_id).await;
        debug!(room = %path, client = %client_id, "client left");
        if self.config.auto_clean_rooms && room.client_count().await == 0 {
            let _ = self.delete_room(RoomTarget::Room(&room)).await;
        }
        result
    }

    /// Gate the handshake on room readiness. A room bound to a store is
    /// preloaded from it here; a store-less room waits for the embedder to
    /// flip readiness.
    async fn ensure_ready(&self, room: &Arc<YRoom>) -> Result<(), ServerError> {
        if room.is_ready() {
            return Ok(());
        }
        let Some(ystore) = room.ystore().cloned() else {
            room.ready_event().wait().await;
            return Ok(());
        };
        match ystore.apply_updates(room.name(), room.doc()).await {
            Ok(()) => {}
            Err(StoreError::DocNotFound(_)) => {
                // brand-new document: seed the store with its current state
                ystore
                    .encode_state_as_update(room.name(), room.doc())
                    .await?;
            }
            Err(e) => {
                warn!(room = %room.name(), error = %e, "room preload failed");
                return Err(e.into());
            }
        }
        room.set_ready(true).await;
        Ok(())
    }

    async fn serve_client<T: YWebsocket>(
        &self,
        room: &Arc<YRoom>,
        client: &YClient,
        conn: &mut T,
    ) -> Result<(), ServerError> {
        client.send(handshake_message(room.doc()))?;

        while let Some(frame) = conn.recv().await? {
            if room.filter_message(&frame).await {
                continue;
            }
            match YMessage::parse(&frame)? {
                Some(YMessage::Sync(message)) => {
                    match process_sync_message(room.doc(), &message) {
                        Ok(SyncOutcome::Reply(reply)) => client.send(reply)?,
                        Ok(_) => {}
                        Err(e) => {
                            // a bad update poisons only this peer, not the room
                            warn!(room = %room.name(), error = %e, "closing client after sync failure");
                            return Err(e.into());
                        }
                    }
                }
                Some(YMessage::Awareness(payload)) => {
                    room.apply_awareness(&payload);
                    // forward verbatim to the roster snapshot, sender included
                    for peer in room.clients().await {
                        debug!(
                            room = %room.name(),
                            from = %client.endpoint(),
                            to = %peer.endpoint(),
                            "forwarding awareness frame"
                        );
                        let _ = peer.send(frame.clone());
                    }
                }
                None => debug!(room = %room.name(), "dropping frame with unknown type"),
            }
        }
        Ok(())
    }
}

fn resolve_name(
    rooms: &HashMap<String, Arc<YRoom>>,
    target: RoomTarget<'_>,
) -> Result<String, ServerError> {
    match target {
        RoomTarget::Name(name) => {
            if rooms.contains_key(name) {
                Ok(name.to_string())
            } else {
                Err(ServerError::RoomNotFound)
            }
        }
        RoomTarget::Room(room) => rooms
            .iter()
            .find(|(_, r)| Arc::ptr_eq(r, room))
            .map(|(name, _)| name.clone())
            .ok_or(ServerError::RoomNotFound),
    }
}
