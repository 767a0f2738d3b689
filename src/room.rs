//! A room binds one document to a roster of clients and fans updates out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;
use yrs::Subscription;

use crate::connection::YClient;
use crate::event::Event;
use crate::protocol::create_update_message;
use crate::store::YStore;
use crate::ydoc::{YDocHandle, UPDATE_CHANNEL_SIZE};

/// Synchronous inbound-frame filter; returning `true` skips the frame.
pub type MessageFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// A named synchronization context: one document, its awareness state, the
/// clients currently connected, and an optional durable update log.
///
/// The broadcast task started by [`YRoom::start`] is the single serializer
/// of document updates: every update committed to the document (by a remote
/// frame or by an out-of-band local mutation) is delivered to every client
/// in commit order, and appended to the store when one is bound.
pub struct YRoom {
    name: Arc<str>,
    doc: YDocHandle,
    ystore: Option<Arc<dyn YStore>>,
    clients: RwLock<Vec<YClient>>,
    update_tx: mpsc::Sender<Vec<u8>>,
    update_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    doc_subscription: Mutex<Option<Subscription>>,
    on_message: Mutex<Option<MessageFilter>>,
    broadcast_task: Mutex<Option<JoinHandle<()>>>,
    ready: AtomicBool,
    ready_event: Event,
    started: Event,
}

impl YRoom {
    /// Create a room. A room created ready immediately mirrors document
    /// commits into its broadcast channel; a not-ready room (e.g. one still
    /// replaying its store) applies updates without broadcasting them until
    /// [`YRoom::set_ready`] flips it.
    pub fn new(name: &str, ready: bool, ystore: Option<Arc<dyn YStore>>) -> Self {
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_SIZE);
        let doc = YDocHandle::new();
        let mut room = Self {
            name: Arc::from(name),
            doc,
            ystore,
            clients: RwLock::new(Vec::new()),
            update_tx,
            update_rx: Mutex::new(Some(update_rx)),
            doc_subscription: Mutex::new(None),
            on_message: Mutex::new(None),
            broadcast_task: Mutex::new(None),
            ready: AtomicBool::new(false),
            ready_event: Event::new(),
            started: Event::new(),
        };
        if ready {
            let subscription = room.install_observer();
            *room.doc_subscription.get_mut() = subscription;
            room.ready.store(true, Ordering::SeqCst);
            room.ready_event.set();
        }
        room
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn doc(&self) -> &YDocHandle {
        &self.doc
    }

    pub fn ystore(&self) -> Option<&Arc<dyn YStore>> {
        self.ystore.as_ref()
    }

    /// Set when the broadcast task is running.
    pub fn started(&self) -> &Event {
        &self.started
    }

    /// Whether the document is initialized and the room admits handshakes.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Set the first time the room becomes ready; connections arriving
    /// before that wait on it.
    pub fn ready_event(&self) -> &Event {
        &self.ready_event
    }

    /// Flip readiness. Becoming ready installs the document observer (once);
    /// updates committed before that are not broadcast.
    pub async fn set_ready(&self, value: bool) {
        self.ready.store(value, Ordering::SeqCst);
        if value {
            let mut subscription = self.doc_subscription.lock().await;
            if subscription.is_none() {
                *subscription = self.install_observer();
            }
            self.ready_event.set();
        }
    }

    fn install_observer(&self) -> Option<Subscription> {
        match self.doc.subscribe_updates(self.update_tx.clone()) {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                error!(room = %self.name, error = %e, "failed to observe document updates");
                None
            }
        }
    }

    /// Install or clear the inbound-frame filter.
    pub async fn set_on_message(&self, filter: Option<MessageFilter>) {
        *self.on_message.lock().await = filter;
    }

    /// Apply the filter to an inbound frame; `true` means skip it.
    pub async fn filter_message(&self, frame: &[u8]) -> bool {
        match self.on_message.lock().await.as_ref() {
            Some(filter) => filter(frame),
            None => false,
        }
    }

    /// Merge an inbound awareness payload into the room's awareness state.
    /// Malformed payloads are logged; routing to peers is unaffected.
    pub fn apply_awareness(&self, payload: &[u8]) {
        if let Err(e) = self.doc.apply_awareness_update(payload) {
            debug!(room = %self.name, error = %e, "ignoring awareness payload");
        }
    }

    pub async fn add_client(&self, client: YClient) {
        self.clients.write().await.push(client);
    }

    pub async fn remove_client(&self, id: Uuid) {
        self.clients.write().await.retain(|c| c.id() != id);
    }

    /// Copy of the current roster, in insertion order.
    pub async fn clients(&self) -> Vec<YClient> {
        self.clients.read().await.clone()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Spawn the broadcast task. Idempotent; a stopped room stays stopped.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.broadcast_task.lock().await;
        if task.is_none() {
            if let Some(update_rx) = self.update_rx.lock().await.take() {
                let room = self.clone();
                *task = Some(tokio::spawn(async move {
                    room.broadcast_updates(update_rx).await;
                }));
            }
        }
        self.started.set();
    }

    /// Cancel the broadcast task; after return no further sends occur. The
    /// document observer is detached as well.
    pub async fn stop(&self) {
        if let Some(task) = self.broadcast_task.lock().await.take() {
            task.abort();
        }
        self.doc_subscription.lock().await.take();
    }

    async fn broadcast_updates(&self, mut update_rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(update) = update_rx.recv().await {
            let message = create_update_message(&update);
            for client in self.clients().await {
                debug!(room = %self.name, endpoint = %client.endpoint(), "sending Y update to client");
                // a closed client is cleaned up by its own serve loop
                let _ = client.send(message.clone());
            }
            if let Some(ystore) = &self.ystore {
                debug!(room = %self.name, "writing Y update to YStore");
                let ystore = ystore.clone();
                let name = self.name.clone();
                tokio::spawn(async move {
                    if let Err(e) = ystore.write(&name, &update).await {
                        warn!(room = %name, error = %e, "failed to write update to YStore");
                    }
                });
            }
        }
    }
}

impl std::fmt::Debug for YRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YRoom")
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .field("started", &self.started.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SyncMessage, YMessage};
    use yrs::{Text, Transact};

    fn mutate(room: &YRoom) {
        let text = room.doc().doc().get_or_insert_text("content");
        let mut txn = room.doc().doc().transact_mut();
        text.insert(&mut txn, 0, "x");
    }

    async fn recv_update(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        let frame = rx.recv().await.unwrap();
        match YMessage::parse(&frame).unwrap().unwrap() {
            YMessage::Sync(SyncMessage::Update(update)) => update,
            other => panic!("expected update frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcasts_commits_to_all_clients() {
        let room = Arc::new(YRoom::new("/r", true, None));
        room.start().await;
        room.started().wait().await;

        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        room.add_client(YClient::new("a", tx_a)).await;
        room.add_client(YClient::new("b", tx_b)).await;

        mutate(&room);

        let update_a = recv_update(&mut rx_a).await;
        let update_b = recv_update(&mut rx_b).await;
        assert_eq!(update_a, update_b);
    }

    #[tokio::test]
    async fn test_not_ready_room_does_not_broadcast() {
        let room = Arc::new(YRoom::new("/r", false, None));
        room.start().await;

        let (tx, mut rx) = mpsc::channel(8);
        room.add_client(YClient::new("a", tx)).await;

        mutate(&room);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        // becoming ready broadcasts subsequent commits only
        room.set_ready(true).await;
        mutate(&room);
        recv_update(&mut rx).await;
    }

    #[tokio::test]
    async fn test_stop_silences_broadcasts() {
        let room = Arc::new(YRoom::new("/r", true, None));
        room.start().await;

        let (tx, mut rx) = mpsc::channel(8);
        room.add_client(YClient::new("a", tx)).await;

        room.stop().await;
        mutate(&room);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let room = Arc::new(YRoom::new("/r", true, None));
        room.start().await;
        room.start().await;
        assert!(room.started().is_set());
    }

    #[tokio::test]
    async fn test_on_message_filter() {
        let room = YRoom::new("/r", true, None);
        assert!(!room.filter_message(b"frame").await);

        room.set_on_message(Some(Arc::new(|frame: &[u8]| frame[0] == 1)))
            .await;
        assert!(room.filter_message(&[1, 2, 3]).await);
        assert!(!room.filter_message(&[0, 2, 3]).await);
    }

    #[tokio::test]
    async fn test_remove_client() {
        let room = YRoom::new("/r", true, None);
        let (tx, _rx) = mpsc::channel(8);
        let client = YClient::new("a", tx);
        let id = client.id();
        room.add_client(client).await;
        assert_eq!(room.client_count().await, 1);
        room.remove_client(id).await;
        assert_eq!(room.client_count().await, 0);
    }
}
