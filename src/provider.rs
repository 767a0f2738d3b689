//! Client-side provider: keeps a local document in sync with a remote room.

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::{TransportError, YWebsocket};
use crate::event::Event;
use crate::protocol::{create_update_message, ProtocolError, YMessage};
use crate::sync::{handshake_message, process_sync_message, SyncError, SyncOutcome};
use crate::ydoc::{DocError, YDocHandle, UPDATE_CHANNEL_SIZE};

/// Failures surfaced by the provider's run loop.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Connects one local document to a remote server.
///
/// Local transactions are mirrored onto the wire as UPDATE frames through a
/// bounded channel; inbound SYNC frames run through the same handshake
/// engine the server uses. The `synced` event trips when the opening
/// handshake's step 2 has been applied.
pub struct WebsocketProvider<T: YWebsocket> {
    doc: YDocHandle,
    conn: T,
    update_rx: mpsc::Receiver<Vec<u8>>,
    doc_subscription: yrs::Subscription,
    synced: Event,
}

impl<T: YWebsocket> WebsocketProvider<T> {
    /// Wire `doc` to `conn`. The update observer lives as long as the
    /// provider does.
    pub fn new(doc: YDocHandle, conn: T) -> Result<Self, DocError> {
        let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_SIZE);
        let doc_subscription = doc.subscribe_updates(update_tx)?;
        Ok(Self {
            doc,
            conn,
            update_rx,
            doc_subscription,
            synced: Event::new(),
        })
    }

    pub fn doc(&self) -> &YDocHandle {
        &self.doc
    }

    /// Trips once the initial handshake has completed.
    pub fn synced(&self) -> Event {
        self.synced.clone()
    }

    /// Drive the connection until it closes or fails.
    pub async fn run(self) -> Result<(), ProviderError> {
        let Self {
            doc,
            mut conn,
            update_rx,
            doc_subscription,
            synced,
        } = self;
        // the observer must outlive the read loop
        let _doc_subscription = doc_subscription;

        let sender = conn.sender();
        sender
            .send(handshake_message(&doc))
            .await
            .map_err(|_| TransportError::Closed)?;

        // pump local commits onto the wire; transient failures only end the
        // pump, the read loop decides the connection's fate
        let pump = tokio::spawn(send_pump(update_rx, sender.clone()));
        let result = read_loop(&doc, &mut conn, &sender, &synced).await;
        pump.abort();
        result
    }
}

async fn send_pump(mut update_rx: mpsc::Receiver<Vec<u8>>, sender: mpsc::Sender<Vec<u8>>) {
    while let Some(update) = update_rx.recv().await {
        let message = create_update_message(&update);
        if sender.send(message).await.is_err() {
            debug!("connection closed, stopping update pump");
            break;
        }
    }
}

async fn read_loop<T: YWebsocket>(
    doc: &YDocHandle,
    conn: &mut T,
    sender: &mpsc::Sender<Vec<u8>>,
    synced: &Event,
) -> Result<(), ProviderError> {
    while let Some(frame) = conn.recv().await? {
        match YMessage::parse(&frame)? {
            Some(YMessage::Sync(message)) => match process_sync_message(doc, &message) {
                Ok(SyncOutcome::Reply(reply)) => {
                    sender
                        .send(reply)
                        .await
                        .map_err(|_| TransportError::Closed)?;
                }
                Ok(SyncOutcome::Synced) => synced.set(),
                Ok(SyncOutcome::Applied) => {}
                Err(e) => {
                    warn!(error = %e, "closing provider after sync failure");
                    return Err(e.into());
                }
            },
            Some(YMessage::Awareness(payload)) => {
                // includes our own frames echoed back as a keepalive
                if let Err(e) = doc.apply_awareness_update(&payload) {
                    debug!(error = %e, "ignoring awareness payload");
                }
            }
            None => debug!("dropping frame with unknown type"),
        }
    }
    Ok(())
}
