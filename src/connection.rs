//! Transport contract and per-client send handles.
//!
//! The core is transport-agnostic: anything that can report a path, yield
//! inbound binary frames, and hand out a bounded sender for outbound frames
//! can be served. The WebSocket glue lives with the embedding binary.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Per-client outbound queue capacity. A client that cannot drain this many
/// frames has frames dropped; the next step 1/2 exchange recovers the state.
pub const CLIENT_QUEUE_SIZE: usize = 1024;

/// Send/receive failure on a client link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("transport failure: {0}")]
    Io(String),
}

/// A bidirectional message-framed connection, as reported by the transport.
///
/// `recv` yields whole binary frames in arrival order and `None` once the
/// peer has gone away. `sender` is the bounded queue the transport drains
/// into its write half.
#[async_trait]
pub trait YWebsocket: Send + 'static {
    /// The path the transport reported for this connection. Equal paths
    /// land in the same room; the core never parses or normalizes them.
    fn path(&self) -> &str;

    /// Outbound frame queue for this connection.
    fn sender(&self) -> mpsc::Sender<Vec<u8>>;

    /// Next inbound frame, or `None` when the peer closed the connection.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Roster entry: a cheap-clone handle for pushing frames to one client.
#[derive(Clone)]
pub struct YClient {
    id: Uuid,
    endpoint: Arc<str>,
    tx: mpsc::Sender<Vec<u8>>,
}

impl YClient {
    pub fn new(endpoint: &str, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: Arc::from(endpoint),
            tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Endpoint label, used for logging only.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Queue a frame for this client without blocking.
    ///
    /// A full queue drops the frame (slow consumer policy); a closed queue
    /// means the client is gone and the caller should drop the handle.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(endpoint = %self.endpoint, "client send queue full, dropping frame");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }
}

impl std::fmt::Debug for YClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YClient")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_queues_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = YClient::new("/test", tx);
        client.send(vec![1, 2, 3]).unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_frame() {
        let (tx, _rx) = mpsc::channel(1);
        let client = YClient::new("/test", tx);
        client.send(vec![1]).unwrap();
        // queue is full now; the frame is dropped, not an error
        client.send(vec![2]).unwrap();
    }

    #[tokio::test]
    async fn test_closed_queue_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let client = YClient::new("/test", tx);
        assert!(matches!(
            client.send(vec![1]),
            Err(TransportError::Closed)
        ));
    }
}
