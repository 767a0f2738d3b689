//! In-memory duplex transport for exercising the server without sockets.

use async_trait::async_trait;
use tokio::sync::mpsc;
use yrooms::connection::{TransportError, YWebsocket};

/// One end of an in-memory bidirectional framed connection.
pub struct DuplexWebsocket {
    path: String,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Build a connected pair of endpoints reporting `path`.
pub fn duplex(path: &str) -> (DuplexWebsocket, DuplexWebsocket) {
    let (a_tx, b_rx) = mpsc::channel(1024);
    let (b_tx, a_rx) = mpsc::channel(1024);
    (
        DuplexWebsocket {
            path: path.to_string(),
            tx: a_tx,
            rx: a_rx,
        },
        DuplexWebsocket {
            path: path.to_string(),
            tx: b_tx,
            rx: b_rx,
        },
    )
}

#[async_trait]
impl YWebsocket for DuplexWebsocket {
    fn path(&self) -> &str {
        &self.path
    }

    fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.tx.clone()
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Receive the next frame from `ws`, failing the test on close or timeout.
pub async fn recv_frame(ws: &mut DuplexWebsocket) -> Vec<u8> {
    tokio::time::timeout(std::time::Duration::from_secs(2), ws.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("transport error")
        .expect("connection closed")
}
