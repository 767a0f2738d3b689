//! yrooms-server: serve collaborative rooms over WebSocket.
//!
//! Every URL path is a room. Point any y-websocket compatible client at
//! `ws://host:port/<room>` and peers on the same path converge.
//!
//! Usage:
//!   yrooms-server
//!   yrooms-server --port 1234 --store ./ystore.db --document-ttl 3600

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use futures::stream::{SplitStream, StreamExt};
use futures::SinkExt;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use yrooms::connection::{TransportError, YWebsocket, CLIENT_QUEUE_SIZE};
use yrooms::store::{SQLiteYStore, YStore, YStoreConfig};
use yrooms::{WebsocketServer, WebsocketServerConfig};

#[derive(Parser)]
#[command(name = "yrooms-server", about = "Collaborative room server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1", env = "YROOMS_HOST")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8000, env = "YROOMS_PORT")]
    port: u16,

    /// SQLite database persisting room updates; omit for in-memory rooms
    #[arg(long, env = "YROOMS_STORE")]
    store: Option<PathBuf>,

    /// Squash a document's stored history once its latest update is older
    /// than this many seconds
    #[arg(long, env = "YROOMS_DOCUMENT_TTL")]
    document_ttl: Option<u64>,

    /// Keep rooms alive after their last client disconnects
    #[arg(long)]
    no_auto_clean: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();

    let ystore: Option<Arc<dyn YStore>> = match &args.store {
        Some(path) => {
            let mut config = YStoreConfig::new(path);
            if let Some(ttl) = args.document_ttl {
                config = config.document_ttl(Duration::from_secs(ttl));
            }
            let store = SQLiteYStore::new(config);
            store.initialize().await?;
            info!(path = %path.display(), "persisting rooms to SQLite store");
            Some(Arc::new(store))
        }
        None => None,
    };

    let server = Arc::new(WebsocketServer::new(WebsocketServerConfig {
        rooms_ready: true,
        auto_clean_rooms: !args.no_auto_clean,
        ystore,
    }));
    server.start();

    let app = Router::new()
        .route("/*path", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(server);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(
    State(server): State<Arc<WebsocketServer>>,
    Path(path): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let room = format!("/{}", path);
    ws.on_upgrade(move |socket| async move {
        let conn = AxumWebsocket::new(room.clone(), socket);
        if let Err(e) = server.serve(conn).await {
            debug!(room = %room, error = %e, "connection ended with error");
        }
    })
}

/// Adapts an axum WebSocket to the core's transport contract. A writer task
/// drains the bounded outbound queue into the socket; it exits once the
/// roster and the connection have dropped their senders.
struct AxumWebsocket {
    path: String,
    tx: mpsc::Sender<Vec<u8>>,
    reader: SplitStream<WebSocket>,
}

impl AxumWebsocket {
    fn new(path: String, socket: WebSocket) -> Self {
        let (mut writer, reader) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CLIENT_QUEUE_SIZE);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if writer.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });
        Self { path, tx, reader }
    }
}

#[async_trait::async_trait]
impl YWebsocket for AxumWebsocket {
    fn path(&self) -> &str {
        &self.path
    }

    fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.tx.clone()
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.reader.next().await {
                Some(Ok(Message::Binary(frame))) => return Ok(Some(frame)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/text
                Some(Err(e)) => {
                    warn!(path = %self.path, error = %e, "websocket receive failed");
                    return Err(TransportError::Io(e.to_string()));
                }
            }
        }
    }
}
