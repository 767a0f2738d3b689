//! Real-time collaborative editing over WebSocket-like transports.
//!
//! The crate implements the Yjs room synchronization model: a
//! [`WebsocketServer`] owns named [`YRoom`]s, each binding one CRDT document
//! to a roster of clients. Rooms run the two-step sync handshake with every
//! client, broadcast document updates and awareness traffic, and optionally
//! persist updates to a [`store::YStore`] with TTL-driven history squashing.
//! The symmetric client side is [`WebsocketProvider`].
//!
//! The transport is abstracted behind [`connection::YWebsocket`]; the
//! `yrooms-server` binary supplies the axum WebSocket glue.

pub mod connection;
pub mod event;
pub mod protocol;
pub mod provider;
pub mod room;
pub mod server;
pub mod store;
pub mod sync;
pub mod ydoc;

pub use connection::{TransportError, YClient, YWebsocket};
pub use provider::{ProviderError, WebsocketProvider};
pub use room::{MessageFilter, YRoom};
pub use server::{RoomTarget, ServerError, WebsocketServer, WebsocketServerConfig};
pub use store::{
    FileYStore, SQLiteYStore, StoreError, StoredUpdate, YStore, YStoreConfig,
};
pub use ydoc::YDocHandle;
