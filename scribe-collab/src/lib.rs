//! # scribe-collab - Real-time collaborative text editing
//!
//! A central server linearizes concurrent edits to shared text documents
//! with operational transformation; clients edit optimistically and
//! reconcile with the server's order.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   framed JSON / WebSocket   ┌──────────────┐
//! │ CollabClient │ ◄─────────────────────────► │ SyncServer   │
//! │  DocMirror   │                             │  Session     │
//! │  (per doc)   │                             │  (per conn)  │
//! └──────────────┘                             └──────┬───────┘
//!                                                     │ Agent (auth)
//!                                                     ▼
//!                                              ┌──────────────┐
//!                                              │ Model        │
//!                                              │ (per-doc     │
//!                                              │  FIFO worker)│
//!                                              └──────┬───────┘
//!                                                     │
//!                                              ┌──────┴───────┐
//!                                              │ DocumentStore│
//!                                              └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`] - Per-document version history, rebasing and listeners
//! - [`session`] - Server side of one connection
//! - [`agent`] - Connection identity and authorization
//! - [`client`] - Client connection and document mirrors
//! - [`protocol`] - JSON messages and length-prefixed framing
//! - [`transport`] - Framed TCP and WebSocket message streams
//! - [`storage`] - In-memory and RocksDB document stores
//! - [`server`] - TCP / WebSocket accept loop

pub mod agent;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod doc;
pub mod error;
pub mod model;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use agent::{Action, ActionKind, Agent, AgentInfo, Authorizer, DefaultAuthorizer};
pub use broadcast::{BroadcastStats, DocUpdate, Listener, ListenerId};
pub use client::{CollabClient, ConnectionState, DocEvent, DocHandle, DocMirror, MirrorState, PendingAck};
pub use config::{ModelOptions, ServerConfig, Transport};
pub use doc::{DocSnapshot, OpData, OpMeta, TEXT_TYPE};
pub use error::{ClientError, ModelError, ProtocolError};
pub use model::{LoadedDoc, Model, ModelStats, OnApplied};
pub use server::{ServerStats, SyncServer};
pub use session::Session;
pub use storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};
