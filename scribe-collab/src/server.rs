//! TCP / WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── Document "notes" ── worker ── DocumentStore
//!            ├── Session ── Agent ── Model
//! Client B ──┘   (per conn)             └── Document "todo"  ── worker ──┘
//!                    ▲                          │
//!                    └──── listeners ◄──────────┘
//! ```
//!
//! Each connection runs one task that multiplexes inbound messages into its
//! [`Session`] and drains the session's outgoing channel to the socket.
//!
//! Reference: Kleppmann - Designing Data-Intensive Applications, Chapter 5

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::agent::{Authorizer, DefaultAuthorizer};
use crate::config::{ServerConfig, Transport};
use crate::error::ProtocolError;
use crate::model::Model;
use crate::session::Session;
use crate::storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};
use crate::transport::{self, MessageReader, MessageWriter};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub protocol_errors: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    protocol_errors: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    model: Model,
    authorizer: Arc<dyn Authorizer>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server, opening the configured store: RocksDB when a
    /// storage path is set, otherwise an in-memory store.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        let model = Model::with_store(store, config.model);
        Ok(Self::with_model(config, model))
    }

    /// Create a server around an existing model.
    pub fn with_model(config: ServerConfig, model: Model) -> Self {
        Self {
            config,
            model,
            authorizer: Arc::new(DefaultAuthorizer),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Replace the default authorization policy.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        log::info!(
            "Sync server listening on {} ({:?})",
            listener.local_addr()?,
            self.config.transport
        );
        self.serve(listener).await
    }

    /// Accept connections on `listener` forever.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let model = self.model.clone();
            let authorizer = Arc::clone(&self.authorizer);
            let stats = Arc::clone(&self.stats);
            let transport = self.config.transport;

            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) =
                    Self::handle_connection(stream, addr, transport, model, authorizer, &stats).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        transport: Transport,
        model: Model,
        authorizer: Arc<dyn Authorizer>,
        stats: &AtomicServerStats,
    ) -> Result<(), ProtocolError> {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = match transport {
            Transport::Framed => transport::framed(stream),
            Transport::WebSocket => transport::websocket(tokio_tungstenite::accept_async(stream).await?),
        };

        let (out, mut outgoing) = mpsc::unbounded_channel();
        let mut session = match Session::connect(model, authorizer, Some(addr), out) {
            Ok(session) => session,
            Err(e) => {
                log::info!("Rejected connection from {addr}: {e}");
                while let Ok(msg) = outgoing.try_recv() {
                    writer.send(msg).await?;
                }
                return writer.close().await;
            }
        };

        let result = Self::pump(&mut session, &mut reader, &mut writer, &mut outgoing, addr, stats).await;
        session.close().await;
        let _ = writer.close().await;
        log::info!("Connection closed from {addr}");
        result
    }

    /// Shuttle messages until either side goes away or the client breaks
    /// the protocol.
    async fn pump(
        session: &mut Session,
        reader: &mut MessageReader,
        writer: &mut MessageWriter,
        outgoing: &mut mpsc::UnboundedReceiver<crate::protocol::Message>,
        addr: SocketAddr,
        stats: &AtomicServerStats,
    ) -> Result<(), ProtocolError> {
        loop {
            tokio::select! {
                inbound = reader.next() => match inbound {
                    Ok(Some(msg)) => {
                        stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = session.handle_message(msg) {
                            stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Aborting session {} from {addr}: {e}", session.session_id());
                            return Ok(());
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Aborting session {} from {addr}: {e}", session.session_id());
                        return Ok(());
                    }
                },
                Some(msg) = outgoing.recv() => writer.send(msg).await?,
            }
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            protocol_errors: self.stats.protocol_errors.load(Ordering::Relaxed),
        }
    }
}
