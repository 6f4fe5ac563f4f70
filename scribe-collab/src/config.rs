//! Server and model configuration.

use std::path::PathBuf;

/// Tuning knobs for the document model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelOptions {
    /// Applied ops kept in memory per document for rebasing without a
    /// storage round-trip.
    pub num_cached_ops: usize,
    /// A snapshot is written once this many ops have been applied since the
    /// last committed one.
    pub ops_before_commit: u64,
    /// How far behind the current version a submitted op's base may be.
    pub maximum_age: u64,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            num_cached_ops: 20,
            ops_before_commit: 20,
            maximum_age: 20,
        }
    }
}

/// How messages are carried over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// JSON messages prefixed with a 10-digit zero-padded byte length.
    #[default]
    Framed,
    /// One JSON message per WebSocket text frame.
    WebSocket,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Wire transport accepted on `bind_addr`
    pub transport: Transport,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    /// Document model tuning
    pub model: ModelOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:6633".to_string(),
            transport: Transport::Framed,
            storage_path: None,
            model: ModelOptions::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, in-memory store, small history window.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            transport: Transport::Framed,
            storage_path: None,
            model: ModelOptions {
                num_cached_ops: 4,
                ops_before_commit: 4,
                maximum_age: 20,
            },
        }
    }
}
