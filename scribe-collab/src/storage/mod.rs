//! Persistent storage for documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  write_op / write_snapshot  ┌───────────────┐
//! │ Model       │ ──────────────────────────► │ DocumentStore │
//! │ (per-doc    │                             │  MemoryStore  │
//! │  workers)   │ ◄────────────────────────── │  RocksStore   │
//! └─────────────┘  get_snapshot / get_ops     └───────────────┘
//!                  (cold load, catch-up,
//!                   history beyond the cache)
//! ```
//!
//! A store keeps, per document name, the last committed snapshot and an
//! append-only op log keyed by version. Snapshots lag the log: a cold load
//! reads the snapshot and replays every logged op from its version on.
//!
//! Stores are synchronous. The model calls them through
//! [`tokio::task::spawn_blocking`] so a slow disk only stalls the document
//! being written.
//!
//! Reference: Kleppmann - Designing Data-Intensive Applications, Chapter 3

pub mod memory;
pub mod rocks;

use std::sync::Arc;

use crate::doc::{DocSnapshot, OpData};

pub use memory::MemoryStore;
pub use rocks::{DocumentRecord, RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Document already exists: {0}")]
    AlreadyExists(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Snapshot and op-log backend.
pub trait DocumentStore: Send + Sync + 'static {
    /// Record a new document. Fails `AlreadyExists` if the name is taken.
    fn create(&self, name: &str, data: &DocSnapshot) -> Result<(), StoreError>;

    /// Last committed snapshot. Fails `NotFound` for unknown names.
    fn get_snapshot(&self, name: &str) -> Result<DocSnapshot, StoreError>;

    /// Replace the committed snapshot.
    fn write_snapshot(&self, name: &str, data: &DocSnapshot) -> Result<(), StoreError>;

    /// Append an op at version `op.v`.
    fn write_op(&self, name: &str, op: &OpData) -> Result<(), StoreError>;

    /// Ops with `start <= v < end` (to the end of the log when `end` is
    /// `None`), in version order.
    fn get_ops(&self, name: &str, start: u64, end: Option<u64>) -> Result<Vec<OpData>, StoreError>;

    /// Remove the snapshot and every op. Fails `NotFound` for unknown names.
    fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Names of every stored document.
    fn list(&self) -> Result<Vec<String>, StoreError>;
}

/// Run a store call on the blocking pool.
pub(crate) async fn blocking<T, F>(store: &Arc<dyn DocumentStore>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn DocumentStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    match tokio::task::spawn_blocking(move || f(store.as_ref())).await {
        Ok(result) => result,
        Err(e) => Err(StoreError::Database(format!("storage task failed: {e}"))),
    }
}
