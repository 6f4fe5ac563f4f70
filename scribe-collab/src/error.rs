//! Error types.
//!
//! [`ModelError`] renders as the exact strings sent to clients in the
//! `error` field of a response, so its `Display` output is part of the wire
//! contract and must not change.

use scribe_ot::OtError;

use crate::storage::StoreError;

/// Request-level failures reported by the document model and the agent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("Invalid document name")]
    InvalidName,
    #[error("Document already exists")]
    AlreadyExists,
    #[error("Document does not exist")]
    DoesNotExist,
    #[error("Version missing")]
    VersionMissing,
    #[error("Op at future version")]
    FutureVersion,
    #[error("Op too old")]
    TooOld,
    #[error("Op already submitted")]
    AlreadySubmitted,
    /// An invariant was violated while rebasing or applying. The detail is
    /// logged where it happens; clients only ever see the generic string.
    #[error("Internal error")]
    Internal,
    #[error("Op data invalid")]
    CorruptOps,
    #[error("Type mismatch")]
    TypeMismatch,
    #[error("Type not found")]
    TypeNotFound,
    #[error("Doc is not open")]
    NotOpen,
    #[error("Document already open")]
    AlreadyOpen,
    #[error("forbidden")]
    Forbidden,
    #[error("Session closed")]
    SessionClosed,
    #[error("Storage error: {0}")]
    Storage(StoreError),
}

impl From<StoreError> for ModelError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ModelError::DoesNotExist,
            StoreError::AlreadyExists(_) => ModelError::AlreadyExists,
            other => ModelError::Storage(other),
        }
    }
}

/// Wire-level failures. Any of these ends the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid frame length prefix {0:?}")]
    InvalidLength(String),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    ConnectionClosed,
}

/// Failures surfaced by the client connection and document mirrors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// The server rejected a request; the payload is its error string.
    #[error("{0}")]
    Server(String),
    #[error("expected version {expected} but got {got}")]
    VersionMismatch { expected: u64, got: u64 },
    #[error("document is not open")]
    NotOpen,
    #[error("document is already open")]
    AlreadyOpen,
    #[error("invalid operation: {0}")]
    InvalidOp(#[from] OtError),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("disconnected")]
    Disconnected,
    #[error("connection failed: {0}")]
    Connect(String),
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::ConnectionClosed => ClientError::Disconnected,
            other => ClientError::Connect(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_strings() {
        assert_eq!(ModelError::InvalidName.to_string(), "Invalid document name");
        assert_eq!(ModelError::AlreadyExists.to_string(), "Document already exists");
        assert_eq!(ModelError::DoesNotExist.to_string(), "Document does not exist");
        assert_eq!(ModelError::VersionMissing.to_string(), "Version missing");
        assert_eq!(ModelError::FutureVersion.to_string(), "Op at future version");
        assert_eq!(ModelError::TooOld.to_string(), "Op too old");
        assert_eq!(ModelError::Internal.to_string(), "Internal error");
        assert_eq!(ModelError::TypeMismatch.to_string(), "Type mismatch");
        assert_eq!(ModelError::NotOpen.to_string(), "Doc is not open");
        assert_eq!(ModelError::AlreadyOpen.to_string(), "Document already open");
        assert_eq!(ModelError::Forbidden.to_string(), "forbidden");
    }

    #[test]
    fn test_store_error_mapping() {
        assert_eq!(
            ModelError::from(StoreError::NotFound("a".into())),
            ModelError::DoesNotExist
        );
        assert_eq!(
            ModelError::from(StoreError::AlreadyExists("a".into())),
            ModelError::AlreadyExists
        );
        assert!(matches!(
            ModelError::from(StoreError::Database("disk".into())),
            ModelError::Storage(_)
        ));
    }
}
