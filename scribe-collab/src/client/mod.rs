//! Client for the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, handshake, close)
//! - Document mirrors with local-first editing ([`DocHandle`])
//! - Directory listings
//!
//! One reader task routes server messages to the mirror they name. One
//! writer task drains the outgoing channel shared by every mirror.
//!
//! Reference: Kleppmann, Chapter 5 - Replication

pub mod mirror;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use scribe_ot::{Component, Op, RawOp};
use serde_json::{Value, json};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

pub use mirror::{AckSender, DocEvent, DocMirror, MirrorState};

use crate::error::ClientError;
use crate::protocol::Message;
use crate::transport::{self, MessageReader, MessageWriter};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    /// Connected, waiting for the server's `auth` greeting
    Handshaking,
    Ok,
    Disconnected,
    /// Closed for good
    Stopped,
}

/// A mirror and the handle that owns it. Reopening a name issues a new
/// handle id, so a stale handle never touches the new mirror.
struct OpenDoc {
    handle: u64,
    mirror: DocMirror,
}

#[derive(Default)]
struct ClientInner {
    session_id: Option<Uuid>,
    last_error: Option<String>,
    next_handle: u64,
    docs: HashMap<String, OpenDoc>,
    listings: VecDeque<oneshot::Sender<Result<Vec<String>, ClientError>>>,
}

struct ClientShared {
    inner: Mutex<ClientInner>,
    out: mpsc::UnboundedSender<Message>,
    state: watch::Sender<ConnectionState>,
}

impl ClientShared {
    fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        log::debug!("Connection state: {state:?}");
        self.state.send_replace(state);
    }

    fn is_ok(&self) -> bool {
        *self.state.borrow() == ConnectionState::Ok
    }
}

/// Resolves once the server has acknowledged (or refused) a request.
#[must_use = "an ack does nothing unless awaited"]
pub struct PendingAck(oneshot::Receiver<Result<u64, ClientError>>);

impl Future for PendingAck {
    type Output = Result<u64, ClientError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ClientError::Disconnected)))
    }
}

fn pending_ack() -> (AckSender, PendingAck) {
    let (tx, rx) = oneshot::channel();
    (tx, PendingAck(rx))
}

/// The sync client.
pub struct CollabClient {
    shared: Arc<ClientShared>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl CollabClient {
    /// Connect over the length-prefixed TCP transport.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = transport::framed(stream);
        Self::start(reader, writer, state).await
    }

    /// Connect to a WebSocket server, e.g. `ws://127.0.0.1:6633`.
    pub async fn connect_websocket(url: &str) -> Result<Self, ClientError> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (reader, writer) = transport::websocket(ws);
        Self::start(reader, writer, state).await
    }

    /// Wait for the greeting, then hand the connection to background tasks.
    async fn start(
        mut reader: MessageReader,
        writer: MessageWriter,
        state: watch::Sender<ConnectionState>,
    ) -> Result<Self, ClientError> {
        state.send_replace(ConnectionState::Handshaking);
        let greeting = reader.next().await?.ok_or(ClientError::Disconnected)?;
        let session_id = match greeting.get("auth") {
            Some(Value::String(id)) => {
                Uuid::parse_str(id).map_err(|e| ClientError::Handshake(format!("bad session id: {e}")))?
            }
            Some(Value::Null) => {
                let error = greeting
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("connection refused");
                return Err(ClientError::Handshake(error.to_string()));
            }
            _ => return Err(ClientError::Handshake(format!("expected auth, got {greeting:?}"))),
        };
        log::info!("Connected as session {session_id}");

        let (out, out_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = oneshot::channel();
        let shared = Arc::new(ClientShared {
            inner: Mutex::new(ClientInner {
                session_id: Some(session_id),
                ..ClientInner::default()
            }),
            out,
            state,
        });
        shared.set_state(ConnectionState::Ok);

        tokio::spawn(Self::write_loop(writer, out_rx, shutdown_rx));
        tokio::spawn(Self::read_loop(reader, Arc::clone(&shared)));

        Ok(Self {
            shared,
            shutdown: Some(shutdown),
        })
    }

    async fn write_loop(
        mut writer: MessageWriter,
        mut out: mpsc::UnboundedReceiver<Message>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                msg = out.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = writer.send(msg).await {
                            log::warn!("Send failed: {e}");
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut shutdown => {
                    while let Ok(msg) = out.try_recv() {
                        if writer.send(msg).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
        }
        let _ = writer.close().await;
    }

    async fn read_loop(mut reader: MessageReader, shared: Arc<ClientShared>) {
        let mut last_doc: Option<String> = None;
        let reason = loop {
            match reader.next().await {
                Ok(Some(msg)) => Self::route(&shared, &mut last_doc, msg),
                Ok(None) => break None,
                Err(e) => {
                    log::warn!("Connection error: {e}");
                    break Some(e.to_string());
                }
            }
        };

        shared.set_state(ConnectionState::Disconnected);
        let mut inner = shared.lock();
        inner.session_id = None;
        for doc in inner.docs.values_mut() {
            doc.mirror.set_connected(false);
        }
        inner.docs.clear();
        for listing in inner.listings.drain(..) {
            let _ = listing.send(Err(ClientError::Disconnected));
        }
        if reason.is_some() {
            inner.last_error = reason;
        }
        drop(inner);
        shared.set_state(ConnectionState::Stopped);
        log::info!("Disconnected");
    }

    fn route(shared: &ClientShared, last_doc: &mut Option<String>, msg: Message) {
        let mut inner = shared.lock();

        if msg.contains_key("docs") && !msg.contains_key("doc") {
            let Some(listing) = inner.listings.pop_front() else {
                log::debug!("Unsolicited directory listing");
                return;
            };
            let result = match (msg.get("docs"), msg.get("error").and_then(Value::as_str)) {
                (_, Some(error)) => Err(ClientError::Server(error.to_string())),
                (Some(docs), None) => serde_json::from_value(docs.clone())
                    .map_err(|e| ClientError::UnexpectedMessage(format!("bad listing: {e}"))),
                (None, None) => Ok(Vec::new()),
            };
            let _ = listing.send(result);
            return;
        }

        let name = match msg.get("doc") {
            Some(Value::String(doc)) => {
                *last_doc = Some(doc.clone());
                doc.clone()
            }
            _ => match last_doc {
                Some(doc) => doc.clone(),
                None => {
                    log::debug!("Message with no document: {msg:?}");
                    return;
                }
            },
        };

        let Some(doc) = inner.docs.get_mut(&name) else {
            log::debug!("Message for unopened document {name}");
            return;
        };
        let result = doc.mirror.handle_message(&msg);
        if result.is_err() || doc.mirror.state() == MirrorState::Closed {
            inner.docs.remove(&name);
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// The id the server assigned this connection, while connected.
    pub fn session_id(&self) -> Option<Uuid> {
        self.shared.lock().session_id
    }

    /// Why the connection stopped, if it failed.
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Open (creating if needed) the text document `name`.
    pub async fn open(&self, name: &str) -> Result<DocHandle, ClientError> {
        self.open_mirror(name, None).await
    }

    /// Reopen `name` from text the caller already holds at `version`. Only
    /// the ops after `version` are fetched.
    pub async fn open_at(&self, name: &str, snapshot: impl Into<String>, version: u64) -> Result<DocHandle, ClientError> {
        self.open_mirror(name, Some((snapshot.into(), version))).await
    }

    async fn open_mirror(&self, name: &str, known: Option<(String, u64)>) -> Result<DocHandle, ClientError> {
        let (ack, opened) = pending_ack();
        let (handle, events) = {
            if !self.shared.is_ok() {
                return Err(ClientError::Disconnected);
            }
            let mut inner = self.shared.lock();
            if inner.docs.contains_key(name) {
                return Err(ClientError::AlreadyOpen);
            }

            let (mut mirror, events) = DocMirror::new(name, self.shared.out.clone());
            if let Some((snapshot, version)) = known {
                mirror = mirror.with_snapshot(snapshot, version);
            }
            mirror.open(Some(ack))?;
            inner.next_handle += 1;
            let handle = inner.next_handle;
            inner.docs.insert(name.to_string(), OpenDoc { handle, mirror });
            (handle, events)
        };

        opened.await?;
        Ok(DocHandle {
            name: name.to_string(),
            handle,
            shared: Arc::clone(&self.shared),
            events: Some(events),
        })
    }

    /// Names of every document on the server.
    pub async fn list_docs(&self) -> Result<Vec<String>, ClientError> {
        let (tx, rx) = oneshot::channel();
        {
            if !self.shared.is_ok() {
                return Err(ClientError::Disconnected);
            }
            let mut inner = self.shared.lock();
            inner.listings.push_back(tx);
            let _ = self.shared.out.send(object(json!({ "docs": null })));
        }
        rx.await.unwrap_or(Err(ClientError::Disconnected))
    }

    /// Close every document and the connection.
    pub fn close(&mut self) {
        {
            let mut inner = self.shared.lock();
            for doc in inner.docs.values_mut() {
                doc.mirror.close();
            }
            inner.docs.clear();
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for CollabClient {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn object(value: Value) -> Message {
    match value {
        Value::Object(map) => map,
        _ => Message::new(),
    }
}

/// An open document.
///
/// Edits apply to the local text immediately; the returned [`PendingAck`]
/// resolves when the server has accepted them.
pub struct DocHandle {
    name: String,
    handle: u64,
    shared: Arc<ClientShared>,
    events: Option<mpsc::UnboundedReceiver<DocEvent>>,
}

impl DocHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<DocEvent>> {
        self.events.take()
    }

    fn with_mirror<T>(&self, f: impl FnOnce(&mut DocMirror) -> T) -> Option<T> {
        let mut inner = self.shared.lock();
        match inner.docs.get_mut(&self.name) {
            Some(doc) if doc.handle == self.handle => Some(f(&mut doc.mirror)),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.with_mirror(|m| m.state() == MirrorState::Open).unwrap_or(false)
    }

    /// Current local text, including unacknowledged edits.
    pub fn text(&self) -> Option<String> {
        self.with_mirror(|m| m.snapshot().map(str::to_string)).flatten()
    }

    /// Length of the local text in chars.
    pub fn len(&self) -> usize {
        self.text().map_or(0, |t| scribe_ot::text::char_len(&t))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last version acknowledged by the server.
    pub fn version(&self) -> Option<u64> {
        self.with_mirror(|m| m.version())
    }

    pub fn has_unacked_ops(&self) -> bool {
        self.with_mirror(|m| m.has_unacked_ops()).unwrap_or(false)
    }

    pub fn submit_op(&self, op: impl Into<RawOp>) -> Result<PendingAck, ClientError> {
        let op = op.into();
        let (ack, pending) = pending_ack();
        self.with_mirror(|m| m.submit_op(op, Some(ack)))
            .unwrap_or(Err(ClientError::NotOpen))?;
        Ok(pending)
    }

    pub fn insert(&self, position: usize, text: &str) -> Result<PendingAck, ClientError> {
        self.submit_op(Component::insert(position, text))
    }

    /// Delete `len` chars starting at `position`.
    pub fn delete(&self, position: usize, len: usize) -> Result<PendingAck, ClientError> {
        let text = self.text().ok_or(ClientError::NotOpen)?;
        let deleted: String = text.chars().skip(position).take(len).collect();
        if deleted.chars().count() != len {
            return Err(ClientError::InvalidOp(scribe_ot::OtError::OutOfBounds {
                position: position + len,
                len: scribe_ot::text::char_len(&text),
            }));
        }
        self.submit_op(Op::from(Component::delete(position, deleted)))
    }

    /// Stop following the document. Unacknowledged edits are dropped.
    pub fn close(&self) {
        let mut inner = self.shared.lock();
        if inner.docs.get(&self.name).is_some_and(|doc| doc.handle == self.handle) {
            if let Some(mut doc) = inner.docs.remove(&self.name) {
                doc.mirror.close();
            }
        }
    }
}

impl Drop for DocHandle {
    fn drop(&mut self) {
        self.close();
    }
}
