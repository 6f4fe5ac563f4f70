//! Client-side replica of one document.
//!
//! ```text
//!            submit_op                 flush                  ack
//! local ──► pending ─────────────► inflight ──────────► server ────► version += 1
//!   ▲          ▲                       │                     │
//!   │          └──── transform_x ◄─────┴──── remote op ◄─────┘
//!   └─ applied to the snapshot immediately
//! ```
//!
//! At most one op is in flight at a time. Local edits made while waiting
//! for the server are composed into a single pending op. Remote ops are
//! transformed against both so the local text always equals the server's
//! text with the local ops applied on top.
//!
//! [`DocMirror`] does no I/O: outgoing messages go to an unbounded channel
//! drained by the connection's writer, and events to the application's
//! channel.

use std::collections::BTreeMap;

use scribe_ot::{Component, Op, RawOp, apply, compose, invert, normalize, transform_x};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use crate::doc::TEXT_TYPE;
use crate::error::ClientError;
use crate::protocol::{Message, as_version};

/// Completion of an open or a submitted op: the document version reached.
pub type AckSender = oneshot::Sender<Result<u64, ClientError>>;

/// Server ops kept for inspection after they are applied.
const SERVER_OPS_WINDOW: usize = 100;

/// Mirror lifecycle: `Closed → Opening → Open → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    Closed,
    Opening,
    Open,
}

/// Events emitted by a document mirror.
#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent {
    /// The server accepted the open.
    Open { version: u64 },
    /// The document was closed, locally or by the server.
    Closed { reason: String },
    /// The text changed, by a local or a remote op.
    Change { op: Op },
    /// The text changed because of someone else's op, or a rollback.
    RemoteOp { op: Op },
    /// Text inserted by a remote op.
    Insert { position: usize, text: String },
    /// Text deleted by a remote op.
    Delete { position: usize, text: String },
    /// An ephemeral message from another client.
    Shout(Value),
    Error(ClientError),
}

pub struct DocMirror {
    name: String,
    doc_type: String,
    state: MirrorState,
    connected: bool,
    version: u64,
    snapshot: Option<String>,

    inflight: Option<Op>,
    inflight_acks: Vec<AckSender>,
    pending: Option<Op>,
    pending_acks: Vec<AckSender>,
    open_ack: Option<AckSender>,

    server_ops: BTreeMap<u64, Op>,

    out: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedSender<DocEvent>,
}

fn send_result(ack: AckSender, result: Result<u64, ClientError>) {
    let _ = ack.send(result);
}

impl DocMirror {
    /// A closed mirror with no local text. Returns the receiving end of its
    /// event channel.
    pub fn new(
        name: impl Into<String>,
        out: mpsc::UnboundedSender<Message>,
    ) -> (Self, mpsc::UnboundedReceiver<DocEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let mirror = Self {
            name: name.into(),
            doc_type: TEXT_TYPE.to_string(),
            state: MirrorState::Closed,
            connected: true,
            version: 0,
            snapshot: None,
            inflight: None,
            inflight_acks: Vec::new(),
            pending: None,
            pending_acks: Vec::new(),
            open_ack: None,
            server_ops: BTreeMap::new(),
            out,
            events,
        };
        (mirror, event_rx)
    }

    /// Seed the mirror with text known to be at `version`. Opening then only
    /// asks the server for the ops after it.
    pub fn with_snapshot(mut self, snapshot: impl Into<String>, version: u64) -> Self {
        self.snapshot = Some(snapshot.into());
        self.version = version;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> MirrorState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    pub fn inflight(&self) -> Option<&Op> {
        self.inflight.as_ref()
    }

    pub fn pending(&self) -> Option<&Op> {
        self.pending.as_ref()
    }

    /// Ops the server has applied, keyed by the version they were applied at.
    pub fn server_ops(&self) -> &BTreeMap<u64, Op> {
        &self.server_ops
    }

    /// Whether local ops are still waiting for the server.
    pub fn has_unacked_ops(&self) -> bool {
        self.inflight.is_some() || self.pending.is_some()
    }

    fn emit(&self, event: DocEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, msg: Value) {
        if let Value::Object(msg) = msg {
            let _ = self.out.send(msg);
        }
    }

    /// Track the connection. Losing it closes the mirror and fails every
    /// outstanding callback; regaining it sends any pending op.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        if connected {
            self.flush();
        } else if self.state != MirrorState::Closed {
            self.shut_down(ClientError::Disconnected, "disconnected");
        }
    }

    /// Ask the server to open the document, creating it if needed. `ack`
    /// resolves with the version once the server answers.
    pub fn open(&mut self, ack: Option<AckSender>) -> Result<(), ClientError> {
        if self.state != MirrorState::Closed {
            return Err(ClientError::AlreadyOpen);
        }
        if !self.connected {
            return Err(ClientError::Disconnected);
        }

        let mut msg = json!({
            "doc": self.name,
            "open": true,
            "create": true,
            "type": self.doc_type,
            "v": self.version,
        });
        if self.snapshot.is_none() {
            msg["snapshot"] = Value::Null;
        }
        self.send(msg);

        self.state = MirrorState::Opening;
        self.open_ack = ack;
        Ok(())
    }

    /// Apply `op` locally right away and queue it for the server.
    pub fn submit_op(&mut self, op: impl Into<RawOp>, ack: Option<AckSender>) -> Result<(), ClientError> {
        if self.state == MirrorState::Closed {
            return Err(ClientError::NotOpen);
        }
        let Some(snapshot) = &self.snapshot else {
            return Err(ClientError::NotOpen);
        };

        let op = normalize(op);
        self.snapshot = Some(apply(snapshot, &op)?);

        self.pending = Some(match self.pending.take() {
            Some(pending) => compose(&pending, &op),
            None => op.clone(),
        });
        self.pending_acks.extend(ack);

        self.emit(DocEvent::Change { op });
        self.flush();
        Ok(())
    }

    /// Send the pending op if nothing is in flight.
    pub fn flush(&mut self) {
        if !self.connected || self.state != MirrorState::Open || self.inflight.is_some() {
            return;
        }
        let Some(op) = self.pending.take() else {
            return;
        };

        self.send(json!({ "doc": self.name, "op": op, "v": self.version }));
        self.inflight = Some(op);
        self.inflight_acks = std::mem::take(&mut self.pending_acks);
    }

    /// The in-flight op was applied and the document is now at
    /// `new_version`.
    pub fn on_ack(&mut self, new_version: u64) -> Result<(), ClientError> {
        let Some(op) = self.inflight.take() else {
            return Err(ClientError::UnexpectedMessage(format!("ack for version {new_version} with no op in flight")));
        };
        if new_version != self.version + 1 {
            self.inflight = Some(op);
            return Err(ClientError::VersionMismatch {
                expected: self.version + 1,
                got: new_version,
            });
        }

        self.record_server_op(self.version, op);
        self.version = new_version;
        for ack in std::mem::take(&mut self.inflight_acks) {
            send_result(ack, Ok(new_version));
        }
        self.flush();
        Ok(())
    }

    /// The server refused the in-flight op. Its effect is rolled back and
    /// the pending op rebased onto the rolled-back text.
    pub fn on_reject(&mut self, error: &str) -> Result<(), ClientError> {
        let Some(op) = self.inflight.take() else {
            return Err(ClientError::UnexpectedMessage(format!("rejection with no op in flight: {error}")));
        };
        log::debug!("Op on {} rejected: {error}", self.name);

        let mut undo = invert(&op);
        if let Some(pending) = self.pending.take() {
            let (pending, rebased) = transform_x(&pending, &undo)?;
            self.pending = (!pending.is_empty()).then_some(pending);
            undo = rebased;
        }
        self.apply_remote(undo)?;

        for ack in std::mem::take(&mut self.inflight_acks) {
            send_result(ack, Err(ClientError::Server(error.to_string())));
        }
        self.flush();
        Ok(())
    }

    /// Someone else's op, applied by the server at `at_version`.
    pub fn on_remote_op(&mut self, op: Op, at_version: u64) -> Result<(), ClientError> {
        if at_version != self.version {
            return Err(ClientError::VersionMismatch {
                expected: self.version,
                got: at_version,
            });
        }
        self.record_server_op(at_version, op.clone());

        let mut op = op;
        if let Some(inflight) = self.inflight.take() {
            let (inflight, rebased) = transform_x(&inflight, &op)?;
            self.inflight = Some(inflight);
            op = rebased;
        }
        if let Some(pending) = self.pending.take() {
            let (pending, rebased) = transform_x(&pending, &op)?;
            self.pending = Some(pending);
            op = rebased;
        }

        self.version += 1;
        self.apply_remote(op)
    }

    /// Tell the server we are done and drop all local state, whatever it
    /// answers.
    pub fn close(&mut self) {
        if self.state == MirrorState::Closed {
            return;
        }
        if self.connected {
            self.send(json!({ "doc": self.name, "open": false }));
        }
        self.shut_down(ClientError::NotOpen, "closed by local client");
    }

    /// Route one server message addressed to this document. An error means
    /// the mirror no longer matches the server and has been closed.
    pub fn handle_message(&mut self, msg: &Message) -> Result<(), ClientError> {
        let result = self.dispatch(msg);
        if let Err(e) = &result {
            log::warn!("Document {} out of sync: {e}", self.name);
            self.emit(DocEvent::Error(e.clone()));
            if self.state != MirrorState::Closed {
                if self.connected {
                    self.send(json!({ "doc": self.name, "open": false }));
                }
                self.shut_down(e.clone(), "out of sync");
            }
        }
        result
    }

    fn dispatch(&mut self, msg: &Message) -> Result<(), ClientError> {
        if let Some(open) = msg.get("open") {
            return match open {
                Value::Bool(true) => self.on_open(msg),
                _ => {
                    let error = msg.get("error").and_then(Value::as_str);
                    self.on_closed(error);
                    Ok(())
                }
            };
        }

        match (msg.get("op"), msg.get("v")) {
            (Some(op), Some(v)) => {
                let raw: RawOp = serde_json::from_value(op.clone())
                    .map_err(|e| ClientError::UnexpectedMessage(format!("bad op: {e}")))?;
                let v = as_version(v)
                    .ok_or_else(|| ClientError::UnexpectedMessage(format!("bad version {v}")))?;
                self.on_remote_op(normalize(raw), v)
            }
            (None, Some(v)) => match msg.get("error").and_then(Value::as_str) {
                Some(error) => self.on_reject(error),
                None => {
                    let v = as_version(v)
                        .ok_or_else(|| ClientError::UnexpectedMessage(format!("bad version {v}")))?;
                    self.on_ack(v)
                }
            },
            (None, None) if msg.contains_key("meta") => {
                if let Some(meta) = msg.get("meta") {
                    self.emit(DocEvent::Shout(meta.clone()));
                }
                Ok(())
            }
            _ => {
                log::debug!("Unhandled message for {}: {msg:?}", self.name);
                Ok(())
            }
        }
    }

    fn on_open(&mut self, msg: &Message) -> Result<(), ClientError> {
        if self.state != MirrorState::Opening {
            return Err(ClientError::UnexpectedMessage("open reply while not opening".into()));
        }

        if let Some(snapshot) = msg.get("snapshot").and_then(Value::as_str) {
            self.snapshot = Some(snapshot.to_string());
        } else if self.snapshot.is_none() {
            // Freshly created on the server.
            self.snapshot = Some(String::new());
        }
        if let Some(v) = msg.get("v").and_then(as_version) {
            self.version = v;
        }

        self.state = MirrorState::Open;
        self.emit(DocEvent::Open { version: self.version });
        if let Some(ack) = self.open_ack.take() {
            send_result(ack, Ok(self.version));
        }
        self.flush();
        Ok(())
    }

    fn on_closed(&mut self, error: Option<&str>) {
        if self.state == MirrorState::Closed {
            return;
        }
        match error {
            Some(error) => {
                self.emit(DocEvent::Error(ClientError::Server(error.to_string())));
                self.shut_down(ClientError::Server(error.to_string()), "closed by remote server");
            }
            // Confirmation of an earlier close, overtaken by this open.
            None if self.state == MirrorState::Opening => {}
            None => self.shut_down(ClientError::NotOpen, "closed by remote server"),
        }
    }

    fn shut_down(&mut self, error: ClientError, reason: &str) {
        self.state = MirrorState::Closed;
        self.inflight = None;
        self.pending = None;
        let acks = self
            .open_ack
            .take()
            .into_iter()
            .chain(self.inflight_acks.drain(..))
            .chain(self.pending_acks.drain(..));
        for ack in acks {
            send_result(ack, Err(error.clone()));
        }
        self.emit(DocEvent::Closed { reason: reason.to_string() });
    }

    fn apply_remote(&mut self, op: Op) -> Result<(), ClientError> {
        let text = self.snapshot.as_deref().unwrap_or_default();
        self.snapshot = Some(apply(text, &op)?);

        for component in op.iter() {
            self.emit(match component {
                Component::Insert { position, text } => DocEvent::Insert {
                    position: *position,
                    text: text.clone(),
                },
                Component::Delete { position, text } => DocEvent::Delete {
                    position: *position,
                    text: text.clone(),
                },
            });
        }
        self.emit(DocEvent::Change { op: op.clone() });
        self.emit(DocEvent::RemoteOp { op });
        Ok(())
    }

    fn record_server_op(&mut self, v: u64, op: Op) {
        self.server_ops.insert(v, op);
        while self.server_ops.len() > SERVER_OPS_WINDOW {
            self.server_ops.pop_first();
        }
    }
}
