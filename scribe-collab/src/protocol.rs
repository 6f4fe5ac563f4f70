//! JSON message protocol and its stream framing.
//!
//! Wire format (framed transport):
//! ```text
//! ┌──────────────────────┬──────────────────────────┐
//! │ length               │ payload                  │
//! │ 10 ASCII digits,     │ one JSON object,         │
//! │ zero padded          │ `length` bytes           │
//! └──────────────────────┴──────────────────────────┘
//! ```
//!
//! Client → server fields: `doc`, `create`, `type`, `snapshot`, `open`,
//! `v`, `op`, `meta`, `dupIfSource`, and `docs` for directory listings.
//! `doc` may be omitted when it equals the previous message's `doc`; both
//! sides elide it on output with [`DocElision`].

use scribe_ot::{Op, RawOp, normalize};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::doc::{OpData, OpMeta};
use crate::error::ProtocolError;

/// One protocol message.
pub type Message = Map<String, Value>;

/// Width of the decimal length prefix.
pub const LENGTH_PREFIX: usize = 10;

/// Largest accepted payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ─── Framing ────────────────────────────────────────────────────────

/// Encode `msg` as one length-prefixed frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut frame = format!("{:0width$}", payload.len(), width = LENGTH_PREFIX).into_bytes();
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parse a frame payload. Anything but a JSON object is rejected.
pub fn decode_message(bytes: &[u8]) -> Result<Message, ProtocolError> {
    match serde_json::from_slice(bytes)? {
        Value::Object(msg) => Ok(msg),
        other => Err(ProtocolError::InvalidQuery(format!("expected an object, got {other}"))),
    }
}

/// Read one frame. `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>, ProtocolError> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::ConnectionClosed);
        }
        filled += n;
    }

    if !prefix.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::InvalidLength(String::from_utf8_lossy(&prefix).into_owned()));
    }
    let len = prefix
        .iter()
        .fold(0usize, |acc, d| acc.saturating_mul(10).saturating_add((d - b'0') as usize));
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode_message(&payload).map(Some)
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Drops `doc` from outgoing messages that repeat the previous one's.
#[derive(Debug, Default)]
pub struct DocElision {
    last: Option<String>,
}

impl DocElision {
    pub fn apply(&mut self, msg: &mut Message) {
        let Some(Value::String(doc)) = msg.get("doc") else {
            return;
        };
        if self.last.as_deref() == Some(doc.as_str()) {
            msg.remove("doc");
        } else {
            self.last = Some(doc.clone());
        }
    }
}

// ─── Queries ────────────────────────────────────────────────────────

/// Which handler a document query goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `open: false`
    Close,
    /// Any of `open`, `create`, `snapshot: null`
    OpenCreateSnapshot,
    /// `op` (with `v`)
    Op,
    /// `meta.path` without `op`
    Meta,
}

/// A validated request about one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub doc: String,
    pub route: Route,
    pub create: bool,
    pub open: Option<bool>,
    /// `snapshot: null` was sent.
    pub snapshot: bool,
    pub doc_type: Option<String>,
    pub v: Option<u64>,
    pub op: Option<Op>,
    pub meta: Option<Value>,
    pub dup_if_source: Vec<String>,
}

impl Query {
    /// Op payload for the model, if this is an op query with a version.
    pub fn op_data(&self) -> Option<OpData> {
        let (op, v) = (self.op.clone()?, self.v?);
        let mut data = OpData::new(op, v);
        data.meta = OpMeta::from_client(self.meta.clone());
        data.dup_if_source = self.dup_if_source.clone();
        Some(data)
    }
}

/// Any inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Doc(Query),
    /// `{docs: null}`
    ListDocs,
}

/// Validates inbound messages and fills in an omitted `doc` from the
/// previous message on the connection.
#[derive(Debug, Default)]
pub struct QueryParser {
    last_doc: Option<String>,
}

/// A version number. JSON peers may send whole numbers as floats (`3.0`).
pub fn as_version(v: &Value) -> Option<u64> {
    if let Some(v) = v.as_u64() {
        return Some(v);
    }
    let f = v.as_f64()?;
    (f >= 0.0 && f.fract() == 0.0 && f < u64::MAX as f64).then_some(f as u64)
}

fn invalid(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidQuery(reason.into())
}

impl QueryParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_doc(&self) -> Option<&str> {
        self.last_doc.as_deref()
    }

    /// Validate `msg`. Any error is a protocol violation that ends the
    /// connection.
    pub fn parse(&mut self, mut msg: Message) -> Result<Request, ProtocolError> {
        if msg.contains_key("docs") && !msg.contains_key("doc") {
            return Ok(Request::ListDocs);
        }

        let doc = match msg.remove("doc") {
            Some(Value::String(doc)) => Some(doc),
            Some(Value::Null) => None,
            Some(_) => return Err(invalid("Invalid docName")),
            None if self.last_doc.is_some() => self.last_doc.clone(),
            None => return Err(invalid("msg.doc missing")),
        };

        let create = match msg.remove("create") {
            None => false,
            Some(Value::Bool(true)) => true,
            Some(_) => return Err(invalid("'create' must be true or missing")),
        };
        let open = match msg.remove("open") {
            None => None,
            Some(Value::Bool(open)) => Some(open),
            Some(_) => return Err(invalid("'open' must be true, false or missing")),
        };
        let snapshot = match msg.remove("snapshot") {
            None => false,
            Some(Value::Null) => true,
            Some(_) => return Err(invalid("'snapshot' must be null or missing")),
        };
        let doc_type = match msg.remove("type") {
            None => None,
            Some(Value::String(t)) => Some(t),
            Some(_) => return Err(invalid("'type' invalid")),
        };
        let v = match msg.remove("v") {
            None => None,
            Some(v) => Some(as_version(&v).ok_or_else(|| invalid("'v' invalid"))?),
        };
        let op = match msg.remove("op") {
            None => None,
            Some(raw) => {
                let raw: RawOp = serde_json::from_value(raw).map_err(|e| invalid(format!("'op' invalid: {e}")))?;
                Some(normalize(raw))
            }
        };
        let dup_if_source = match msg.remove("dupIfSource") {
            None | Some(Value::Null) => Vec::new(),
            Some(list) => serde_json::from_value(list).map_err(|_| invalid("'dupIfSource' invalid"))?,
        };
        let meta = msg.remove("meta");

        let has_path = meta.as_ref().is_some_and(|m| m.get("path").is_some());
        let route = if open == Some(false) {
            Route::Close
        } else if open.is_some() || snapshot || create {
            Route::OpenCreateSnapshot
        } else if op.is_some() {
            Route::Op
        } else if has_path {
            Route::Meta
        } else {
            return Err(invalid("no action in query"));
        };

        let doc = doc.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        self.last_doc = Some(doc.clone());

        Ok(Request::Doc(Query {
            doc,
            route,
            create,
            open,
            snapshot,
            doc_type,
            v,
            op,
            meta,
            dup_if_source,
        }))
    }
}

// ─── Server messages ────────────────────────────────────────────────

fn object(value: Value) -> Message {
    match value {
        Value::Object(map) => map,
        _ => Message::new(),
    }
}

pub fn auth_ok(session_id: Uuid) -> Message {
    object(json!({ "auth": session_id.to_string() }))
}

pub fn auth_error(error: &str) -> Message {
    object(json!({ "auth": null, "error": error }))
}

pub fn op_ack(doc: &str, v: u64) -> Message {
    object(json!({ "doc": doc, "v": v }))
}

pub fn op_error(doc: &str, error: &str) -> Message {
    object(json!({ "doc": doc, "v": null, "error": error }))
}

pub fn closed(doc: &str, error: Option<&str>) -> Message {
    let mut msg = object(json!({ "doc": doc, "open": false }));
    if let Some(error) = error {
        msg.insert("error".into(), error.into());
    }
    msg
}

/// Broadcast of an op applied at `data.v`.
pub fn remote_op(doc: &str, data: &OpData) -> Message {
    object(json!({
        "doc": doc,
        "op": data.op,
        "v": data.v,
        "meta": data.meta,
    }))
}

pub fn shout(doc: &str, meta: &OpMeta) -> Message {
    object(json!({ "doc": doc, "meta": meta }))
}

pub fn doc_list(docs: &[String]) -> Message {
    object(json!({ "docs": docs }))
}

pub fn doc_list_error(error: &str) -> Message {
    object(json!({ "docs": null, "error": error }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_ot::Component;

    fn msg(value: Value) -> Message {
        object(value)
    }

    fn query(parser: &mut QueryParser, value: Value) -> Query {
        match parser.parse(msg(value)).unwrap() {
            Request::Doc(q) => q,
            other => panic!("expected a document query, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let original = msg(json!({"doc": "a", "v": 1}));
        let frame = encode_frame(&original).unwrap();
        assert!(frame.starts_with(b"0000000017"));

        let mut reader = &frame[..];
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(original));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_multibyte_length() {
        let original = msg(json!({"op": [{"p": 0, "i": "é"}]}));
        let frame = encode_frame(&original).unwrap();
        let len: usize = std::str::from_utf8(&frame[..LENGTH_PREFIX]).unwrap().parse().unwrap();
        assert_eq!(len, frame.len() - LENGTH_PREFIX);
    }

    #[tokio::test]
    async fn test_bad_frames() {
        let mut reader = &b"00000000x5{}"[..];
        assert!(matches!(read_frame(&mut reader).await, Err(ProtocolError::InvalidLength(_))));

        let mut reader = &b"9999999999"[..];
        assert!(matches!(read_frame(&mut reader).await, Err(ProtocolError::FrameTooLarge(_))));

        let mut reader = &b"00000"[..];
        assert!(matches!(read_frame(&mut reader).await, Err(ProtocolError::ConnectionClosed)));

        let mut reader = &b"0000000002[]"[..];
        assert!(matches!(read_frame(&mut reader).await, Err(ProtocolError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn test_write_frame() {
        let mut out = Vec::new();
        write_frame(&mut out, &msg(json!({"auth": "x"}))).await.unwrap();
        assert_eq!(out, b"0000000012{\"auth\":\"x\"}");
    }

    #[test]
    fn test_doc_elision() {
        let mut elision = DocElision::default();
        let mut first = op_ack("a", 1);
        let mut second = op_ack("a", 2);
        let mut third = op_ack("b", 1);
        let mut auth = auth_ok(Uuid::nil());
        elision.apply(&mut first);
        elision.apply(&mut auth);
        elision.apply(&mut second);
        elision.apply(&mut third);

        assert_eq!(first.get("doc"), Some(&json!("a")));
        assert_eq!(second.get("doc"), None);
        assert_eq!(third.get("doc"), Some(&json!("b")));
    }

    #[test]
    fn test_routes() {
        let mut parser = QueryParser::new();
        assert_eq!(query(&mut parser, json!({"doc": "a", "open": false})).route, Route::Close);
        assert_eq!(query(&mut parser, json!({"doc": "a", "open": true})).route, Route::OpenCreateSnapshot);
        assert_eq!(query(&mut parser, json!({"doc": "a", "snapshot": null})).route, Route::OpenCreateSnapshot);
        assert_eq!(
            query(&mut parser, json!({"doc": "a", "create": true, "type": "text"})).route,
            Route::OpenCreateSnapshot
        );
        assert_eq!(
            query(&mut parser, json!({"doc": "a", "v": 0, "op": [{"p": 0, "i": "x"}]})).route,
            Route::Op
        );
        assert_eq!(
            query(&mut parser, json!({"doc": "a", "meta": {"path": ["shout"]}})).route,
            Route::Meta
        );
        assert!(parser.parse(msg(json!({"doc": "a"}))).is_err());
    }

    #[test]
    fn test_doc_inference() {
        let mut parser = QueryParser::new();
        assert!(parser.parse(msg(json!({"open": true}))).is_err());

        query(&mut parser, json!({"doc": "a", "open": true}));
        assert_eq!(query(&mut parser, json!({"open": false})).doc, "a");

        let fresh = query(&mut parser, json!({"doc": null, "create": true, "type": "text"}));
        assert_eq!(fresh.doc.len(), 32);
        assert_eq!(parser.last_doc(), Some(fresh.doc.as_str()));
    }

    #[test]
    fn test_invalid_shapes() {
        let mut parser = QueryParser::new();
        for bad in [
            json!({"doc": 5, "open": true}),
            json!({"doc": "a", "open": "yes"}),
            json!({"doc": "a", "create": false}),
            json!({"doc": "a", "snapshot": "text"}),
            json!({"doc": "a", "create": true, "type": 1}),
            json!({"doc": "a", "v": -1, "op": []}),
            json!({"doc": "a", "v": "1", "op": []}),
            json!({"doc": "a", "v": 2.5, "op": []}),
            json!({"doc": "a", "v": -1.0, "op": []}),
            json!({"doc": "a", "v": 0, "op": [{"p": 0}]}),
        ] {
            assert!(
                matches!(parser.parse(msg(bad.clone())), Err(ProtocolError::InvalidQuery(_))),
                "accepted {bad}"
            );
        }
        // Nothing was remembered from rejected queries.
        assert_eq!(parser.last_doc(), None);
    }

    #[test]
    fn test_op_query() {
        let mut parser = QueryParser::new();
        let q = query(
            &mut parser,
            json!({
                "doc": "a",
                "v": 3,
                "op": {"i": "hi"},
                "meta": {"source": "spoofed", "cursor": 1},
                "dupIfSource": ["s0"],
            }),
        );
        let data = q.op_data().unwrap();
        assert_eq!(data.v, 3);
        assert_eq!(data.op, Op::from(Component::insert(0, "hi")));
        assert_eq!(data.meta.source, None);
        assert_eq!(data.meta.extra.get("cursor"), Some(&json!(1)));
        assert_eq!(data.dup_if_source, vec!["s0".to_string()]);

        let q = query(&mut parser, json!({"op": []}));
        assert!(q.op_data().is_none());

        let q = query(&mut parser, json!({"v": 3.0, "op": {"p": 1, "d": "x"}}));
        assert_eq!(q.op_data().unwrap().v, 3);
    }

    #[test]
    fn test_list_docs() {
        let mut parser = QueryParser::new();
        assert_eq!(parser.parse(msg(json!({"docs": null}))).unwrap(), Request::ListDocs);
    }

    #[test]
    fn test_server_messages() {
        let data = OpData::new(Op::from(Component::insert(1, "x")), 4);
        assert_eq!(
            Value::Object(remote_op("a", &data)),
            json!({"doc": "a", "op": [{"p": 1, "i": "x"}], "v": 4, "meta": {}})
        );
        assert_eq!(Value::Object(op_error("a", "Op too old")), json!({"doc": "a", "v": null, "error": "Op too old"}));
        assert_eq!(Value::Object(closed("a", None)), json!({"doc": "a", "open": false}));
        assert_eq!(Value::Object(doc_list(&["a".into()])), json!({"docs": ["a"]}));
    }
}
