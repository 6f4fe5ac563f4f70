//! Document records shared by the model, storage backends and the wire.
//!
//! ```text
//! OpData      { op, v, meta: { source, ts, ... }, dupIfSource }
//! DocSnapshot { v, type, snapshot, meta }
//! ```
//!
//! `OpData::v` is the version the op was (or is to be) applied at: an op
//! stored with `v = 7` turns version 7 into version 8.

use std::time::SystemTime;

use scribe_ot::Op;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The only document type this server knows.
pub const TEXT_TYPE: &str = "text";

/// Document names match `[A-Za-z0-9._-]*`.
pub fn valid_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Side-channel data attached to an op.
///
/// `source` is the session id of the submitting agent and is what echo
/// suppression compares against. Anything else the client sent is kept in
/// `extra` and travels with the op untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OpMeta {
    /// Build from a client-supplied `meta` object. `source` and `ts` are
    /// owned by the server and discarded here.
    pub fn from_client(value: Option<Value>) -> Self {
        let mut extra = match value {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        extra.remove("source");
        extra.remove("ts");
        Self {
            source: None,
            ts: None,
            extra,
        }
    }

    /// `meta.path`, when present and an array.
    pub fn path(&self) -> Option<&Vec<Value>> {
        self.extra.get("path").and_then(Value::as_array)
    }

    /// Whether this meta op is an ephemeral broadcast.
    pub fn is_shout(&self) -> bool {
        self.path()
            .and_then(|p| p.first())
            .and_then(Value::as_str)
            == Some("shout")
    }
}

/// An op together with its version and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpData {
    pub op: Op,
    pub v: u64,
    #[serde(default)]
    pub meta: OpMeta,
    /// Reject the op if any op it is rebased over came from one of these
    /// sessions. Lets a reconnecting client resubmit without duplicating.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dup_if_source: Vec<String>,
}

impl OpData {
    pub fn new(op: Op, v: u64) -> Self {
        Self {
            op,
            v,
            meta: OpMeta::default(),
            dup_if_source: Vec::new(),
        }
    }
}

/// Full document state at a version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocSnapshot {
    pub v: u64,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub snapshot: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl DocSnapshot {
    pub fn empty(doc_type: impl Into<String>) -> Self {
        Self {
            v: 0,
            doc_type: doc_type.into(),
            snapshot: String::new(),
            meta: Map::new(),
        }
    }
}
