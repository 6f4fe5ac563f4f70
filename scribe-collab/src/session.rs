//! Per-connection protocol handler.
//!
//! ```text
//! inbound ──► QueryParser ──► queue[doc A] ──► worker A ─┐
//!  (validate,                 queue[doc B] ──► worker B ─┼──► out channel ──► writer
//!   infer doc)                                           │
//!                 model listeners (SessionListener) ─────┘
//! ```
//!
//! Each document a connection touches gets its own queue and worker, so a
//! slow request on one document never delays another, while requests for
//! the same document are answered strictly in order. Everything the
//! connection sends goes through one unbounded channel; its order is the
//! wire order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::agent::{Agent, Authorizer};
use crate::broadcast::{DocUpdate, Listener};
use crate::doc::{DocSnapshot, OpMeta};
use crate::error::{ModelError, ProtocolError};
use crate::model::Model;
use crate::protocol::{self, Message, Query, QueryParser, Request, Route};

/// Forwards a document's updates to one connection.
///
/// Updates are held back until [`SessionListener::release`], so the open
/// response reaches the client before any op replayed by `listen`.
struct SessionListener {
    doc: String,
    source: String,
    out: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
    held: Mutex<Option<Vec<Message>>>,
}

impl SessionListener {
    fn new(doc: &str, ctx: &SessionContext) -> Self {
        Self {
            doc: doc.to_string(),
            source: ctx.agent.session_id().to_string(),
            out: ctx.out.clone(),
            closed: Arc::clone(&ctx.closed),
            held: Mutex::new(Some(Vec::new())),
        }
    }

    fn release(&self) {
        let Ok(mut held) = self.held.lock() else {
            return;
        };
        for msg in held.take().unwrap_or_default() {
            let _ = self.out.send(msg);
        }
    }
}

impl Listener for SessionListener {
    fn deliver(&self, update: &DocUpdate) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let msg = match update {
            DocUpdate::Op { data, .. } => {
                if data.meta.source.as_deref() == Some(self.source.as_str()) {
                    return true;
                }
                protocol::remote_op(&self.doc, data)
            }
            DocUpdate::Meta(meta) => {
                if meta.source.as_deref() == Some(self.source.as_str()) {
                    return true;
                }
                protocol::shout(&self.doc, meta)
            }
        };

        let Ok(mut held) = self.held.lock() else {
            return false;
        };
        match held.as_mut() {
            Some(buffer) => {
                buffer.push(msg);
                true
            }
            None => self.out.send(msg).is_ok(),
        }
    }
}

struct SessionContext {
    agent: Agent,
    out: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
}

/// One connection's protocol state.
pub struct Session {
    ctx: Arc<SessionContext>,
    parser: QueryParser,
    queues: HashMap<String, mpsc::UnboundedSender<Query>>,
    workers: Vec<JoinHandle<()>>,
}

impl Session {
    /// Authorize the connection and greet it with `{auth}`. On rejection
    /// `{auth: null, error}` is queued on `out` and the error returned; the
    /// caller should flush `out` and hang up.
    pub fn connect(
        model: Model,
        auth: Arc<dyn Authorizer>,
        remote_addr: Option<SocketAddr>,
        out: mpsc::UnboundedSender<Message>,
    ) -> Result<Self, ModelError> {
        let agent = match Agent::connect(model, auth, remote_addr) {
            Ok(agent) => agent,
            Err(e) => {
                let _ = out.send(protocol::auth_error(&e.to_string()));
                return Err(e);
            }
        };
        let _ = out.send(protocol::auth_ok(agent.session_id()));
        log::info!("Session {} connected from {remote_addr:?}", agent.session_id());

        Ok(Self {
            ctx: Arc::new(SessionContext {
                agent,
                out,
                closed: Arc::new(AtomicBool::new(false)),
            }),
            parser: QueryParser::new(),
            queues: HashMap::new(),
            workers: Vec::new(),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.ctx.agent.session_id()
    }

    /// Validate and dispatch one inbound message. An error is a protocol
    /// violation: nothing was dispatched and the connection must be dropped.
    pub fn handle_message(&mut self, msg: Message) -> Result<(), ProtocolError> {
        if self.ctx.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::ConnectionClosed);
        }

        match self.parser.parse(msg)? {
            Request::ListDocs => {
                let ctx = Arc::clone(&self.ctx);
                tokio::spawn(async move {
                    let reply = match ctx.agent.list().await {
                        Ok(docs) => protocol::doc_list(&docs),
                        Err(e) => protocol::doc_list_error(&e.to_string()),
                    };
                    let _ = ctx.out.send(reply);
                });
            }
            Request::Doc(query) => {
                let queue = match self.queues.get(&query.doc) {
                    Some(queue) => queue.clone(),
                    None => {
                        let (queue, rx) = mpsc::unbounded_channel();
                        self.workers
                            .push(tokio::spawn(run_doc_queue(Arc::clone(&self.ctx), rx)));
                        self.queues.insert(query.doc.clone(), queue.clone());
                        queue
                    }
                };
                // The worker only exits once the session is closed.
                let _ = queue.send(query);
            }
        }
        Ok(())
    }

    /// Tear down: stop processing queued requests and unregister every
    /// listener.
    pub async fn close(mut self) {
        self.ctx.closed.store(true, Ordering::Release);
        self.queues.clear();
        self.ctx.agent.disconnect().await;
        for worker in self.workers.drain(..) {
            worker.abort();
        }
        log::info!("Session {} closed", self.ctx.agent.session_id());
    }
}

async fn run_doc_queue(ctx: Arc<SessionContext>, mut rx: mpsc::UnboundedReceiver<Query>) {
    while let Some(query) = rx.recv().await {
        if ctx.closed.load(Ordering::Acquire) {
            break;
        }
        match query.route {
            Route::Close => ctx.handle_close(&query).await,
            Route::OpenCreateSnapshot => ctx.handle_open_create_snapshot(&query).await,
            Route::Op => ctx.handle_op(&query).await,
            Route::Meta => ctx.handle_meta(&query).await,
        }
    }
}

impl SessionContext {
    fn send(&self, msg: Message) {
        let _ = self.out.send(msg);
    }

    async fn handle_close(&self, query: &Query) {
        let reply = match self.agent.remove_listener(&query.doc).await {
            Ok(()) => protocol::closed(&query.doc, None),
            Err(e) => protocol::closed(&query.doc, Some(&e.to_string())),
        };
        self.send(reply);
    }

    async fn handle_op(&self, query: &Query) {
        let Some(data) = query.op_data() else {
            self.send(protocol::op_error(&query.doc, &ModelError::VersionMissing.to_string()));
            return;
        };
        // The ack is queued by the document worker, between the broadcasts
        // of the ops around this one.
        let out = self.out.clone();
        let doc = query.doc.clone();
        let ack = move |v| {
            let _ = out.send(protocol::op_ack(&doc, v));
        };
        if let Err(e) = self.agent.submit_op(&query.doc, data, ack).await {
            self.send(protocol::op_error(&query.doc, &e.to_string()));
        }
    }

    /// Shouts get no reply.
    async fn handle_meta(&self, query: &Query) {
        let meta = OpMeta::from_client(query.meta.clone());
        if let Err(e) = self.agent.submit_meta(&query.doc, meta).await {
            log::debug!("Meta op on {} failed: {e}", query.doc);
        }
    }

    /// Create, then fetch the snapshot, then open; whichever of those the
    /// query asks for. On failure the reply echoes `open: false` and
    /// `snapshot: null` for what was requested.
    async fn handle_open_create_snapshot(&self, query: &Query) {
        let mut msg = Map::new();
        msg.insert("doc".into(), Value::from(query.doc.clone()));

        let mut opened = None;
        if let Err(error) = self.open_create_snapshot(query, &mut msg, &mut opened).await {
            if query.open == Some(true) {
                msg.insert("open".into(), Value::Bool(false));
            }
            if query.snapshot {
                msg.insert("snapshot".into(), Value::Null);
            }
            msg.remove("create");
            msg.insert("error".into(), Value::from(error));
        }

        self.send(msg);
        if let Some(listener) = opened {
            listener.release();
        }
    }

    async fn open_create_snapshot(
        &self,
        query: &Query,
        msg: &mut Message,
        opened: &mut Option<Arc<SessionListener>>,
    ) -> Result<(), String> {
        let name = query.doc.as_str();

        if query.create && query.doc_type.is_none() {
            return Err("create:true requires type specified".into());
        }
        let meta = match &query.meta {
            None => Map::new(),
            Some(Value::Object(meta)) => meta.clone(),
            Some(_) => return Err("meta must be a dict".into()),
        };

        let mut data: Option<DocSnapshot> = None;
        if query.snapshot || query.open == Some(true) {
            match self.agent.get_snapshot(name).await {
                Ok(snapshot) => data = Some(snapshot),
                Err(ModelError::DoesNotExist) => {}
                Err(e) => return Err(e.to_string()),
            }
        }

        // Step 1: create.
        let mut created = false;
        if query.create {
            if data.is_some() {
                msg.insert("create".into(), Value::Bool(false));
            } else {
                let doc_type = query.doc_type.as_deref().unwrap_or_default();
                match self.agent.create(name, doc_type, meta).await {
                    Ok(()) => {
                        created = true;
                        msg.insert("create".into(), Value::Bool(true));
                    }
                    Err(ModelError::AlreadyExists) => {
                        data = Some(self.agent.get_snapshot(name).await.map_err(|e| e.to_string())?);
                        msg.insert("create".into(), Value::Bool(false));
                    }
                    Err(e) => return Err(e.to_string()),
                }
            }
        }

        // Step 2: snapshot. Listening starts where the snapshot ends.
        let mut from_version = query.v;
        if created {
            from_version = Some(0);
        } else if query.snapshot {
            let Some(data) = &data else {
                return Err(ModelError::DoesNotExist.to_string());
            };
            msg.insert("v".into(), Value::from(data.v));
            if query.doc_type.as_deref() != Some(data.doc_type.as_str()) {
                msg.insert("type".into(), Value::from(data.doc_type.clone()));
            }
            msg.insert("snapshot".into(), Value::from(data.snapshot.clone()));
            from_version = Some(data.v);
        }

        // Step 3: open.
        if query.open != Some(true) {
            return Ok(());
        }
        if let (Some(doc_type), Some(data)) = (&query.doc_type, &data) {
            if *doc_type != data.doc_type {
                return Err(ModelError::TypeMismatch.to_string());
            }
        }

        let listener = Arc::new(SessionListener::new(name, self));
        let v = self
            .agent
            .listen(name, from_version, Arc::clone(&listener) as Arc<dyn Listener>)
            .await
            .map_err(|e| e.to_string())?;
        if self.closed.load(Ordering::Acquire) {
            let _ = self.agent.remove_listener(name).await;
            return Err(ModelError::SessionClosed.to_string());
        }

        msg.insert("open".into(), Value::Bool(true));
        msg.insert("v".into(), Value::from(v));
        *opened = Some(listener);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::DefaultAuthorizer;
    use crate::client::DocMirror;
    use crate::config::ModelOptions;
    use scribe_ot::{Component, Op};
    use serde_json::json;

    fn msg(value: Value) -> Message {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    struct Conn {
        session: Session,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl Conn {
        async fn new(model: &Model) -> Self {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let session = Session::connect(model.clone(), Arc::new(DefaultAuthorizer), None, tx).unwrap();
            let auth = rx.recv().await.unwrap();
            assert_eq!(auth.get("auth"), Some(&json!(session.session_id().to_string())));
            Self { session, rx }
        }

        fn send(&mut self, value: Value) {
            self.session.handle_message(msg(value)).unwrap();
        }

        async fn recv(&mut self) -> Value {
            Value::Object(self.rx.recv().await.unwrap())
        }
    }

    async fn text_doc(model: &Model, name: &str, text: &str) {
        model
            .create(name, "text", Some(text.to_string()), Map::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_and_open() {
        let model = Model::new(ModelOptions::default());
        let mut conn = Conn::new(&model).await;

        conn.send(json!({"doc": "a", "open": true, "create": true, "type": "text", "snapshot": null}));
        assert_eq!(
            conn.recv().await,
            json!({"doc": "a", "open": true, "create": true, "v": 0})
        );
    }

    #[tokio::test]
    async fn test_open_existing_returns_snapshot() {
        let model = Model::new(ModelOptions::default());
        text_doc(&model, "a", "hello").await;
        let mut conn = Conn::new(&model).await;

        conn.send(json!({"doc": "a", "open": true, "create": true, "type": "text", "snapshot": null}));
        assert_eq!(
            conn.recv().await,
            json!({"doc": "a", "open": true, "create": false, "v": 0, "snapshot": "hello"})
        );
    }

    #[tokio::test]
    async fn test_snapshot_type_echoed_when_different() {
        let model = Model::new(ModelOptions::default());
        text_doc(&model, "a", "hi").await;
        let mut conn = Conn::new(&model).await;

        conn.send(json!({"doc": "a", "snapshot": null}));
        assert_eq!(
            conn.recv().await,
            json!({"doc": "a", "v": 0, "type": "text", "snapshot": "hi"})
        );
    }

    #[tokio::test]
    async fn test_open_missing_document() {
        let model = Model::new(ModelOptions::default());
        let mut conn = Conn::new(&model).await;

        conn.send(json!({"doc": "a", "open": true, "snapshot": null}));
        assert_eq!(
            conn.recv().await,
            json!({"doc": "a", "open": false, "snapshot": null, "error": "Document does not exist"})
        );
    }

    #[tokio::test]
    async fn test_open_errors() {
        let model = Model::new(ModelOptions::default());
        text_doc(&model, "a", "").await;
        let mut conn = Conn::new(&model).await;

        conn.send(json!({"doc": "a", "open": true, "type": "json"}));
        assert_eq!(
            conn.recv().await,
            json!({"doc": "a", "open": false, "error": "Type mismatch"})
        );

        conn.send(json!({"doc": "b", "create": true}));
        assert_eq!(
            conn.recv().await,
            json!({"doc": "b", "error": "create:true requires type specified"})
        );

        conn.send(json!({"doc": "c", "create": true, "type": "text", "meta": 3}));
        assert_eq!(conn.recv().await, json!({"doc": "c", "error": "meta must be a dict"}));

        conn.send(json!({"doc": "a", "open": true}));
        assert_eq!(conn.recv().await["open"], json!(true));
        conn.send(json!({"doc": "a", "open": true}));
        assert_eq!(
            conn.recv().await,
            json!({"doc": "a", "open": false, "error": "Document already open"})
        );
    }

    #[tokio::test]
    async fn test_close() {
        let model = Model::new(ModelOptions::default());
        text_doc(&model, "a", "").await;
        let mut conn = Conn::new(&model).await;

        conn.send(json!({"doc": "a", "open": false}));
        assert_eq!(
            conn.recv().await,
            json!({"doc": "a", "open": false, "error": "Doc is not open"})
        );

        conn.send(json!({"doc": "a", "open": true}));
        conn.recv().await;
        conn.send(json!({"open": false}));
        assert_eq!(conn.recv().await, json!({"doc": "a", "open": false}));
    }

    #[tokio::test]
    async fn test_ops_and_echo_suppression() {
        let model = Model::new(ModelOptions::default());
        text_doc(&model, "a", "hello").await;
        let mut alice = Conn::new(&model).await;
        let mut bob = Conn::new(&model).await;

        for conn in [&mut alice, &mut bob] {
            conn.send(json!({"doc": "a", "open": true, "v": 0}));
            assert_eq!(conn.recv().await, json!({"doc": "a", "open": true, "v": 0}));
        }

        alice.send(json!({"doc": "a", "v": 0, "op": [{"p": 0, "i": "X"}]}));
        assert_eq!(alice.recv().await, json!({"doc": "a", "v": 1}));

        let remote = bob.recv().await;
        assert_eq!(remote["op"], json!([{"p": 0, "i": "X"}]));
        assert_eq!(remote["v"], json!(0));
        assert_eq!(remote["meta"]["source"], json!(alice.session.session_id().to_string()));

        bob.send(json!({"doc": "a", "v": 0, "op": [{"p": 5, "i": "!"}]}));
        assert_eq!(bob.recv().await, json!({"doc": "a", "v": 2}));
        assert_eq!(alice.recv().await["op"], json!([{"p": 6, "i": "!"}]));

        assert_eq!(model.get_snapshot("a").await.unwrap().snapshot, "Xhello!");
        // Nothing else queued for either side.
        assert!(alice.rx.try_recv().is_err());
        assert!(bob.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_ops_reach_mirror_in_version_order() {
        let model = Model::new(ModelOptions::default());
        let mut alice = Conn::new(&model).await;
        let mut bob = Conn::new(&model).await;

        for round in 0..10 {
            let name = format!("doc{round}");
            text_doc(&model, &name, "hello").await;
            for conn in [&mut alice, &mut bob] {
                conn.send(json!({"doc": name, "open": true, "v": 0}));
                assert_eq!(conn.recv().await["open"], json!(true));
            }

            let (out, mut sent) = mpsc::unbounded_channel();
            let (mirror, _events) = DocMirror::new(&name, out);
            let mut mirror = mirror.with_snapshot("hello", 0);
            mirror.open(None).unwrap();
            mirror.handle_message(&msg(json!({"doc": name, "open": true, "v": 0}))).unwrap();
            sent.try_recv().unwrap();

            mirror.submit_op(Component::insert(0, "A"), None).unwrap();
            alice.session.handle_message(sent.try_recv().unwrap()).unwrap();
            bob.send(json!({"doc": name, "v": 0, "op": [{"p": 5, "i": "B"}]}));

            // Ack and remote op, in whichever order the server applied them.
            for _ in 0..2 {
                let reply = alice.rx.recv().await.unwrap();
                mirror.handle_message(&reply).unwrap();
            }
            for _ in 0..2 {
                bob.recv().await;
            }

            assert_eq!(mirror.version(), 2);
            assert!(!mirror.has_unacked_ops());
            assert_eq!(mirror.snapshot(), Some("AhelloB"));
            assert_eq!(model.get_snapshot(&name).await.unwrap().snapshot, "AhelloB");
        }
    }

    #[tokio::test]
    async fn test_op_errors() {
        let model = Model::new(ModelOptions::default());
        text_doc(&model, "a", "").await;
        let mut conn = Conn::new(&model).await;

        conn.send(json!({"doc": "a", "op": [{"p": 0, "i": "x"}]}));
        assert_eq!(
            conn.recv().await,
            json!({"doc": "a", "v": null, "error": "Version missing"})
        );

        conn.send(json!({"doc": "a", "v": 4, "op": [{"p": 0, "i": "x"}]}));
        assert_eq!(
            conn.recv().await,
            json!({"doc": "a", "v": null, "error": "Op at future version"})
        );

        conn.send(json!({"doc": "missing", "v": 0, "op": [{"p": 0, "i": "x"}]}));
        assert_eq!(
            conn.recv().await,
            json!({"doc": "missing", "v": null, "error": "Document does not exist"})
        );
    }

    #[tokio::test]
    async fn test_open_replays_after_response() {
        let model = Model::new(ModelOptions::default());
        text_doc(&model, "a", "").await;
        for v in 0..2 {
            let data = crate::doc::OpData::new(Op::from(Component::insert(0, "z")), v);
            model.apply_op("a", data).await.unwrap();
        }
        let mut conn = Conn::new(&model).await;

        conn.send(json!({"doc": "a", "open": true, "v": 0}));
        assert_eq!(conn.recv().await, json!({"doc": "a", "open": true, "v": 0}));
        assert_eq!(conn.recv().await["v"], json!(0));
        assert_eq!(conn.recv().await["v"], json!(1));
    }

    #[tokio::test]
    async fn test_shout_reaches_other_listeners() {
        let model = Model::new(ModelOptions::default());
        text_doc(&model, "a", "").await;
        let mut alice = Conn::new(&model).await;
        let mut bob = Conn::new(&model).await;
        for conn in [&mut alice, &mut bob] {
            conn.send(json!({"doc": "a", "open": true}));
            conn.recv().await;
        }

        alice.send(json!({"doc": "a", "meta": {"path": ["shout"], "value": "hi"}}));
        let shout = bob.recv().await;
        assert_eq!(shout["doc"], json!("a"));
        assert_eq!(shout["meta"]["value"], json!("hi"));

        tokio::task::yield_now().await;
        assert!(alice.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_list_docs() {
        let model = Model::new(ModelOptions::default());
        text_doc(&model, "b", "").await;
        text_doc(&model, "a", "").await;
        let mut conn = Conn::new(&model).await;

        conn.send(json!({"docs": null}));
        assert_eq!(conn.recv().await, json!({"docs": ["a", "b"]}));
    }

    #[tokio::test]
    async fn test_invalid_query_is_fatal() {
        let model = Model::new(ModelOptions::default());
        let mut conn = Conn::new(&model).await;

        let result = conn.session.handle_message(msg(json!({"doc": "a", "open": "yes"})));
        assert!(matches!(result, Err(ProtocolError::InvalidQuery(_))));
        tokio::task::yield_now().await;
        assert!(conn.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_removes_listeners() {
        let model = Model::new(ModelOptions::default());
        text_doc(&model, "a", "").await;
        let mut conn = Conn::new(&model).await;
        conn.send(json!({"doc": "a", "open": true}));
        conn.recv().await;
        assert_eq!(model.broadcast_stats("a").await.unwrap().active_listeners, 1);

        conn.session.close().await;
        assert_eq!(model.broadcast_stats("a").await.unwrap().active_listeners, 0);
    }
}
