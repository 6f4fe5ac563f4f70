//! Per-connection gateway to the model.
//!
//! An [`Agent`] carries the identity of one connection and runs every
//! request through the [`Authorizer`] before it reaches the [`Model`]. It
//! also remembers which documents the connection listens to, so a
//! disconnect can unregister them all.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::broadcast::{Listener, ListenerId};
use crate::doc::{DocSnapshot, OpData, OpMeta, now_secs};
use crate::error::ModelError;
use crate::model::Model;

/// Who is connected.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub session_id: Uuid,
    /// Seconds since the Unix epoch.
    pub connect_time: f64,
    pub remote_addr: Option<SocketAddr>,
}

/// Category of a request, as seen by the authorizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Connect,
    Read,
    Create,
    Update,
    Delete,
}

/// A request awaiting authorization.
#[derive(Debug, Clone, Copy)]
pub struct Action<'a> {
    pub kind: ActionKind,
    /// "connect", "get snapshot", "get ops", "open", "list", "create",
    /// "submit op", "submit meta" or "delete".
    pub name: &'static str,
    pub doc: Option<&'a str>,
}

impl<'a> Action<'a> {
    fn new(kind: ActionKind, name: &'static str, doc: Option<&'a str>) -> Self {
        Self { kind, name, doc }
    }
}

/// Accept/reject hook invoked before every document action.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, agent: &AgentInfo, action: &Action<'_>) -> bool;
}

/// Accepts everything except deletes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAuthorizer;

impl Authorizer for DefaultAuthorizer {
    fn authorize(&self, _agent: &AgentInfo, action: &Action<'_>) -> bool {
        action.kind != ActionKind::Delete
    }
}

pub struct Agent {
    info: AgentInfo,
    model: Model,
    auth: Arc<dyn Authorizer>,
    /// `None` while the open is still loading the document.
    listeners: Mutex<HashMap<String, Option<ListenerId>>>,
}

impl Agent {
    /// Authorize a new connection.
    pub fn connect(
        model: Model,
        auth: Arc<dyn Authorizer>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Self, ModelError> {
        let agent = Self {
            info: AgentInfo {
                session_id: Uuid::new_v4(),
                connect_time: now_secs(),
                remote_addr,
            },
            model,
            auth,
            listeners: Mutex::new(HashMap::new()),
        };
        agent.check(ActionKind::Connect, "connect", None)?;
        Ok(agent)
    }

    pub fn info(&self) -> &AgentInfo {
        &self.info
    }

    pub fn session_id(&self) -> Uuid {
        self.info.session_id
    }

    fn check(&self, kind: ActionKind, name: &'static str, doc: Option<&str>) -> Result<(), ModelError> {
        if self.auth.authorize(&self.info, &Action::new(kind, name, doc)) {
            Ok(())
        } else {
            log::debug!("Session {} forbidden to {name} {doc:?}", self.info.session_id);
            Err(ModelError::Forbidden)
        }
    }

    pub async fn get_snapshot(&self, name: &str) -> Result<DocSnapshot, ModelError> {
        self.check(ActionKind::Read, "get snapshot", Some(name))?;
        self.model.get_snapshot(name).await
    }

    pub async fn get_ops(&self, name: &str, start: u64, end: Option<u64>) -> Result<Vec<Arc<OpData>>, ModelError> {
        self.check(ActionKind::Read, "get ops", Some(name))?;
        self.model.get_ops(name, start, end).await
    }

    /// Create a document. `ctime`/`mtime` are recorded in its metadata.
    pub async fn create(&self, name: &str, doc_type: &str, mut meta: Map<String, Value>) -> Result<(), ModelError> {
        self.check(ActionKind::Create, "create", Some(name))?;
        let now = Value::from(now_secs());
        meta.insert("ctime".into(), now.clone());
        meta.insert("mtime".into(), now);
        self.model.create(name, doc_type, None, meta).await
    }

    /// Submit an op on behalf of this session. Returns the version after
    /// applying it; `on_applied` sees the same version in broadcast order.
    pub async fn submit_op(
        &self,
        name: &str,
        mut data: OpData,
        on_applied: impl FnOnce(u64) + Send + 'static,
    ) -> Result<u64, ModelError> {
        self.check(ActionKind::Update, "submit op", Some(name))?;
        data.meta.source = Some(self.source());
        self.model.apply_op_with(name, data, on_applied).await
    }

    pub async fn submit_meta(&self, name: &str, mut meta: OpMeta) -> Result<u64, ModelError> {
        self.check(ActionKind::Update, "submit meta", Some(name))?;
        meta.source = Some(self.source());
        self.model.apply_meta(name, meta).await
    }

    pub async fn delete(&self, name: &str) -> Result<(), ModelError> {
        self.check(ActionKind::Delete, "delete", Some(name))?;
        self.model.delete(name).await
    }

    pub async fn list(&self) -> Result<Vec<String>, ModelError> {
        self.check(ActionKind::Read, "list", None)?;
        self.model.list().await
    }

    /// Listen to `name`, replaying from `from_version` when given. Returns
    /// the version the listener starts at.
    pub async fn listen(
        &self,
        name: &str,
        from_version: Option<u64>,
        listener: Arc<dyn Listener>,
    ) -> Result<u64, ModelError> {
        if from_version.is_some() {
            self.check(ActionKind::Read, "get ops", Some(name))?;
        }
        self.check(ActionKind::Read, "open", Some(name))?;

        {
            let mut listeners = self.listeners.lock().await;
            if listeners.contains_key(name) {
                return Err(ModelError::AlreadyOpen);
            }
            listeners.insert(name.to_string(), None);
        }

        // Loading may hit storage; other documents stay usable meanwhile.
        let (id, v) = match self.model.listen(name, from_version, listener).await {
            Ok(listening) => listening,
            Err(e) => {
                self.listeners.lock().await.remove(name);
                return Err(e);
            }
        };

        let mut listeners = self.listeners.lock().await;
        match listeners.get_mut(name) {
            Some(slot) => {
                *slot = Some(id);
                Ok(v)
            }
            None => {
                // Closed or disconnected while loading.
                drop(listeners);
                self.model.remove_listener(name, id).await;
                Err(ModelError::SessionClosed)
            }
        }
    }

    pub async fn remove_listener(&self, name: &str) -> Result<(), ModelError> {
        let slot = self
            .listeners
            .lock()
            .await
            .remove(name)
            .ok_or(ModelError::NotOpen)?;
        if let Some(id) = slot {
            self.model.remove_listener(name, id).await;
        }
        Ok(())
    }

    pub async fn is_listening(&self, name: &str) -> bool {
        matches!(self.listeners.lock().await.get(name), Some(Some(_)))
    }

    /// Unregister every listener of this connection.
    pub async fn disconnect(&self) {
        let listeners: Vec<(String, Option<ListenerId>)> = self.listeners.lock().await.drain().collect();
        for (name, id) in listeners {
            if let Some(id) = id {
                self.model.remove_listener(&name, id).await;
            }
        }
        log::debug!("Session {} disconnected", self.info.session_id);
    }

    fn source(&self) -> String {
        self.info.session_id.to_string()
    }
}
