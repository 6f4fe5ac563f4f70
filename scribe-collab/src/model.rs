//! The authoritative document model.
//!
//! Architecture:
//! ```text
//!  apply_op(name, op@v) ──► per-doc queue ──► worker task ──► rebase over history[v..cur]
//!                            (FIFO, one                        apply to snapshot
//!                             per document)                    write_op (storage)
//!                                                              notify listeners
//!                                                              run on_applied
//!                                                              reply new version
//!                                                              maybe write snapshot
//! ```
//!
//! Every loaded document owns one worker task that drains its queue in
//! order, so edits to one document are strictly sequential while different
//! documents progress independently. A slow storage write holds up only the
//! document being written.
//!
//! Listeners are notified while the state lock is held. The submitter's
//! [`OnApplied`] callback runs right after, under the same lock, so an
//! acknowledgement sent from it lands between the broadcasts of the ops
//! applied before and after this one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use scribe_ot::{Side, apply, transform};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

use crate::broadcast::{BroadcastStats, DocUpdate, Listener, ListenerId, ListenerSet};
use crate::config::ModelOptions;
use crate::doc::{DocSnapshot, OpData, OpMeta, TEXT_TYPE, now_secs, valid_name};
use crate::error::ModelError;
use crate::storage::{DocumentStore, MemoryStore, blocking};

/// Model statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub ops_written: u64,
    pub snapshots_written: u64,
    pub loaded_documents: usize,
}

#[derive(Default)]
struct AtomicModelStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    ops_written: AtomicU64,
    snapshots_written: AtomicU64,
}

struct DocState {
    snapshot: Arc<str>,
    v: u64,
    doc_type: String,
    meta: Map<String, Value>,
    /// The most recent applied ops, contiguous, ending at `v - 1`.
    ops: VecDeque<Arc<OpData>>,
    committed_version: u64,
    snapshot_write_lock: bool,
    listeners: ListenerSet,
}

impl DocState {
    fn new(data: DocSnapshot, committed_version: u64, ops: VecDeque<Arc<OpData>>) -> Self {
        Self {
            snapshot: Arc::from(data.snapshot),
            v: data.v,
            doc_type: data.doc_type,
            meta: data.meta,
            ops,
            committed_version,
            snapshot_write_lock: false,
            listeners: ListenerSet::new(),
        }
    }

    /// Version of the oldest cached op.
    fn base(&self) -> u64 {
        self.v - self.ops.len() as u64
    }

    fn to_snapshot(&self) -> DocSnapshot {
        DocSnapshot {
            v: self.v,
            doc_type: self.doc_type.clone(),
            snapshot: self.snapshot.to_string(),
            meta: self.meta.clone(),
        }
    }
}

struct Document {
    name: String,
    state: Mutex<DocState>,
}

/// Called with the new version once an op is applied and broadcast, while
/// the document is still locked. Must not block.
pub type OnApplied = Box<dyn FnOnce(u64) + Send>;

struct OpRequest {
    data: OpData,
    on_applied: Option<OnApplied>,
    reply: oneshot::Sender<Result<u64, ModelError>>,
}

#[derive(Clone)]
struct DocEntry {
    doc: Arc<Document>,
    queue: mpsc::UnboundedSender<OpRequest>,
}

/// A loaded document.
#[derive(Clone)]
pub struct LoadedDoc {
    doc: Arc<Document>,
}

impl LoadedDoc {
    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub async fn version(&self) -> u64 {
        self.doc.state.lock().await.v
    }

    pub async fn text(&self) -> String {
        self.doc.state.lock().await.snapshot.to_string()
    }
}

/// Shared by the model handle and the document workers.
struct Backend {
    store: Arc<dyn DocumentStore>,
    options: ModelOptions,
    stats: AtomicModelStats,
}

/// Registry of loaded documents. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Model {
    backend: Arc<Backend>,
    docs: Arc<RwLock<HashMap<String, DocEntry>>>,
    /// One gate per name being cold-loaded, so concurrent loads of the same
    /// document read storage once.
    loading: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl Model {
    /// A model over a fresh [`MemoryStore`]. History beyond the window of
    /// `num_cached_ops` lives in that store for the life of the model.
    pub fn new(options: ModelOptions) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), options)
    }

    /// A model backed by `store`: cold loads, durable ops, periodic
    /// snapshots and a history window of `num_cached_ops`.
    pub fn with_store(store: Arc<dyn DocumentStore>, options: ModelOptions) -> Self {
        Self {
            backend: Arc::new(Backend {
                store,
                options,
                stats: AtomicModelStats::default(),
            }),
            docs: Arc::new(RwLock::new(HashMap::new())),
            loading: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn options(&self) -> &ModelOptions {
        &self.backend.options
    }

    // ─── Loading ─────────────────────────────────────────────────────

    /// Load `name` into memory if needed.
    pub async fn load(&self, name: &str) -> Result<LoadedDoc, ModelError> {
        let entry = self.entry(name).await?;
        Ok(LoadedDoc { doc: entry.doc })
    }

    async fn entry(&self, name: &str) -> Result<DocEntry, ModelError> {
        if let Some(entry) = self.docs.read().await.get(name) {
            self.backend.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.clone());
        }
        let gate = {
            let mut loading = self.loading.lock().await;
            loading.entry(name.to_string()).or_default().clone()
        };
        let guard = gate.lock().await;
        let result = self.cold_load(name, &self.backend.store).await;
        drop(guard);

        let mut loading = self.loading.lock().await;
        // Map plus our clone: nobody else is waiting.
        if loading.get(name).is_some_and(|g| Arc::ptr_eq(g, &gate)) && Arc::strong_count(&gate) <= 2 {
            loading.remove(name);
        }
        result
    }

    async fn cold_load(&self, name: &str, store: &Arc<dyn DocumentStore>) -> Result<DocEntry, ModelError> {
        if let Some(entry) = self.docs.read().await.get(name) {
            self.backend.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.clone());
        }
        self.backend.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        let owned = name.to_string();
        let mut data = blocking(store, move |s| s.get_snapshot(&owned)).await?;
        if data.doc_type != TEXT_TYPE {
            log::warn!("Type '{}' of document {name} is not supported", data.doc_type);
            return Err(ModelError::TypeNotFound);
        }

        let committed_version = data.v;
        let owned = name.to_string();
        let from = data.v;
        let ops = blocking(store, move |s| s.get_ops(&owned, from, None)).await?;

        let mut text = std::mem::take(&mut data.snapshot);
        for op in &ops {
            text = apply(&text, &op.op).map_err(|e| {
                log::error!("Op data invalid for {name} at v{}: {e}", op.v);
                ModelError::CorruptOps
            })?;
            data.v += 1;
        }
        data.snapshot = text;
        if !ops.is_empty() {
            log::info!("Catchup {name} {committed_version} -> {}", data.v);
        }

        let keep = ops.len().saturating_sub(self.backend.options.num_cached_ops);
        let history = ops.into_iter().skip(keep).map(Arc::new).collect();
        self.insert(name, DocState::new(data, committed_version, history)).await
    }

    /// Register a document and start its worker.
    async fn insert(&self, name: &str, state: DocState) -> Result<DocEntry, ModelError> {
        let mut docs = self.docs.write().await;
        if docs.contains_key(name) {
            return Err(ModelError::AlreadyExists);
        }

        let doc = Arc::new(Document {
            name: name.to_string(),
            state: Mutex::new(state),
        });
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_queue(Arc::clone(&self.backend), Arc::clone(&doc), rx));

        let entry = DocEntry { doc, queue };
        docs.insert(name.to_string(), entry.clone());
        log::debug!("Document {name} loaded ({} in memory)", docs.len());
        Ok(entry)
    }

    // ─── Operations ──────────────────────────────────────────────────

    /// Create a text document, optionally with initial content.
    pub async fn create(
        &self,
        name: &str,
        doc_type: &str,
        initial: Option<String>,
        meta: Map<String, Value>,
    ) -> Result<(), ModelError> {
        if !valid_name(name) {
            return Err(ModelError::InvalidName);
        }
        if self.docs.read().await.contains_key(name) {
            return Err(ModelError::AlreadyExists);
        }
        if doc_type != TEXT_TYPE {
            return Err(ModelError::TypeNotFound);
        }

        let data = DocSnapshot {
            v: 0,
            doc_type: TEXT_TYPE.to_string(),
            snapshot: initial.unwrap_or_default(),
            meta,
        };
        let owned = name.to_string();
        let stored = data.clone();
        blocking(&self.backend.store, move |s| s.create(&owned, &stored)).await?;

        self.insert(name, DocState::new(data, 0, VecDeque::new())).await?;
        log::info!("Created document {name}");
        Ok(())
    }

    pub async fn get_snapshot(&self, name: &str) -> Result<DocSnapshot, ModelError> {
        let entry = self.entry(name).await?;
        let state = entry.doc.state.lock().await;
        Ok(state.to_snapshot())
    }

    pub async fn get_version(&self, name: &str) -> Result<u64, ModelError> {
        let entry = self.entry(name).await?;
        let v = entry.doc.state.lock().await.v;
        Ok(v)
    }

    /// Ops applied at versions `start..end` (`end` defaults to the current
    /// version). Served from memory when the window covers the range.
    pub async fn get_ops(&self, name: &str, start: u64, end: Option<u64>) -> Result<Vec<Arc<OpData>>, ModelError> {
        let loaded = self.docs.read().await.get(name).map(|e| Arc::clone(&e.doc));
        match loaded {
            Some(doc) => self.backend.history(&doc, start, end).await,
            None => {
                self.backend.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                self.backend.stored_ops(name, start, end).await
            }
        }
    }

    /// Queue `data` for rebase and apply. Resolves with the version after
    /// the op was applied.
    pub async fn apply_op(&self, name: &str, data: OpData) -> Result<u64, ModelError> {
        self.queue_op(name, data, None).await
    }

    /// Like [`Model::apply_op`], also running `on_applied` in broadcast
    /// order. It is not called when the op fails.
    pub async fn apply_op_with(
        &self,
        name: &str,
        data: OpData,
        on_applied: impl FnOnce(u64) + Send + 'static,
    ) -> Result<u64, ModelError> {
        self.queue_op(name, data, Some(Box::new(on_applied))).await
    }

    async fn queue_op(&self, name: &str, data: OpData, on_applied: Option<OnApplied>) -> Result<u64, ModelError> {
        let entry = self.entry(name).await?;
        let (reply, rx) = oneshot::channel();
        entry
            .queue
            .send(OpRequest { data, on_applied, reply })
            .map_err(|_| ModelError::DoesNotExist)?;
        rx.await.map_err(|_| ModelError::DoesNotExist)?
    }

    /// Broadcast a meta op. Only shouts are recognised; the version never
    /// changes. Returns the current version.
    pub async fn apply_meta(&self, name: &str, meta: OpMeta) -> Result<u64, ModelError> {
        let entry = self.entry(name).await?;
        let mut state = entry.doc.state.lock().await;
        if meta.is_shout() {
            state.listeners.notify(&DocUpdate::Meta(Arc::new(meta)));
        }
        Ok(state.v)
    }

    /// Register `listener`. With `from_version`, every op applied since then
    /// is delivered first, with no gap before live updates. Returns the
    /// listener id and the version the listener starts from.
    pub async fn listen(
        &self,
        name: &str,
        from_version: Option<u64>,
        listener: Arc<dyn Listener>,
    ) -> Result<(ListenerId, u64), ModelError> {
        let entry = self.entry(name).await?;
        let doc = entry.doc;

        let Some(from) = from_version else {
            let mut state = doc.state.lock().await;
            let id = state.listeners.add(listener);
            return Ok((id, state.v));
        };

        let mut replay: Vec<Arc<OpData>> = Vec::new();
        let mut next = from;
        loop {
            let base = {
                let mut state = doc.state.lock().await;
                if next > state.v {
                    return Err(ModelError::FutureVersion);
                }
                let base = state.base();
                if next >= base {
                    let skip = next.saturating_sub(base) as usize;
                    replay.extend(state.ops.iter().skip(skip).cloned());
                    for data in replay {
                        let update = DocUpdate::Op {
                            data,
                            snapshot: None,
                            old_snapshot: None,
                        };
                        if !listener.deliver(&update) {
                            return Err(ModelError::SessionClosed);
                        }
                    }
                    let id = state.listeners.add(listener);
                    return Ok((id, from));
                }
                base
            };

            // Older than the window: read up to the window, then look again.
            let stored = self.backend.stored_ops(&doc.name, next, Some(base)).await?;
            if stored.len() as u64 != base - next {
                log::error!(
                    "Could not replay ops for {}: expected {} got {}",
                    doc.name,
                    base - next,
                    stored.len()
                );
                return Err(ModelError::Internal);
            }
            next = base;
            replay.extend(stored);
        }
    }

    /// Unregister a listener. Returns false if the document is not loaded or
    /// the listener is unknown.
    pub async fn remove_listener(&self, name: &str, id: ListenerId) -> bool {
        let doc = self.docs.read().await.get(name).map(|e| Arc::clone(&e.doc));
        match doc {
            Some(doc) => doc.state.lock().await.listeners.remove(id),
            None => false,
        }
    }

    /// Drop the document from memory and storage. Queued ops still drain
    /// against the detached state.
    pub async fn delete(&self, name: &str) -> Result<(), ModelError> {
        self.docs.write().await.remove(name);
        let owned = name.to_string();
        blocking(&self.backend.store, move |s| s.delete(&owned)).await?;
        log::info!("Deleted document {name}");
        Ok(())
    }

    /// Names of every known document, loaded or stored.
    pub async fn list(&self) -> Result<Vec<String>, ModelError> {
        let mut names: Vec<String> = blocking(&self.backend.store, |s| s.list()).await?;
        names.extend(self.docs.read().await.keys().cloned());
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Write a snapshot of every document with uncommitted ops. Returns the
    /// number of snapshots written.
    pub async fn flush(&self) -> usize {
        let docs: Vec<Arc<Document>> = self
            .docs
            .read()
            .await
            .values()
            .map(|e| Arc::clone(&e.doc))
            .collect();

        let mut written = 0;
        for doc in docs {
            match self.backend.write_snapshot(&doc).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => log::warn!("Error writing snapshot of {}: {e}", doc.name),
            }
        }
        written
    }

    pub async fn stats(&self) -> ModelStats {
        let stats = &self.backend.stats;
        ModelStats {
            cache_hits: stats.cache_hits.load(Ordering::Relaxed),
            cache_misses: stats.cache_misses.load(Ordering::Relaxed),
            ops_written: stats.ops_written.load(Ordering::Relaxed),
            snapshots_written: stats.snapshots_written.load(Ordering::Relaxed),
            loaded_documents: self.docs.read().await.len(),
        }
    }

    /// Fan-out statistics of a loaded document.
    pub async fn broadcast_stats(&self, name: &str) -> Option<BroadcastStats> {
        let doc = self.docs.read().await.get(name).map(|e| Arc::clone(&e.doc))?;
        let stats = doc.state.lock().await.listeners.stats();
        Some(stats)
    }
}

/// Drain one document's queue. Ends when the document is deleted and every
/// queued request has been answered.
async fn run_queue(backend: Arc<Backend>, doc: Arc<Document>, mut rx: mpsc::UnboundedReceiver<OpRequest>) {
    while let Some(OpRequest { data, on_applied, reply }) = rx.recv().await {
        let result = backend.apply(&doc, data, on_applied).await;
        let commit = matches!(result, Ok((_, true)));
        // A closed receiver means the submitter went away; nothing to do.
        let _ = reply.send(result.map(|(v, _)| v));

        if commit {
            let backend = Arc::clone(&backend);
            let doc = Arc::clone(&doc);
            tokio::spawn(async move {
                if let Err(e) = backend.write_snapshot(&doc).await {
                    log::warn!("Error writing snapshot of {}: {e}. This is nonfatal", doc.name);
                }
            });
        }
    }
    log::debug!("Queue for {} closed", doc.name);
}

impl Backend {
    /// Rebase, apply, persist and broadcast one op. Returns the new version
    /// and whether a snapshot is due.
    async fn apply(
        &self,
        doc: &Document,
        mut data: OpData,
        on_applied: Option<OnApplied>,
    ) -> Result<(u64, bool), ModelError> {
        let name = &doc.name;
        let current = doc.state.lock().await.v;
        if data.v > current {
            return Err(ModelError::FutureVersion);
        }
        if data.v + self.options.maximum_age < current {
            return Err(ModelError::TooOld);
        }

        let ops = self.history(doc, data.v, Some(current)).await?;
        if ops.len() as u64 != current - data.v {
            log::error!(
                "Could not get old ops in model for document {name}: expected ops {} to {current} and got {}",
                data.v,
                ops.len()
            );
            return Err(ModelError::Internal);
        }

        for old in &ops {
            if let Some(source) = &old.meta.source {
                if data.dup_if_source.contains(source) {
                    return Err(ModelError::AlreadySubmitted);
                }
            }
            data.op = transform(&data.op, &old.op, Side::Left).map_err(|e| {
                log::error!("Cannot rebase op for {name} over v{}: {e}", old.v);
                ModelError::Internal
            })?;
            data.v += 1;
        }

        let snapshot = {
            let state = doc.state.lock().await;
            if data.v != state.v {
                log::error!(
                    "Version mismatch in model for {name}: expecting {} == {}",
                    data.v,
                    state.v
                );
                return Err(ModelError::Internal);
            }
            apply(&state.snapshot, &data.op).map_err(|e| {
                log::error!("Cannot apply op to {name} at v{}: {e}", data.v);
                ModelError::Internal
            })?
        };

        data.meta.ts = Some(now_secs());
        let owned = name.clone();
        let stored = data.clone();
        blocking(&self.store, move |s| s.write_op(&owned, &stored))
            .await
            .map_err(|e| {
                log::error!("Error writing op {} of {name}: {e}", data.v);
                ModelError::from(e)
            })?;
        self.stats.ops_written.fetch_add(1, Ordering::Relaxed);

        let data = Arc::new(data);
        let mut state = doc.state.lock().await;
        let snapshot: Arc<str> = Arc::from(snapshot);
        let old_snapshot = std::mem::replace(&mut state.snapshot, Arc::clone(&snapshot));
        state.v = data.v + 1;
        state.ops.push_back(Arc::clone(&data));
        if state.ops.len() > self.options.num_cached_ops {
            state.ops.pop_front();
        }
        log::trace!("Applied op to {name}, now v{}", state.v);

        state.listeners.notify(&DocUpdate::Op {
            data,
            snapshot: Some(snapshot),
            old_snapshot: Some(old_snapshot),
        });
        if let Some(on_applied) = on_applied {
            on_applied(state.v);
        }

        let commit = !state.snapshot_write_lock
            && state.committed_version + self.options.ops_before_commit <= state.v;
        Ok((state.v, commit))
    }

    /// Ops in `start..end` of a loaded document.
    async fn history(&self, doc: &Document, start: u64, end: Option<u64>) -> Result<Vec<Arc<OpData>>, ModelError> {
        let (start, end) = {
            let state = doc.state.lock().await;
            let end = end.unwrap_or(state.v).min(state.v);
            let start = start.min(end);
            if start == end {
                return Ok(Vec::new());
            }

            let base = state.base();
            if start >= base {
                self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                let skip = start.saturating_sub(base) as usize;
                let take = (end - start.max(base)) as usize;
                return Ok(state.ops.iter().skip(skip).take(take).cloned().collect());
            }
            (start, end)
        };

        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.stored_ops(&doc.name, start, Some(end)).await
    }

    async fn stored_ops(&self, name: &str, start: u64, end: Option<u64>) -> Result<Vec<Arc<OpData>>, ModelError> {
        let owned = name.to_string();
        let ops = blocking(&self.store, move |s| s.get_ops(&owned, start, end)).await?;
        Ok(ops.into_iter().map(Arc::new).collect())
    }

    /// Persist the current snapshot if it is ahead of the committed one.
    /// Returns whether a snapshot was written.
    async fn write_snapshot(&self, doc: &Document) -> Result<bool, ModelError> {
        let data = {
            let mut state = doc.state.lock().await;
            if state.committed_version == state.v {
                return Ok(false);
            }
            if state.snapshot_write_lock {
                log::debug!("Another snapshot write of {} is in progress", doc.name);
                return Ok(false);
            }
            state.snapshot_write_lock = true;
            state.to_snapshot()
        };

        let version = data.v;
        let owned = doc.name.clone();
        let result = blocking(&self.store, move |s| s.write_snapshot(&owned, &data)).await;

        let mut state = doc.state.lock().await;
        state.snapshot_write_lock = false;
        result?;
        state.committed_version = version;
        self.stats.snapshots_written.fetch_add(1, Ordering::Relaxed);
        log::debug!("Wrote snapshot of {} at v{version}", doc.name);
        Ok(true)
    }
}
