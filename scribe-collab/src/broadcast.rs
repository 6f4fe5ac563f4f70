//! Fan-out of applied ops to the listeners of one document.
//!
//! Delivery is synchronous: the model calls [`ListenerSet::notify`] while it
//! still holds the document state lock, so every listener observes ops in
//! version order and before the submitter sees its acknowledgement.
//! Listeners must therefore never block; the usual listener is an unbounded
//! channel sender (or a session's outgoing queue).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::doc::{OpData, OpMeta};

/// Something that happened to a document.
#[derive(Debug, Clone)]
pub enum DocUpdate {
    /// An op was applied at `data.v`. The snapshots are present for live
    /// notifications and absent for ops replayed from history.
    Op {
        data: Arc<OpData>,
        snapshot: Option<Arc<str>>,
        old_snapshot: Option<Arc<str>>,
    },
    /// An ephemeral meta message (shout). Does not change the version.
    Meta(Arc<OpMeta>),
}

impl DocUpdate {
    pub fn op(&self) -> Option<&OpData> {
        match self {
            DocUpdate::Op { data, .. } => Some(data),
            DocUpdate::Meta(_) => None,
        }
    }
}

/// Receiver of document updates.
pub trait Listener: Send + Sync {
    /// Deliver one update. Returning `false` unregisters the listener.
    fn deliver(&self, update: &DocUpdate) -> bool;
}

impl Listener for mpsc::UnboundedSender<DocUpdate> {
    fn deliver(&self, update: &DocUpdate) -> bool {
        self.send(update.clone()).is_ok()
    }
}

/// Handle returned by `listen`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for monitoring fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub listeners_dropped: u64,
    pub active_listeners: usize,
}

/// The listeners registered on one document.
#[derive(Default)]
pub struct ListenerSet {
    listeners: HashMap<ListenerId, Arc<dyn Listener>>,
    messages_sent: AtomicU64,
    listeners_dropped: AtomicU64,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId::new();
        self.listeners.insert(id, listener);
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Deliver `update` to every listener, dropping those that have gone away.
    /// Returns the number of listeners that accepted it.
    pub fn notify(&mut self, update: &DocUpdate) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(|_, listener| listener.deliver(update));
        let delivered = self.listeners.len();

        self.messages_sent.fetch_add(delivered as u64, Ordering::Relaxed);
        if delivered < before {
            let dropped = before - delivered;
            self.listeners_dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
            log::debug!("Dropped {dropped} closed listener(s)");
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.listeners.contains_key(&id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            listeners_dropped: self.listeners_dropped.load(Ordering::Relaxed),
            active_listeners: self.listeners.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_ot::{Component, Op};

    fn update(v: u64) -> DocUpdate {
        DocUpdate::Op {
            data: Arc::new(OpData::new(Op::from(Component::insert(0, "x")), v)),
            snapshot: Some(Arc::from("x")),
            old_snapshot: Some(Arc::from("")),
        }
    }

    #[tokio::test]
    async fn test_fan_out() {
        let mut set = ListenerSet::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        set.add(Arc::new(tx1));
        set.add(Arc::new(tx2));

        assert_eq!(set.notify(&update(0)), 2);
        assert_eq!(rx1.recv().await.unwrap().op().unwrap().v, 0);
        assert_eq!(rx2.recv().await.unwrap().op().unwrap().v, 0);
    }

    #[tokio::test]
    async fn test_add_remove() {
        let mut set = ListenerSet::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = set.add(Arc::new(tx));
        assert!(set.contains(id));

        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert_eq!(set.notify(&update(0)), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_listener_is_dropped() {
        let mut set = ListenerSet::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (live, _live_rx) = mpsc::unbounded_channel();
        set.add(Arc::new(tx));
        set.add(Arc::new(live));
        drop(rx);

        assert_eq!(set.notify(&update(0)), 1);
        assert_eq!(set.len(), 1);

        let stats = set.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.listeners_dropped, 1);
        assert_eq!(stats.active_listeners, 1);
    }

    #[test]
    fn test_meta_update_has_no_op() {
        let update = DocUpdate::Meta(Arc::new(OpMeta::default()));
        assert!(update.op().is_none());
    }
}
