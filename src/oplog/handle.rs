//! Oplog fan-out. Writers publish entries; a tailing task delivers them in
//! order to every listener whose trigger matches. Publication and delivery
//! are decoupled, so [`OplogHandle::wait_until_caught_up`] is how a reader
//! knows everything published so far has been delivered.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::entry::OplogEntry;
use crate::doc_id::DocId;
use crate::fence::{Write, WriteFence};

/// Which entries a listener wants: a whole collection, or one document in it.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub collection: String,
    pub id: Option<DocId>,
}

impl Trigger {
    pub fn collection(name: impl Into<String>) -> Self {
        Self { collection: name.into(), id: None }
    }

    fn matches(&self, collection: &str, id: Option<&DocId>) -> bool {
        if self.collection != collection {
            return false;
        }
        match (&self.id, id) {
            (Some(want), Some(got)) => want == got,
            _ => true,
        }
    }
}

pub enum OplogNotification {
    Entry { entry: OplogEntry, write: Option<Write> },
    DropCollection { collection: String, write: Option<Write> },
}

impl OplogNotification {
    pub fn take_write(&mut self) -> Option<Write> {
        match self {
            OplogNotification::Entry { write, .. } | OplogNotification::DropCollection { write, .. } => write.take(),
        }
    }
}

type Listener = Box<dyn Fn(OplogNotification) + Send + Sync>;

enum Published {
    Entry(OplogEntry),
    DropCollection(String),
}

struct Tailed {
    seq: u64,
    item: Published,
    fence: Option<(WriteFence, Write)>,
}

struct Inner {
    listeners: Mutex<Vec<(u64, Trigger, Arc<Listener>)>>,
    next_listener: AtomicU64,
    last_published: AtomicU64,
    processed: watch::Sender<u64>,
}

impl Inner {
    fn deliver(&self, tailed: Tailed) {
        let (collection, id) = match &tailed.item {
            Published::Entry(e) => (e.collection.as_str(), e.id()),
            Published::DropCollection(c) => (c.as_str(), None),
        };
        let targets: Vec<Arc<Listener>> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, trigger, _)| trigger.matches(collection, id.as_ref()))
            .map(|(_, _, l)| l.clone())
            .collect();
        let fence = tailed.fence.as_ref().map(|(f, _)| f.clone());
        for listener in targets {
            let write = fence.as_ref().map(WriteFence::begin_write);
            let notification = match &tailed.item {
                Published::Entry(e) => OplogNotification::Entry { entry: e.clone(), write },
                Published::DropCollection(c) => OplogNotification::DropCollection { collection: c.clone(), write },
            };
            listener(notification);
        }
        // Listeners now hold their own writes; release the publisher's hold.
        if let Some((_, write)) = tailed.fence {
            write.committed();
        }
        self.processed.send_replace(tailed.seq);
    }
}

#[derive(Clone)]
pub struct OplogHandle {
    inner: Arc<Inner>,
    tx: mpsc::UnboundedSender<Tailed>,
}

impl OplogHandle {
    /// Create a handle and spawn its tailing task on the current runtime.
    pub fn start() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Tailed>();
        let (processed, _) = watch::channel(0u64);
        let inner = Arc::new(Inner {
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            last_published: AtomicU64::new(0),
            processed,
        });
        let tail_inner = Arc::downgrade(&inner);
        let task = tokio::spawn(async move {
            while let Some(tailed) = rx.recv().await {
                let Some(inner) = tail_inner.upgrade() else { break };
                inner.deliver(tailed);
            }
            tracing::debug!("oplog tailer stopped");
        });
        (Self { inner, tx }, task)
    }

    pub fn on_oplog_entry(
        &self,
        trigger: Trigger,
        listener: impl Fn(OplogNotification) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        let boxed: Listener = Box::new(listener);
        self.inner.listeners.lock().push((id, trigger, Arc::new(boxed)));
        ListenerHandle { inner: Arc::downgrade(&self.inner), id }
    }

    /// Queue an entry for delivery. When `fence` is given, every listener that
    /// receives the entry gets its own [`Write`] on that fence.
    pub fn publish(&self, entry: OplogEntry, fence: Option<&WriteFence>) {
        self.enqueue(Published::Entry(entry), fence);
    }

    pub fn publish_drop_collection(&self, collection: impl Into<String>, fence: Option<&WriteFence>) {
        self.enqueue(Published::DropCollection(collection.into()), fence);
    }

    fn enqueue(&self, item: Published, fence: Option<&WriteFence>) {
        let seq = self.inner.last_published.fetch_add(1, Ordering::SeqCst) + 1;
        let fence = fence.map(|f| (f.clone(), f.begin_write()));
        if self.tx.send(Tailed { seq, item, fence }).is_err() {
            tracing::warn!("oplog tailer gone; entry dropped");
        }
    }

    /// Resolve once everything published before this call has been delivered.
    pub async fn wait_until_caught_up(&self) {
        let target = self.inner.last_published.load(Ordering::SeqCst);
        let mut rx = self.inner.processed.subscribe();
        let _ = rx.wait_for(|seen| *seen >= target).await;
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

pub struct ListenerHandle {
    inner: Weak<Inner>,
    id: u64,
}

impl ListenerHandle {
    pub fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.lock().retain(|(id, _, _)| *id != self.id);
        }
    }
}
