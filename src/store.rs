//! Client-side stores fed by DDP `data` messages.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::protocol::DataMessage;

/// A local collection that receives server updates. Every flush is bracketed
/// by `begin_update` / `end_update`, so a store can defer observers until the
/// whole batch is applied.
pub trait Store: Send {
    fn begin_update(&mut self);
    fn update(&mut self, msg: &DataMessage);
    fn end_update(&mut self);
    /// Drop all server-provided documents; a new session is about to repopulate them.
    fn reset(&mut self);
}

pub type Fields = Map<String, Value>;

#[derive(Default)]
struct CollectionState {
    docs: BTreeMap<String, Fields>,
    in_update: bool,
    applied: usize,
    batches: usize,
}

/// In-memory store. Clones share the same documents, so a caller can keep a
/// handle for reads after registering one with a connection.
#[derive(Clone)]
pub struct LocalCollection {
    name: String,
    state: Arc<Mutex<CollectionState>>,
}

impl LocalCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), state: Arc::new(Mutex::new(CollectionState::default())) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, id: &str) -> Option<Fields> {
        self.state.lock().docs.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.state.lock().docs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while a flush is being applied.
    pub fn in_update(&self) -> bool {
        self.state.lock().in_update
    }

    /// Number of completed begin/end batches.
    pub fn batches(&self) -> usize {
        self.state.lock().batches
    }
}

impl Store for LocalCollection {
    fn begin_update(&mut self) {
        let mut st = self.state.lock();
        st.in_update = true;
        st.applied = 0;
    }

    fn update(&mut self, msg: &DataMessage) {
        let Some(id) = msg.id.as_deref() else {
            tracing::warn!(collection = %self.name, "data message without id");
            return;
        };
        let mut st = self.state.lock();
        let doc = st.docs.entry(id.to_string()).or_default();
        if let Some(set) = &msg.set {
            for (k, v) in set {
                doc.insert(k.clone(), v.clone());
            }
        }
        for k in &msg.unset {
            doc.remove(k);
        }
        // A document with no fields left is gone.
        if doc.is_empty() {
            st.docs.remove(id);
        }
        st.applied += 1;
    }

    fn end_update(&mut self) {
        let mut st = self.state.lock();
        st.in_update = false;
        st.batches += 1;
        tracing::trace!(collection = %self.name, applied = st.applied, docs = st.docs.len(), "store flush");
    }

    fn reset(&mut self) {
        let mut st = self.state.lock();
        tracing::debug!(collection = %self.name, dropped = st.docs.len(), "store reset");
        st.docs.clear();
    }
}
