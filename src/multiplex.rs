//! Observer fan-out for one live query.

use bson::{Bson, Document};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::doc_id::DocId;

/// Receives the observable effects of a live query. `changed` carries only
/// the fields that differ; a field set to `Bson::Undefined` was removed.
pub trait Multiplexer: Send + Sync {
    fn added(&self, id: &DocId, fields: Document);
    fn changed(&self, id: &DocId, fields: Document);
    fn removed(&self, id: &DocId);
    /// The initial result set has been delivered.
    fn ready(&self);
    /// Run `f` once every callback issued so far has been delivered.
    fn on_flush(&self, f: Box<dyn FnOnce() + Send>);
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObserveEvent {
    Added { id: DocId, fields: Document },
    Changed { id: DocId, fields: Document },
    Removed { id: DocId },
    Ready,
}

#[derive(Default)]
struct MuxState {
    docs: BTreeMap<DocId, Document>,
    ready: bool,
    handles: Vec<mpsc::UnboundedSender<ObserveEvent>>,
}

/// Multiplexer that caches the current result set and pushes events to any
/// number of channel handles. Late handles first receive `added` for every
/// cached document, plus `ready` if the query is already ready.
#[derive(Default)]
pub struct ChannelMultiplexer {
    state: Mutex<MuxState>,
}

impl ChannelMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handle(&self) -> mpsc::UnboundedReceiver<ObserveEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut st = self.state.lock();
        for (id, fields) in &st.docs {
            let _ = tx.send(ObserveEvent::Added { id: id.clone(), fields: fields.clone() });
        }
        if st.ready {
            let _ = tx.send(ObserveEvent::Ready);
        }
        st.handles.push(tx);
        rx
    }

    pub fn snapshot(&self) -> BTreeMap<DocId, Document> {
        self.state.lock().docs.clone()
    }

    fn broadcast(st: &mut MuxState, event: ObserveEvent) {
        st.handles.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Multiplexer for ChannelMultiplexer {
    fn added(&self, id: &DocId, fields: Document) {
        let mut st = self.state.lock();
        st.docs.insert(id.clone(), fields.clone());
        Self::broadcast(&mut st, ObserveEvent::Added { id: id.clone(), fields });
    }

    fn changed(&self, id: &DocId, fields: Document) {
        let mut st = self.state.lock();
        if let Some(doc) = st.docs.get_mut(id) {
            for (k, v) in &fields {
                if matches!(v, Bson::Undefined) {
                    doc.remove(k);
                } else {
                    doc.insert(k.clone(), v.clone());
                }
            }
        }
        Self::broadcast(&mut st, ObserveEvent::Changed { id: id.clone(), fields });
    }

    fn removed(&self, id: &DocId) {
        let mut st = self.state.lock();
        st.docs.remove(id);
        Self::broadcast(&mut st, ObserveEvent::Removed { id: id.clone() });
    }

    fn ready(&self) {
        let mut st = self.state.lock();
        st.ready = true;
        Self::broadcast(&mut st, ObserveEvent::Ready);
    }

    fn on_flush(&self, f: Box<dyn FnOnce() + Send>) {
        // Events are pushed synchronously, so everything issued is already delivered.
        f();
    }
}
