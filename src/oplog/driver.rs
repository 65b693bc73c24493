//! Live query over one collection kept current from the oplog.
//!
//! [`DriverState`] holds the bookkeeping and reacts synchronously to oplog
//! notifications, query results and fetch results, queueing the I/O it needs
//! as [`Action`]s. [`OplogObserveDriver`] runs that state machine as an actor:
//! one task, one inbox, so every event is handled to completion in arrival
//! order while queries and fetches run on their own tasks.

use bson::Document;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::entry::{OpKind, OplogEntry};
use super::handle::{ListenerHandle, OplogHandle, OplogNotification, Trigger};
use crate::cursor::{CursorDescription, cursor_supported};
use crate::doc_id::DocId;
use crate::error::{Error, Result};
use crate::fence::Write;
use crate::fetcher::DocFetcher;
use crate::matcher::{Matcher, Projection, can_be_directly_applied, combine_into_projection, is_modifier, make_changed_fields, modify};
use crate::multiplex::Multiplexer;
use crate::source::DocumentSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Querying,
    Fetching,
    Steady,
}

/// Point-in-time view of a driver, for tests and diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSnapshot {
    pub phase: Phase,
    /// Shared-projection snapshot of every document currently in the result set.
    pub published: BTreeMap<DocId, Document>,
    pub need_to_fetch: Vec<DocId>,
    pub fetch_generation: u64,
    pub stopped: bool,
}

/// I/O the state machine wants performed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    RunQuery { generation: u64 },
    FetchRound { generation: u64, ids: Vec<(DocId, String)> },
}

pub(crate) struct DriverState {
    collection: String,
    matcher: Matcher,
    projection: Projection,
    shared_projection: Projection,
    shared_fields: Option<Document>,
    multiplexer: Arc<dyn Multiplexer>,

    phase: Phase,
    phase_started: Instant,
    published: BTreeMap<DocId, Document>,
    need_to_fetch: BTreeMap<DocId, String>,
    currently_fetching: BTreeMap<DocId, String>,
    fetch_generation: u64,
    fetch_error: Option<Error>,
    requery_when_done: bool,
    writes_to_commit_when_steady: Vec<Write>,
    initialized: bool,
    stopped: bool,
    actions: Vec<Action>,
}

impl DriverState {
    pub(crate) fn new(cursor: &CursorDescription, multiplexer: Arc<dyn Multiplexer>) -> Result<Self> {
        let matcher = Matcher::compile(&cursor.selector)?;
        let (projection, shared_fields) = match &cursor.options.fields {
            Some(fields) => {
                let shared = combine_into_projection(matcher.paths(), fields);
                (Projection::compile(fields)?, (!shared.is_empty()).then_some(shared))
            }
            None => (Projection::all(), None),
        };
        let shared_projection = match &shared_fields {
            Some(fields) => Projection::compile(fields)?,
            None => Projection::all(),
        };
        Ok(Self {
            collection: cursor.collection_name.clone(),
            matcher,
            projection,
            shared_projection,
            shared_fields,
            multiplexer,
            phase: Phase::Querying,
            phase_started: Instant::now(),
            published: BTreeMap::new(),
            need_to_fetch: BTreeMap::new(),
            currently_fetching: BTreeMap::new(),
            fetch_generation: 0,
            fetch_error: None,
            requery_when_done: false,
            writes_to_commit_when_steady: Vec::new(),
            initialized: false,
            stopped: false,
            actions: Vec::new(),
        })
    }

    /// Fields the bulk query must return: the user's projection widened by
    /// every path the selector reads. `None` means all fields.
    pub(crate) fn shared_fields(&self) -> Option<&Document> {
        self.shared_fields.as_ref()
    }

    pub(crate) fn start(&mut self) {
        self.actions.push(Action::RunQuery { generation: self.fetch_generation });
    }

    pub(crate) fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn snapshot(&self) -> DriverSnapshot {
        DriverSnapshot {
            phase: self.phase,
            published: self.published.clone(),
            need_to_fetch: self.need_to_fetch.keys().cloned().collect(),
            fetch_generation: self.fetch_generation,
            stopped: self.stopped,
        }
    }

    fn register_phase_change(&mut self, phase: Phase) {
        let now = Instant::now();
        tracing::debug!(
            collection = %self.collection,
            from = ?self.phase,
            to = ?phase,
            elapsed_ms = now.duration_since(self.phase_started).as_millis() as u64,
            "observe driver phase change"
        );
        self.phase = phase;
        self.phase_started = now;
    }

    fn visible_fields(&self, doc: &Document) -> Document {
        let mut fields = self.projection.apply(doc);
        fields.remove("_id");
        fields
    }

    fn add_published(&mut self, id: DocId, doc: Document) {
        let doc = self.shared_projection.apply(&doc);
        let fields = self.visible_fields(&doc);
        self.published.insert(id.clone(), doc);
        self.multiplexer.added(&id, fields);
    }

    fn remove_published(&mut self, id: &DocId) {
        if self.published.remove(id).is_some() {
            self.multiplexer.removed(id);
        }
    }

    fn change_published(&mut self, id: DocId, doc: Document) {
        let doc = self.shared_projection.apply(&doc);
        let Some(old) = self.published.insert(id.clone(), doc.clone()) else { return };
        let changed = make_changed_fields(&self.visible_fields(&doc), &self.visible_fields(&old));
        if !changed.is_empty() {
            self.multiplexer.changed(&id, changed);
        }
    }

    /// Reconcile the result set with the current version of one document;
    /// `None` means it no longer exists.
    fn handle_doc(&mut self, id: DocId, doc: Option<Document>) {
        let matches_now = doc.as_ref().is_some_and(|d| self.matcher.document_matches(d));
        let published_before = self.published.contains_key(&id);
        match (published_before, matches_now, doc) {
            (false, true, Some(doc)) => self.add_published(id, doc),
            (true, false, _) => self.remove_published(&id),
            (true, true, Some(doc)) => self.change_published(id, doc),
            _ => {}
        }
    }

    pub(crate) fn handle_notification(&mut self, mut notification: OplogNotification) {
        let write = notification.take_write();
        if !self.stopped {
            match notification {
                OplogNotification::DropCollection { .. } => self.need_to_poll_query(),
                OplogNotification::Entry { entry, .. } => {
                    if self.phase == Phase::Querying {
                        self.handle_entry_querying(&entry);
                    } else {
                        self.handle_entry_steady_or_fetching(&entry);
                    }
                }
            }
        }
        if let Some(write) = write {
            self.register_write(write);
        }
    }

    /// A fenced write is committed once the driver is steady and the
    /// multiplexer has delivered everything issued so far.
    fn register_write(&mut self, write: Write) {
        if self.stopped {
            write.committed();
        } else if self.phase == Phase::Steady {
            self.multiplexer.on_flush(Box::new(move || write.committed()));
        } else {
            self.writes_to_commit_when_steady.push(write);
        }
    }

    fn handle_entry_querying(&mut self, entry: &OplogEntry) {
        let Some(id) = entry.id() else {
            tracing::warn!(collection = %self.collection, "oplog entry without a usable _id ignored");
            return;
        };
        self.need_to_fetch.insert(id, entry.cache_key());
    }

    fn handle_entry_steady_or_fetching(&mut self, entry: &OplogEntry) {
        let Some(id) = entry.id() else {
            tracing::warn!(collection = %self.collection, "oplog entry without a usable _id ignored");
            return;
        };

        // Already queued for a fetch: the fetch will see this write.
        if self.phase == Phase::Fetching
            && (self.currently_fetching.contains_key(&id) || self.need_to_fetch.contains_key(&id))
        {
            self.need_to_fetch.insert(id, entry.cache_key());
            return;
        }

        match entry.op {
            OpKind::Delete => self.remove_published(&id),
            OpKind::Insert => {
                if self.published.contains_key(&id) {
                    tracing::warn!(collection = %self.collection, id = %id, "insert for an already published id");
                    self.handle_doc(id, Some(entry.o.clone()));
                } else if self.matcher.document_matches(&entry.o) {
                    self.add_published(id, entry.o.clone());
                }
            }
            OpKind::Update => self.handle_update(id, entry),
        }
    }

    fn handle_update(&mut self, id: DocId, entry: &OplogEntry) {
        let modifier = &entry.o;
        if !is_modifier(modifier) {
            let mut doc = modifier.clone();
            doc.insert("_id", id.to_bson());
            self.handle_doc(id, Some(doc));
            return;
        }

        let directly = can_be_directly_applied(modifier);
        if directly && let Some(current) = self.published.get(&id) {
            let mut doc = current.clone();
            doc.insert("_id", id.to_bson());
            match modify(&mut doc, modifier) {
                Ok(()) => {
                    let doc = self.shared_projection.apply(&doc);
                    self.handle_doc(id, Some(doc));
                    return;
                }
                Err(e) => {
                    tracing::debug!(collection = %self.collection, id = %id, error = %e, "modifier not applicable to cached copy; fetching");
                }
            }
        } else if directly && !self.matcher.can_become_true_by_modifier(modifier) {
            return;
        }

        self.need_to_fetch.insert(id, entry.cache_key());
        if self.phase == Phase::Steady {
            self.fetch_modified_documents();
        }
    }

    fn fetch_modified_documents(&mut self) {
        if self.stopped {
            return;
        }
        if self.need_to_fetch.is_empty() {
            self.be_steady();
            return;
        }
        if self.phase != Phase::Fetching {
            self.register_phase_change(Phase::Fetching);
        }
        self.fetch_generation += 1;
        self.fetch_error = None;
        self.currently_fetching = std::mem::take(&mut self.need_to_fetch);
        let ids = self.currently_fetching.iter().map(|(id, key)| (id.clone(), key.clone())).collect();
        self.actions.push(Action::FetchRound { generation: self.fetch_generation, ids });
    }

    pub(crate) fn fetched(&mut self, generation: u64, id: DocId, result: Result<Option<Document>>) -> Result<()> {
        if self.stopped || generation != self.fetch_generation || self.phase != Phase::Fetching {
            tracing::trace!(collection = %self.collection, id = %id, generation, "stale fetch result dropped");
            return Ok(());
        }
        if self.currently_fetching.remove(&id).is_none() {
            return Ok(());
        }
        match result {
            Ok(doc) => {
                if self.fetch_error.is_none() {
                    self.handle_doc(id, doc);
                }
            }
            Err(e) => {
                tracing::warn!(collection = %self.collection, id = %id, error = %e, "document fetch failed");
                self.fetch_error.get_or_insert(e);
            }
        }
        if !self.currently_fetching.is_empty() {
            return Ok(());
        }
        if let Some(e) = self.fetch_error.take() {
            return Err(e);
        }
        if self.need_to_fetch.is_empty() {
            self.be_steady();
        } else {
            self.fetch_modified_documents();
        }
        Ok(())
    }

    fn be_steady(&mut self) {
        self.register_phase_change(Phase::Steady);
        let writes = std::mem::take(&mut self.writes_to_commit_when_steady);
        if !writes.is_empty() {
            self.multiplexer.on_flush(Box::new(move || {
                for w in writes {
                    w.committed();
                }
            }));
        }
    }

    fn poll_query(&mut self) {
        if self.stopped {
            return;
        }
        self.need_to_fetch.clear();
        self.currently_fetching.clear();
        self.fetch_error = None;
        self.fetch_generation += 1;
        self.register_phase_change(Phase::Querying);
        self.actions.push(Action::RunQuery { generation: self.fetch_generation });
    }

    /// Force a requery; while one is already running, schedule exactly one more.
    pub(crate) fn need_to_poll_query(&mut self) {
        if self.stopped {
            return;
        }
        if self.phase == Phase::Querying {
            self.requery_when_done = true;
        } else {
            self.poll_query();
        }
    }

    pub(crate) fn query_done(&mut self, generation: u64, result: Result<Vec<Document>>) -> Result<()> {
        if self.stopped || generation != self.fetch_generation || self.phase != Phase::Querying {
            return Ok(());
        }
        let docs = result?;
        if self.initialized {
            self.publish_new_results(docs);
        } else {
            for doc in docs {
                let Some(id) = DocId::of(&doc) else { continue };
                if self.published.contains_key(&id) {
                    tracing::warn!(collection = %self.collection, id = %id, "duplicate _id in query results");
                    continue;
                }
                self.add_published(id, doc);
            }
            self.initialized = true;
            self.multiplexer.ready();
        }
        self.done_querying();
        Ok(())
    }

    fn publish_new_results(&mut self, docs: Vec<Document>) {
        let fresh: BTreeMap<DocId, Document> = docs.into_iter().filter_map(|d| Some((DocId::of(&d)?, d))).collect();
        let gone: Vec<DocId> = self.published.keys().filter(|id| !fresh.contains_key(*id)).cloned().collect();
        for id in gone {
            self.remove_published(&id);
        }
        for (id, doc) in fresh {
            self.handle_doc(id, Some(doc));
        }
    }

    fn done_querying(&mut self) {
        if self.requery_when_done {
            self.requery_when_done = false;
            self.poll_query();
        } else if self.need_to_fetch.is_empty() {
            self.be_steady();
        } else {
            self.fetch_modified_documents();
        }
    }

    /// Idempotent. Pending fenced writes are committed and no further
    /// multiplexer callbacks are issued.
    pub(crate) fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for w in self.writes_to_commit_when_steady.drain(..) {
            w.committed();
        }
        self.published.clear();
        self.need_to_fetch.clear();
        self.currently_fetching.clear();
        self.actions.clear();
        tracing::debug!(collection = %self.collection, "observe driver stopped");
    }
}

pub struct DriverOptions {
    pub cursor: CursorDescription,
    pub source: Arc<dyn DocumentSource>,
    pub fetcher: Arc<dyn DocFetcher>,
    pub oplog: OplogHandle,
    pub multiplexer: Arc<dyn Multiplexer>,
    pub fetch_concurrency: usize,
}

enum DriverEvent {
    Oplog(OplogNotification),
    QueryDone { generation: u64, result: Result<Vec<Document>> },
    Fetched { generation: u64, id: DocId, result: Result<Option<Document>> },
    Stop(oneshot::Sender<()>),
    Inspect(oneshot::Sender<DriverSnapshot>),
}

struct Actor {
    state: DriverState,
    query: CursorDescription,
    source: Arc<dyn DocumentSource>,
    fetcher: Arc<dyn DocFetcher>,
    oplog: OplogHandle,
    fetch_slots: Arc<Semaphore>,
    listeners: Vec<ListenerHandle>,
    tx: mpsc::UnboundedSender<DriverEvent>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DriverEvent>) -> Result<()> {
        self.state.start();
        self.dispatch();
        while let Some(event) = rx.recv().await {
            let outcome = match event {
                DriverEvent::Oplog(n) => {
                    self.state.handle_notification(n);
                    Ok(())
                }
                DriverEvent::QueryDone { generation, result } => self.state.query_done(generation, result),
                DriverEvent::Fetched { generation, id, result } => self.state.fetched(generation, id, result),
                DriverEvent::Inspect(reply) => {
                    let _ = reply.send(self.state.snapshot());
                    Ok(())
                }
                DriverEvent::Stop(ack) => {
                    self.shutdown();
                    let _ = ack.send(());
                    return Ok(());
                }
            };
            if let Err(e) = outcome {
                tracing::error!(collection = %self.query.collection_name, error = %format!("{e:?}"), "observe driver failed");
                self.shutdown();
                return Err(e);
            }
            self.dispatch();
        }
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        for l in self.listeners.drain(..) {
            l.stop();
        }
        self.state.stop();
    }

    fn dispatch(&mut self) {
        for action in self.state.take_actions() {
            match action {
                Action::RunQuery { generation } => {
                    let source = self.source.clone();
                    let oplog = self.oplog.clone();
                    let query = self.query.clone();
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let result = source.find(&query).await;
                        // Everything written before the query returned must reach
                        // the inbox ahead of its result.
                        oplog.wait_until_caught_up().await;
                        let _ = tx.send(DriverEvent::QueryDone { generation, result });
                    });
                }
                Action::FetchRound { generation, ids } => {
                    tracing::debug!(collection = %self.query.collection_name, generation, count = ids.len(), "fetch round");
                    for (id, cache_key) in ids {
                        let fetcher = self.fetcher.clone();
                        let slots = self.fetch_slots.clone();
                        let collection = self.query.collection_name.clone();
                        let tx = self.tx.clone();
                        tokio::spawn(async move {
                            let Ok(_permit) = slots.acquire_owned().await else { return };
                            let result = fetcher.fetch(&collection, &id, &cache_key).await;
                            let _ = tx.send(DriverEvent::Fetched { generation, id, result });
                        });
                    }
                }
            }
        }
    }
}

/// Handle to a running observe driver. Dropping it stops the driver.
pub struct OplogObserveDriver {
    tx: mpsc::UnboundedSender<DriverEvent>,
    task: Option<JoinHandle<Result<()>>>,
}

impl OplogObserveDriver {
    /// Start observing. Fails for cursors the oplog path cannot follow; those
    /// need a polling observer instead.
    pub fn spawn(opts: DriverOptions) -> Result<Self> {
        if !cursor_supported(&opts.cursor) {
            return Err(Error::Matcher(format!(
                "cursor on '{}' cannot be observed through the oplog",
                opts.cursor.collection_name
            )));
        }
        let state = DriverState::new(&opts.cursor, opts.multiplexer)?;
        let mut query = opts.cursor.clone();
        query.options.fields = state.shared_fields().cloned();

        let (tx, rx) = mpsc::unbounded_channel();
        let trigger = Trigger {
            collection: opts.cursor.collection_name.clone(),
            id: opts.cursor.selector_id().and_then(DocId::from_bson),
        };
        let listener_tx = tx.clone();
        let listener = opts.oplog.on_oplog_entry(trigger, move |n| {
            let _ = listener_tx.send(DriverEvent::Oplog(n));
        });

        tracing::debug!(collection = %opts.cursor.collection_name, "starting oplog observe driver");
        let actor = Actor {
            state,
            query,
            source: opts.source,
            fetcher: opts.fetcher,
            oplog: opts.oplog,
            fetch_slots: Arc::new(Semaphore::new(opts.fetch_concurrency.max(1))),
            listeners: vec![listener],
            tx: tx.clone(),
        };
        let task = tokio::spawn(actor.run(rx));
        Ok(Self { tx, task: Some(task) })
    }

    /// Stop the driver. Once this returns no further multiplexer callbacks
    /// are made. Calling it again is a no-op.
    pub async fn stop(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(DriverEvent::Stop(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Current state, or `None` once the driver has exited.
    pub async fn snapshot(&self) -> Option<DriverSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(DriverEvent::Inspect(reply)).ok()?;
        rx.await.ok()
    }

    /// Wait for the driver task to exit; a fatal fetch or query error is returned here.
    pub async fn join(mut self) -> Result<()> {
        let Some(task) = self.task.take() else { return Ok(()) };
        task.await.map_err(|e| Error::Msg(format!("observe driver task: {e}")))?
    }
}

impl Drop for OplogObserveDriver {
    fn drop(&mut self) {
        let (ack, _) = oneshot::channel();
        let _ = self.tx.send(DriverEvent::Stop(ack));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::WriteFence;
    use crate::multiplex::ObserveEvent;
    use bson::{Bson, Timestamp, doc};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingMux {
        events: Mutex<Vec<ObserveEvent>>,
        held: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
        hold_flushes: bool,
    }

    impl RecordingMux {
        fn take(&self) -> Vec<ObserveEvent> {
            std::mem::take(&mut *self.events.lock())
        }

        fn release_flushes(&self) {
            let held = std::mem::take(&mut *self.held.lock());
            for f in held {
                f();
            }
        }
    }

    impl Multiplexer for RecordingMux {
        fn added(&self, id: &DocId, fields: Document) {
            self.events.lock().push(ObserveEvent::Added { id: id.clone(), fields });
        }
        fn changed(&self, id: &DocId, fields: Document) {
            self.events.lock().push(ObserveEvent::Changed { id: id.clone(), fields });
        }
        fn removed(&self, id: &DocId) {
            self.events.lock().push(ObserveEvent::Removed { id: id.clone() });
        }
        fn ready(&self) {
            self.events.lock().push(ObserveEvent::Ready);
        }
        fn on_flush(&self, f: Box<dyn FnOnce() + Send>) {
            if self.hold_flushes {
                self.held.lock().push(f);
            } else {
                f();
            }
        }
    }

    fn ts(i: u32) -> Timestamp {
        Timestamp { time: 7, increment: i }
    }

    fn entry(e: OplogEntry) -> OplogNotification {
        OplogNotification::Entry { entry: e, write: None }
    }

    fn id(s: &str) -> DocId {
        DocId::from(s)
    }

    /// A driver over `c` that has finished its initial query with `docs`.
    fn steady(selector: Document, docs: Vec<Document>) -> (DriverState, Arc<RecordingMux>) {
        steady_with(CursorDescription::new("c", selector), docs, RecordingMux::default())
    }

    fn steady_with(cursor: CursorDescription, docs: Vec<Document>, mux: RecordingMux) -> (DriverState, Arc<RecordingMux>) {
        let mux = Arc::new(mux);
        let mut st = DriverState::new(&cursor, mux.clone()).unwrap();
        st.start();
        assert_eq!(st.take_actions(), vec![Action::RunQuery { generation: 0 }]);
        st.query_done(0, Ok(docs)).unwrap();
        assert_eq!(st.phase(), Phase::Steady);
        mux.take();
        (st, mux)
    }

    #[test]
    fn initial_query_publishes_then_ready() {
        let mux = Arc::new(RecordingMux::default());
        let mut st = DriverState::new(&CursorDescription::new("c", doc! { "foo": 1 }), mux.clone()).unwrap();
        st.start();
        st.take_actions();
        st.query_done(0, Ok(vec![doc! { "_id": "A", "foo": 1, "x": "y" }])).unwrap();
        assert_eq!(
            mux.take(),
            vec![ObserveEvent::Added { id: id("A"), fields: doc! { "foo": 1, "x": "y" } }, ObserveEvent::Ready]
        );
        assert_eq!(st.phase(), Phase::Steady);
        assert!(st.take_actions().is_empty());
    }

    #[test]
    fn inserts_and_deletes_while_steady() {
        let (mut st, mux) = steady(doc! { "foo": 1 }, vec![]);
        st.handle_notification(entry(OplogEntry::insert("c", doc! { "_id": "A", "foo": 1 }, ts(1))));
        st.handle_notification(entry(OplogEntry::insert("c", doc! { "_id": "B", "foo": 2 }, ts(2))));
        st.handle_notification(entry(OplogEntry::delete("c", &id("B"), ts(3))));
        st.handle_notification(entry(OplogEntry::delete("c", &id("A"), ts(4))));
        assert_eq!(
            mux.take(),
            vec![
                ObserveEvent::Added { id: id("A"), fields: doc! { "foo": 1 } },
                ObserveEvent::Removed { id: id("A") },
            ]
        );
        assert!(st.take_actions().is_empty());
    }

    #[test]
    fn set_on_known_document_changes_without_fetch() {
        let (mut st, mux) = steady(doc! { "foo": 1 }, vec![doc! { "_id": "A", "foo": 1, "bar": 1 }]);
        st.handle_notification(entry(OplogEntry::update("c", &id("A"), doc! { "$set": { "bar": 2 } }, ts(1))));
        assert_eq!(mux.take(), vec![ObserveEvent::Changed { id: id("A"), fields: doc! { "bar": 2 } }]);
        assert!(st.take_actions().is_empty());
        assert_eq!(st.phase(), Phase::Steady);
    }

    #[test]
    fn set_that_breaks_the_match_removes_without_fetch() {
        let (mut st, mux) = steady(doc! { "foo": 1 }, vec![doc! { "_id": "A", "foo": 1 }]);
        st.handle_notification(entry(OplogEntry::update("c", &id("A"), doc! { "$set": { "foo": 2 } }, ts(1))));
        assert_eq!(mux.take(), vec![ObserveEvent::Removed { id: id("A") }]);
        assert!(st.take_actions().is_empty());
    }

    #[test]
    fn unset_reports_removed_field() {
        let (mut st, mux) = steady(doc! {}, vec![doc! { "_id": "A", "a": 1, "b": 2 }]);
        st.handle_notification(entry(OplogEntry::update("c", &id("A"), doc! { "$unset": { "b": true } }, ts(1))));
        assert_eq!(mux.take(), vec![ObserveEvent::Changed { id: id("A"), fields: doc! { "b": Bson::Undefined } }]);
    }

    #[test]
    fn replacement_is_evaluated_directly() {
        let (mut st, mux) = steady(doc! { "foo": 1 }, vec![]);
        st.handle_notification(entry(OplogEntry::update("c", &id("A"), doc! { "foo": 1, "v": 3 }, ts(1))));
        assert_eq!(mux.take(), vec![ObserveEvent::Added { id: id("A"), fields: doc! { "foo": 1, "v": 3 } }]);
        assert_eq!(st.snapshot().published[&id("A")].get("_id"), Some(&Bson::String("A".into())));
    }

    #[test]
    fn modifier_that_may_start_matching_fetches() {
        let (mut st, mux) = steady(doc! { "foo": 1 }, vec![]);
        st.handle_notification(entry(OplogEntry::update("c", &id("A"), doc! { "$set": { "foo": 1 } }, ts(5))));
        assert_eq!(st.phase(), Phase::Fetching);
        assert_eq!(
            st.take_actions(),
            vec![Action::FetchRound { generation: 1, ids: vec![(id("A"), "7:5".to_string())] }]
        );
        st.fetched(1, id("A"), Ok(Some(doc! { "_id": "A", "foo": 1, "other": true }))).unwrap();
        assert_eq!(mux.take(), vec![ObserveEvent::Added { id: id("A"), fields: doc! { "foo": 1, "other": true } }]);
        assert_eq!(st.phase(), Phase::Steady);
    }

    #[test]
    fn irrelevant_modifier_on_unknown_document_is_ignored() {
        let (mut st, mux) = steady(doc! { "foo": 1 }, vec![]);
        st.handle_notification(entry(OplogEntry::update("c", &id("A"), doc! { "$set": { "bar": 1 } }, ts(1))));
        assert!(st.take_actions().is_empty());
        assert!(mux.take().is_empty());
        assert_eq!(st.phase(), Phase::Steady);
    }

    #[test]
    fn custom_encoded_fields_force_a_fetch() {
        let (mut st, _mux) = steady(doc! {}, vec![doc! { "_id": "A", "d": 1 }]);
        st.handle_notification(entry(OplogEntry::update(
            "c",
            &id("A"),
            doc! { "$set": { "d": { "EJSON$type": "x", "EJSON$value": 1 } } },
            ts(1),
        )));
        assert!(matches!(st.take_actions().as_slice(), [Action::FetchRound { .. }]));
    }

    #[test]
    fn entries_during_query_are_fetched_afterwards() {
        let mux = Arc::new(RecordingMux::default());
        let mut st = DriverState::new(&CursorDescription::new("c", doc! { "foo": 1 }), mux.clone()).unwrap();
        st.start();
        st.take_actions();
        st.handle_notification(entry(OplogEntry::insert("c", doc! { "_id": "B", "foo": 1 }, ts(1))));
        st.handle_notification(entry(OplogEntry::update("c", &id("B"), doc! { "$set": { "n": 1 } }, ts(2))));
        assert_eq!(st.snapshot().need_to_fetch, vec![id("B")]);

        st.query_done(0, Ok(vec![doc! { "_id": "A", "foo": 1 }])).unwrap();
        assert_eq!(st.phase(), Phase::Fetching);
        assert_eq!(
            st.take_actions(),
            vec![Action::FetchRound { generation: 1, ids: vec![(id("B"), "7:2".to_string())] }]
        );
        st.fetched(1, id("B"), Ok(Some(doc! { "_id": "B", "foo": 1, "n": 1 }))).unwrap();
        assert_eq!(st.phase(), Phase::Steady);
        let events = mux.take();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1], ObserveEvent::Ready);
    }

    #[test]
    fn writes_while_fetching_are_refetched_in_the_next_round() {
        let (mut st, _mux) = steady(doc! { "foo": 1 }, vec![]);
        st.handle_notification(entry(OplogEntry::update("c", &id("A"), doc! { "$set": { "foo": 1 } }, ts(1))));
        st.take_actions();
        st.handle_notification(entry(OplogEntry::update("c", &id("A"), doc! { "$set": { "foo": 1 } }, ts(2))));
        assert!(st.take_actions().is_empty());

        st.fetched(1, id("A"), Ok(None)).unwrap();
        assert_eq!(st.phase(), Phase::Fetching);
        assert_eq!(
            st.take_actions(),
            vec![Action::FetchRound { generation: 2, ids: vec![(id("A"), "7:2".to_string())] }]
        );
    }

    #[test]
    fn stale_fetch_results_are_dropped_after_requery() {
        let (mut st, mux) = steady(doc! { "foo": 1 }, vec![]);
        st.handle_notification(entry(OplogEntry::update("c", &id("A"), doc! { "$set": { "foo": 1 } }, ts(1))));
        st.take_actions();
        st.handle_notification(OplogNotification::DropCollection { collection: "c".into(), write: None });
        assert_eq!(st.phase(), Phase::Querying);
        assert_eq!(st.take_actions(), vec![Action::RunQuery { generation: 2 }]);

        st.fetched(1, id("A"), Ok(Some(doc! { "_id": "A", "foo": 1 }))).unwrap();
        st.fetched(1, id("A"), Err(Error::Fetch("late".into()))).unwrap();
        assert!(mux.take().is_empty());

        st.query_done(2, Ok(vec![])).unwrap();
        assert_eq!(st.phase(), Phase::Steady);
    }

    #[test]
    fn drop_during_query_requeries_once_afterwards() {
        let mux = Arc::new(RecordingMux::default());
        let mut st = DriverState::new(&CursorDescription::new("c", doc! {}), mux.clone()).unwrap();
        st.start();
        st.take_actions();
        for _ in 0..3 {
            st.handle_notification(OplogNotification::DropCollection { collection: "c".into(), write: None });
        }
        assert!(st.take_actions().is_empty());

        st.query_done(0, Ok(vec![doc! { "_id": "A" }, doc! { "_id": "B" }])).unwrap();
        assert_eq!(st.take_actions(), vec![Action::RunQuery { generation: 1 }]);
        assert_eq!(st.phase(), Phase::Querying);

        st.query_done(1, Ok(vec![doc! { "_id": "B", "v": 1 }])).unwrap();
        assert_eq!(st.phase(), Phase::Steady);
        assert_eq!(
            mux.take(),
            vec![
                ObserveEvent::Added { id: id("A"), fields: doc! {} },
                ObserveEvent::Added { id: id("B"), fields: doc! {} },
                ObserveEvent::Ready,
                ObserveEvent::Removed { id: id("A") },
                ObserveEvent::Changed { id: id("B"), fields: doc! { "v": 1 } },
            ]
        );
    }

    #[test]
    fn fetch_error_is_fatal_once_the_round_ends() {
        let mux = Arc::new(RecordingMux::default());
        let mut st = DriverState::new(&CursorDescription::new("c", doc! { "foo": 1 }), mux).unwrap();
        st.start();
        st.handle_notification(entry(OplogEntry::insert("c", doc! { "_id": "A", "foo": 1 }, ts(1))));
        st.handle_notification(entry(OplogEntry::insert("c", doc! { "_id": "B", "foo": 1 }, ts(2))));
        st.query_done(0, Ok(vec![])).unwrap();
        assert!(matches!(st.take_actions().as_slice(), [_, Action::FetchRound { generation: 1, ids }] if ids.len() == 2));
        st.fetched(1, id("A"), Err(Error::Fetch("boom".into()))).unwrap();
        let err = st.fetched(1, id("B"), Ok(None)).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn fenced_writes_commit_only_when_steady_and_flushed() {
        let (mut st, mux) = steady_with(
            CursorDescription::new("c", doc! { "foo": 1 }),
            vec![],
            RecordingMux { hold_flushes: true, ..Default::default() },
        );
        let fence = WriteFence::new();
        st.handle_notification(OplogNotification::Entry {
            entry: OplogEntry::update("c", &id("A"), doc! { "$set": { "foo": 1 } }, ts(1)),
            write: Some(fence.begin_write()),
        });
        fence.arm();
        assert_eq!(st.phase(), Phase::Fetching);
        assert!(!fence.fired());

        st.take_actions();
        st.fetched(1, id("A"), Ok(Some(doc! { "_id": "A", "foo": 1 }))).unwrap();
        assert_eq!(st.phase(), Phase::Steady);
        assert!(!fence.fired());
        mux.release_flushes();
        assert!(fence.fired());
    }

    #[test]
    fn stop_commits_pending_writes_and_silences_callbacks() {
        let mux = Arc::new(RecordingMux::default());
        let mut st = DriverState::new(&CursorDescription::new("c", doc! {}), mux.clone()).unwrap();
        st.start();
        let fence = WriteFence::new();
        st.handle_notification(OplogNotification::Entry {
            entry: OplogEntry::insert("c", doc! { "_id": "A" }, ts(1)),
            write: Some(fence.begin_write()),
        });
        fence.arm();
        assert!(!fence.fired());

        st.stop();
        st.stop();
        assert!(fence.fired());
        st.query_done(0, Ok(vec![doc! { "_id": "A" }])).unwrap();
        st.handle_notification(entry(OplogEntry::insert("c", doc! { "_id": "B" }, ts(2))));
        assert!(mux.take().is_empty());
        assert!(st.snapshot().stopped);
    }

    #[test]
    fn projection_hides_fields_but_selector_still_sees_them() {
        let cursor = CursorDescription::new("c", doc! { "foo": 1 }).with_fields(doc! { "title": 1 });
        let (mut st, mux) = steady_with(cursor, vec![doc! { "_id": "A", "foo": 1, "title": "t", "secret": 1 }], RecordingMux::default());
        assert_eq!(st.shared_fields(), Some(&doc! { "title": 1, "foo": 1 }));
        assert_eq!(st.snapshot().published[&id("A")], doc! { "_id": "A", "foo": 1, "title": "t" });

        st.handle_notification(entry(OplogEntry::update("c", &id("A"), doc! { "$set": { "secret": 2 } }, ts(1))));
        assert!(mux.take().is_empty());

        st.handle_notification(entry(OplogEntry::update("c", &id("A"), doc! { "$set": { "foo": 3 } }, ts(2))));
        assert_eq!(mux.take(), vec![ObserveEvent::Removed { id: id("A") }]);
    }
}
