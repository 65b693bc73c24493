//! Client side of a DDP connection.
//!
//! Methods are multiplexed over one stream with an optional wait barrier.
//! Server data is buffered until every sent method has its data and every
//! pending subscription is ready, then applied to all stores in one bracketed
//! batch. Subscriptions are deduplicated by name and params and refcounted.
//! Reconnects resume the session or reset stores atomically with the new data.
//!
//! All state lives behind one lock. Public entry points collect user
//! callbacks while holding it and run them after it is released, so
//! callbacks and method stubs may call back into the connection.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::ids;
use crate::invocation::MethodInvocation;
use crate::protocol::{self, ClientMessage, DataMessage, MethodError, ServerMessage};
use crate::store::Store;
use crate::stream::Stream;

pub type MethodResult = std::result::Result<Value, MethodError>;
pub type MethodCallback = Box<dyn FnOnce(MethodResult) + Send>;
pub type MethodHandler = Arc<dyn Fn(&MethodInvocation, Vec<Value>) -> MethodResult + Send + Sync>;
type Deferred = Box<dyn FnOnce() + Send>;
type ErrorCallback = Box<dyn FnOnce(MethodError) + Send>;

/// Wrap a closure as a method stub.
pub fn handler<F>(f: F) -> MethodHandler
where
    F: Fn(&MethodInvocation, Vec<Value>) -> MethodResult + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Default)]
pub struct ApplyOptions {
    /// Hold back every later method until this one has completed.
    pub wait: bool,
    /// Called as soon as the result arrives, before the data is visible.
    pub on_result_received: Option<MethodCallback>,
}

impl ApplyOptions {
    pub fn wait() -> Self {
        Self { wait: true, on_result_received: None }
    }
}

#[derive(Default)]
pub struct SubscribeCallbacks {
    pub on_ready: Option<Deferred>,
    pub on_error: Option<ErrorCallback>,
}

impl SubscribeCallbacks {
    pub fn on_ready(f: impl FnOnce() + Send + 'static) -> Self {
        Self { on_ready: Some(Box::new(f)), on_error: None }
    }

    pub fn with_error(mut self, f: impl FnOnce(MethodError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

struct MethodInvoker {
    id: String,
    message: ClientMessage,
    wait: bool,
    callback: Option<MethodCallback>,
    on_result_received: Option<MethodCallback>,
    result: Option<MethodResult>,
    data_visible: bool,
}

impl MethodInvoker {
    fn finished(&self) -> bool {
        self.result.is_some() && self.data_visible
    }
}

struct Subscription {
    id: String,
    name: String,
    params: Vec<Value>,
    refcount: usize,
    ready: bool,
    ready_callbacks: Vec<Deferred>,
    error_callbacks: Vec<ErrorCallback>,
}

enum PendingData {
    /// Clear every store before applying what follows.
    Reset,
    Data(DataMessage),
}

#[derive(Default)]
struct Effects(Vec<Deferred>);

impl Effects {
    fn defer(&mut self, f: impl FnOnce() + Send + 'static) {
        self.0.push(Box::new(f));
    }

    fn run(self) {
        for f in self.0 {
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                tracing::error!("connection callback panicked");
            }
        }
    }
}

struct ConnectionState {
    stream: Arc<dyn Stream>,
    stores: HashMap<String, Box<dyn Store>>,
    queued_by_collection: HashMap<String, Vec<DataMessage>>,
    method_handlers: HashMap<String, MethodHandler>,
    next_method_id: u64,
    /// Sent methods, in send order.
    outstanding_methods: VecDeque<MethodInvoker>,
    /// Methods held back by a wait barrier, in call order.
    blocked_methods: VecDeque<MethodInvoker>,
    unsatisfied_method_ids: HashSet<String>,
    unready_sub_ids: HashSet<String>,
    /// Methods whose result arrived but whose data died with the old session.
    revived_method_ids: HashSet<String>,
    pending_data: Vec<PendingData>,
    subscriptions: Vec<Subscription>,
    last_session_id: Option<String>,
    quiesce_callbacks: Vec<Deferred>,
}

impl ConnectionState {
    fn send(&self, msg: &ClientMessage) {
        match msg.to_json() {
            Ok(text) => self.stream.send(text),
            Err(e) => tracing::error!(error = %e, "failed to encode client message"),
        }
    }

    fn is_quiescent(&self) -> bool {
        self.unsatisfied_method_ids.is_empty() && self.unready_sub_ids.is_empty()
    }

    fn barrier_up(&self) -> bool {
        self.outstanding_methods.iter().any(|m| m.wait)
    }

    fn enqueue_method(&mut self, invoker: MethodInvoker) {
        if self.barrier_up() || !self.blocked_methods.is_empty() {
            tracing::debug!(id = %invoker.id, "method blocked behind wait barrier");
            self.blocked_methods.push_back(invoker);
        } else {
            self.send_method(invoker);
        }
    }

    fn send_method(&mut self, invoker: MethodInvoker) {
        self.send(&invoker.message);
        self.unsatisfied_method_ids.insert(invoker.id.clone());
        self.outstanding_methods.push_back(invoker);
    }

    /// Send blocked methods up to and including the next wait method.
    fn release_blocked(&mut self) {
        while let Some(invoker) = self.blocked_methods.pop_front() {
            let wait = invoker.wait;
            self.send_method(invoker);
            if wait {
                break;
            }
        }
    }

    /// Complete methods from the head of the queue while each has both its
    /// result and its data. Callbacks therefore fire in call order.
    fn retire_finished(&mut self, fx: &mut Effects) {
        while self.outstanding_methods.front().is_some_and(MethodInvoker::finished) {
            let Some(mut m) = self.outstanding_methods.pop_front() else { break };
            let result = m.result.take().unwrap_or(Ok(Value::Null));
            match m.callback.take() {
                Some(cb) => fx.defer(move || cb(result)),
                None => {
                    if let Err(e) = &result
                        && !e.expected
                    {
                        tracing::warn!(id = %m.id, error = %e, "method failed with no callback");
                    }
                }
            }
            if m.wait {
                self.release_blocked();
            }
        }
    }

    fn maybe_flush(&mut self, fx: &mut Effects) {
        if !self.is_quiescent() {
            return;
        }
        if !self.pending_data.is_empty() || !self.revived_method_ids.is_empty() {
            self.flush(fx);
        }
    }

    fn flush(&mut self, fx: &mut Effects) {
        let pending = std::mem::take(&mut self.pending_data);
        let mut ready_subs: HashSet<String> = HashSet::new();
        let mut visible: HashSet<String> = std::mem::take(&mut self.revived_method_ids);

        for store in self.stores.values_mut() {
            store.begin_update();
        }
        for item in pending {
            match item {
                PendingData::Reset => {
                    for store in self.stores.values_mut() {
                        store.reset();
                    }
                }
                PendingData::Data(msg) => {
                    ready_subs.extend(msg.subs.iter().cloned());
                    visible.extend(msg.methods.iter().cloned());
                    let Some(collection) = msg.collection.clone() else { continue };
                    match self.stores.get_mut(&collection) {
                        Some(store) => store.update(&msg),
                        None => self.queued_by_collection.entry(collection).or_default().push(msg),
                    }
                }
            }
        }
        for store in self.stores.values_mut() {
            store.end_update();
        }

        for sub in self.subscriptions.iter_mut().filter(|s| ready_subs.contains(&s.id)) {
            if !sub.ready {
                sub.ready = true;
                fx.0.extend(sub.ready_callbacks.drain(..));
            }
        }
        for m in self.outstanding_methods.iter_mut().filter(|m| visible.contains(&m.id)) {
            m.data_visible = true;
        }
        self.retire_finished(fx);
        fx.0.extend(self.quiesce_callbacks.drain(..));
    }

    fn on_connected(&mut self, session: String, fx: &mut Effects) {
        match self.last_session_id.replace(session.clone()) {
            None => tracing::info!(session = %session, "session established"),
            Some(prev) if prev == session => tracing::info!(session = %session, "session resumed"),
            Some(prev) => {
                tracing::info!(old = %prev, session = %session, "new session; stores reset with next data batch");
                self.queued_by_collection.clear();
                self.pending_data.clear();
                self.pending_data.push(PendingData::Reset);
                self.unready_sub_ids = self.subscriptions.iter().map(|s| s.id.clone()).collect();
                self.unsatisfied_method_ids =
                    self.outstanding_methods.iter().filter(|m| m.result.is_none()).map(|m| m.id.clone()).collect();
                self.revived_method_ids = self
                    .outstanding_methods
                    .iter()
                    .filter(|m| m.result.is_some() && !m.data_visible)
                    .map(|m| m.id.clone())
                    .collect();
                self.maybe_flush(fx);
            }
        }
    }

    fn on_result(&mut self, id: String, result: Option<Value>, error: Option<MethodError>, fx: &mut Effects) {
        let Some(m) = self.outstanding_methods.iter_mut().find(|m| m.id == id) else {
            tracing::warn!(id = %id, "result for unknown method");
            return;
        };
        if m.result.is_some() {
            tracing::warn!(id = %id, "duplicate result");
            return;
        }
        let outcome = match error {
            Some(e) => Err(e),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        if let Some(cb) = m.on_result_received.take() {
            let early = outcome.clone();
            fx.defer(move || cb(early));
        }
        m.result = Some(outcome);
        self.retire_finished(fx);
    }

    fn on_nosub(&mut self, id: String, error: Option<MethodError>, fx: &mut Effects) {
        let Some(pos) = self.subscriptions.iter().position(|s| s.id == id) else {
            tracing::debug!(id = %id, "nosub for unknown subscription");
            return;
        };
        let mut sub = self.subscriptions.remove(pos);
        self.unready_sub_ids.remove(&id);
        if let Some(err) = error {
            if sub.error_callbacks.is_empty() {
                tracing::warn!(sub = %sub.name, error = %err, "subscription failed");
            }
            for cb in sub.error_callbacks.drain(..) {
                let e = err.clone();
                fx.defer(move || cb(e));
            }
        }
        self.maybe_flush(fx);
    }

    fn on_data(&mut self, msg: DataMessage, fx: &mut Effects) {
        for s in &msg.subs {
            self.unready_sub_ids.remove(s);
        }
        for m in &msg.methods {
            self.unsatisfied_method_ids.remove(m);
        }
        self.pending_data.push(PendingData::Data(msg));
        self.maybe_flush(fx);
    }
}

#[derive(Clone)]
pub struct Connection {
    state: Arc<Mutex<ConnectionState>>,
}

impl Connection {
    pub fn new(stream: Arc<dyn Stream>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectionState {
                stream,
                stores: HashMap::new(),
                queued_by_collection: HashMap::new(),
                method_handlers: HashMap::new(),
                next_method_id: 0,
                outstanding_methods: VecDeque::new(),
                blocked_methods: VecDeque::new(),
                unsatisfied_method_ids: HashSet::new(),
                unready_sub_ids: HashSet::new(),
                revived_method_ids: HashSet::new(),
                pending_data: Vec::new(),
                subscriptions: Vec::new(),
                last_session_id: None,
                quiesce_callbacks: Vec::new(),
            })),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ConnectionState, &mut Effects) -> R) -> R {
        let mut fx = Effects::default();
        let out = {
            let mut st = self.state.lock();
            f(&mut st, &mut fx)
        };
        fx.run();
        out
    }

    /// Attach a store for `name`. Updates that arrived before registration
    /// are replayed into it as one batch. Returns false if one is already registered.
    pub fn register_store(&self, name: &str, mut store: Box<dyn Store>) -> bool {
        self.with_state(|st, _| {
            if st.stores.contains_key(name) {
                tracing::warn!(collection = name, "store already registered");
                return false;
            }
            if let Some(queued) = st.queued_by_collection.remove(name) {
                tracing::debug!(collection = name, count = queued.len(), "replaying queued updates");
                store.begin_update();
                for msg in &queued {
                    store.update(msg);
                }
                store.end_update();
            }
            st.stores.insert(name.to_string(), store);
            true
        })
    }

    /// Register method stubs. Fails without registering anything if a name
    /// is already taken.
    pub fn methods(&self, handlers: impl IntoIterator<Item = (String, MethodHandler)>) -> Result<()> {
        let handlers: Vec<(String, MethodHandler)> = handlers.into_iter().collect();
        self.with_state(|st, _| {
            let mut seen = HashSet::new();
            for (name, _) in &handlers {
                if st.method_handlers.contains_key(name) || !seen.insert(name.as_str()) {
                    return Err(Error::Msg(format!("A method named '{name}' is already defined")));
                }
            }
            st.method_handlers.extend(handlers);
            Ok(())
        })
    }

    /// Invoke a method. Its stub, if any, runs first as a simulation. The
    /// callback fires once the result has arrived and the method's writes
    /// are visible in the stores.
    pub fn apply(
        &self,
        name: &str,
        args: Vec<Value>,
        options: ApplyOptions,
        callback: Option<MethodCallback>,
    ) -> Option<MethodResult> {
        self.apply_in(None, name, args, options, callback)
    }

    pub(crate) fn apply_in(
        &self,
        enclosing: Option<&MethodInvocation>,
        name: &str,
        args: Vec<Value>,
        options: ApplyOptions,
        callback: Option<MethodCallback>,
    ) -> Option<MethodResult> {
        let stub = self.state.lock().method_handlers.get(name).cloned();

        if enclosing.is_some_and(MethodInvocation::is_simulation) {
            // Called from inside a stub: simulate only.
            let result = match stub {
                Some(stub) => stub(&MethodInvocation::simulation(self.clone()), args),
                None => Ok(Value::Null),
            };
            return match callback {
                Some(cb) => {
                    cb(result);
                    None
                }
                None => Some(result),
            };
        }

        if let Some(stub) = stub {
            let invocation = MethodInvocation::simulation(self.clone());
            if let Err(e) = stub(&invocation, args.clone())
                && !e.expected
            {
                tracing::warn!(method = name, error = %e, "exception while simulating the effect of invoking method");
            }
        }

        let ApplyOptions { wait, on_result_received } = options;
        self.with_state(|st, _| {
            st.next_method_id += 1;
            let id = st.next_method_id.to_string();
            tracing::debug!(method = name, id = %id, wait, "apply");
            st.enqueue_method(MethodInvoker {
                id: id.clone(),
                message: ClientMessage::Method { method: name.to_string(), params: args, id },
                wait,
                callback,
                on_result_received,
                result: None,
                data_visible: false,
            });
        });
        None
    }

    /// Invoke a method and wait for its callback.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> MethodResult {
        self.call_with(name, args, ApplyOptions::default()).await
    }

    pub async fn call_with(&self, name: &str, args: Vec<Value>, options: ApplyOptions) -> MethodResult {
        let (tx, rx) = oneshot::channel();
        let _ = self.apply(
            name,
            args,
            options,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        rx.await
            .unwrap_or_else(|_| Err(MethodError::new("connection-closed", "connection dropped before the method completed")))
    }

    /// Subscribe to a server publication. Identical name and params share one
    /// server-side subscription.
    pub fn subscribe(&self, name: &str, params: Vec<Value>, callbacks: SubscribeCallbacks) -> SubscriptionHandle {
        let SubscribeCallbacks { on_ready, on_error } = callbacks;
        let id = self.with_state(|st, fx| {
            if let Some(sub) = st.subscriptions.iter_mut().find(|s| s.name == name && s.params == params) {
                sub.refcount += 1;
                if let Some(cb) = on_ready {
                    if sub.ready {
                        fx.0.push(cb);
                    } else {
                        sub.ready_callbacks.push(cb);
                    }
                }
                sub.error_callbacks.extend(on_error);
                tracing::debug!(sub = name, id = %sub.id, refcount = sub.refcount, "reusing subscription");
                return sub.id.clone();
            }
            let id = ids::random_id();
            st.send(&ClientMessage::Sub { id: id.clone(), name: name.to_string(), params: params.clone() });
            st.unready_sub_ids.insert(id.clone());
            st.subscriptions.push(Subscription {
                id: id.clone(),
                name: name.to_string(),
                params,
                refcount: 1,
                ready: false,
                ready_callbacks: on_ready.into_iter().collect(),
                error_callbacks: on_error.into_iter().collect(),
            });
            tracing::debug!(sub = name, id = %id, "subscribe");
            id
        });
        SubscriptionHandle { id, connection: self.clone(), stopped: AtomicBool::new(false) }
    }

    fn release_subscription(&self, id: &str) {
        self.with_state(|st, fx| {
            let Some(pos) = st.subscriptions.iter().position(|s| s.id == id) else { return };
            st.subscriptions[pos].refcount -= 1;
            if st.subscriptions[pos].refcount > 0 {
                return;
            }
            let sub = st.subscriptions.remove(pos);
            tracing::debug!(sub = %sub.name, id = %sub.id, "unsubscribe");
            st.send(&ClientMessage::Unsub { id: sub.id.clone() });
            st.unready_sub_ids.remove(&sub.id);
            st.maybe_flush(fx);
        })
    }

    fn sub_ready(&self, id: &str) -> bool {
        self.state.lock().subscriptions.iter().any(|s| s.id == id && s.ready)
    }

    /// Stop every subscription regardless of refcount.
    pub fn unsubscribe_all(&self) {
        self.with_state(|st, fx| {
            for sub in std::mem::take(&mut st.subscriptions) {
                st.send(&ClientMessage::Unsub { id: sub.id });
            }
            st.unready_sub_ids.clear();
            st.maybe_flush(fx);
        })
    }

    /// Run `f` once all pending data has been applied.
    pub fn on_quiesce(&self, f: impl FnOnce() + Send + 'static) {
        self.with_state(|st, fx| {
            if st.is_quiescent() && st.pending_data.is_empty() {
                fx.defer(f);
            } else {
                st.quiesce_callbacks.push(Box::new(f));
            }
        })
    }

    /// Feed one raw frame received from the server.
    pub fn on_message(&self, raw: &str) {
        let msg = match protocol::parse_server_message(raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "discarding unparseable message");
                return;
            }
        };
        self.with_state(|st, fx| match msg {
            ServerMessage::Connected { session } => st.on_connected(session, fx),
            ServerMessage::Result { id, result, error } => st.on_result(id, result, error, fx),
            ServerMessage::Nosub { id, error } => st.on_nosub(id, error, fx),
            ServerMessage::Data(data) => st.on_data(data, fx),
            ServerMessage::Error { reason, offending_message } => {
                tracing::warn!(reason = %reason, offending = ?offending_message, "server reported an error")
            }
        })
    }

    /// The transport (re)connected: send `connect`, then every method still
    /// waiting for a result, then every live subscription.
    pub fn on_reset(&self) {
        self.with_state(|st, _| {
            st.send(&ClientMessage::Connect { session: st.last_session_id.clone() });
            let mut resent = 0usize;
            for m in st.outstanding_methods.iter().filter(|m| m.result.is_none()) {
                st.send(&m.message);
                resent += 1;
            }
            for sub in &st.subscriptions {
                st.send(&ClientMessage::Sub { id: sub.id.clone(), name: sub.name.clone(), params: sub.params.clone() });
            }
            tracing::info!(
                session = ?st.last_session_id,
                methods = resent,
                blocked = st.blocked_methods.len(),
                subs = st.subscriptions.len(),
                "reconnecting"
            );
        })
    }

    pub fn is_quiescent(&self) -> bool {
        self.state.lock().is_quiescent()
    }

    pub fn outstanding_method_count(&self) -> usize {
        self.state.lock().outstanding_methods.len()
    }

    pub fn blocked_method_count(&self) -> usize {
        self.state.lock().blocked_methods.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn last_session_id(&self) -> Option<String> {
        self.state.lock().last_session_id.clone()
    }
}

pub struct SubscriptionHandle {
    id: String,
    connection: Connection,
    stopped: AtomicBool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ready(&self) -> bool {
        self.connection.sub_ready(&self.id)
    }

    /// Release this handle's reference. Repeated calls are no-ops.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.connection.release_subscription(&self.id);
        }
    }
}
