//! Subscription sets that are recomputed as a whole.
//!
//! Each run of the closure declares the subscriptions it wants through a
//! [`SubscriptionScope`]. On rerun the new set is subscribed before the old
//! handles are stopped, so subscriptions present in both runs are never torn
//! down on the server.

use serde_json::Value;

use crate::connection::{Connection, SubscribeCallbacks, SubscriptionHandle};

pub struct SubscriptionScope<'a> {
    connection: &'a Connection,
    captured: Vec<SubscriptionHandle>,
}

impl SubscriptionScope<'_> {
    pub fn subscribe(&mut self, name: &str, params: Vec<Value>, callbacks: SubscribeCallbacks) -> &SubscriptionHandle {
        let handle = self.connection.subscribe(name, params, callbacks);
        self.captured.push(handle);
        &self.captured[self.captured.len() - 1]
    }
}

pub struct AutoSubscription<F>
where
    F: FnMut(&mut SubscriptionScope<'_>),
{
    connection: Connection,
    func: F,
    handles: Vec<SubscriptionHandle>,
}

impl<F> AutoSubscription<F>
where
    F: FnMut(&mut SubscriptionScope<'_>),
{
    pub fn start(connection: Connection, func: F) -> Self {
        let mut this = Self { connection, func, handles: Vec::new() };
        this.handles = this.capture();
        this
    }

    fn capture(&mut self) -> Vec<SubscriptionHandle> {
        let mut scope = SubscriptionScope { connection: &self.connection, captured: Vec::new() };
        (self.func)(&mut scope);
        scope.captured
    }

    /// Recompute the subscription set.
    pub fn rerun(&mut self) {
        let fresh = self.capture();
        let old = std::mem::replace(&mut self.handles, fresh);
        tracing::debug!(kept = self.handles.len(), released = old.len(), "resubscribed");
        for h in old {
            h.stop();
        }
    }

    pub fn handles(&self) -> &[SubscriptionHandle] {
        &self.handles
    }

    pub fn stop(self) {}
}

impl<F> Drop for AutoSubscription<F>
where
    F: FnMut(&mut SubscriptionScope<'_>),
{
    fn drop(&mut self) {
        for h in self.handles.drain(..) {
            h.stop();
        }
    }
}
