//! Write fences: a writer arms the fence after its writes, and callbacks fire
//! once every observer that saw one of those writes has committed it.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct FenceState {
    armed: bool,
    fired: bool,
    outstanding: usize,
    callbacks: Vec<Callback>,
}

#[derive(Clone, Default)]
pub struct WriteFence {
    inner: Arc<Mutex<FenceState>>,
}

impl WriteFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one pending write. Writes begun after the fence fired are
    /// detached and commit into nothing.
    pub fn begin_write(&self) -> Write {
        let mut st = self.inner.lock();
        if st.fired {
            tracing::warn!("write begun on a fence that already fired");
            return Write { fence: None };
        }
        st.outstanding += 1;
        Write { fence: Some(self.clone()) }
    }

    pub fn on_all_committed(&self, f: impl FnOnce() + Send + 'static) {
        let mut st = self.inner.lock();
        if st.fired {
            drop(st);
            f();
        } else {
            st.callbacks.push(Box::new(f));
        }
    }

    pub fn arm(&self) {
        self.inner.lock().armed = true;
        self.maybe_fire();
    }

    /// Arm the fence and wait until it fires.
    pub async fn arm_and_wait(&self) {
        let (tx, rx) = oneshot::channel();
        self.on_all_committed(move || {
            let _ = tx.send(());
        });
        self.arm();
        let _ = rx.await;
    }

    pub fn fired(&self) -> bool {
        self.inner.lock().fired
    }

    fn commit_one(&self) {
        {
            let mut st = self.inner.lock();
            st.outstanding = st.outstanding.saturating_sub(1);
        }
        self.maybe_fire();
    }

    fn maybe_fire(&self) {
        let callbacks = {
            let mut st = self.inner.lock();
            if !st.armed || st.fired || st.outstanding > 0 {
                return;
            }
            st.fired = true;
            std::mem::take(&mut st.callbacks)
        };
        for cb in callbacks {
            cb();
        }
    }
}

/// One observer's share of a fenced write. Committed explicitly, or on drop.
pub struct Write {
    fence: Option<WriteFence>,
}

impl Write {
    pub fn committed(mut self) {
        if let Some(fence) = self.fence.take() {
            fence.commit_one();
        }
    }
}

impl Drop for Write {
    fn drop(&mut self) {
        if let Some(fence) = self.fence.take() {
            fence.commit_one();
        }
    }
}
