use bson::Document;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::doc_id::DocId;
use crate::error::{Error, Result};
use crate::source::DocumentSource;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Retrieves the current version of a document. Concurrent requests with the
/// same cache key for the same id may be served by one read.
pub trait DocFetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, collection: &'a str, id: &'a DocId, cache_key: &'a str) -> BoxFuture<'a, Result<Option<Document>>>;
}

type FetchKey = (String, DocId, String);
type Shared = std::result::Result<Option<Document>, String>;

/// Fetcher that coalesces identical in-flight requests onto one source read.
pub struct CoalescingFetcher {
    source: Arc<dyn DocumentSource>,
    in_flight: Mutex<HashMap<FetchKey, Vec<oneshot::Sender<Shared>>>>,
}

impl CoalescingFetcher {
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        Self { source, in_flight: Mutex::new(HashMap::new()) }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    #[cfg(test)]
    fn waiting(&self) -> usize {
        self.in_flight.lock().values().map(Vec::len).sum()
    }
}

/// Owns the in-flight entry of the leading read. Dropping it before
/// `finish` removes the entry, and the dropped senders wake any waiters.
struct LeadGuard<'a> {
    in_flight: &'a Mutex<HashMap<FetchKey, Vec<oneshot::Sender<Shared>>>>,
    key: Option<FetchKey>,
}

impl LeadGuard<'_> {
    fn finish(mut self) -> Vec<oneshot::Sender<Shared>> {
        match self.key.take() {
            Some(key) => self.in_flight.lock().remove(&key).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl Drop for LeadGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.in_flight.lock().remove(&key);
        }
    }
}

impl DocFetcher for CoalescingFetcher {
    fn fetch<'a>(&'a self, collection: &'a str, id: &'a DocId, cache_key: &'a str) -> BoxFuture<'a, Result<Option<Document>>> {
        Box::pin(async move {
            let key: FetchKey = (collection.to_string(), id.clone(), cache_key.to_string());
            let waiter = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get_mut(&key) {
                    Some(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        in_flight.insert(key.clone(), Vec::new());
                        None
                    }
                }
            };
            if let Some(rx) = waiter {
                tracing::trace!(collection, id = %id, cache_key, "joined in-flight fetch");
                return match rx.await {
                    Ok(shared) => shared.map_err(Error::Fetch),
                    Err(_) => Err(Error::Fetch("in-flight fetch abandoned".into())),
                };
            }

            let lead = LeadGuard { in_flight: &self.in_flight, key: Some(key) };
            let result = self.source.find_one(collection, id).await;
            for tx in lead.finish() {
                let shared = match &result {
                    Ok(doc) => Ok(doc.clone()),
                    Err(e) => Err(e.to_string()),
                };
                let _ = tx.send(shared);
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::CursorDescription;
    use bson::doc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct SlowSource {
        reads: AtomicUsize,
        gate: Notify,
    }

    impl DocumentSource for SlowSource {
        fn find<'a>(&'a self, _cursor: &'a CursorDescription) -> BoxFuture<'a, Result<Vec<Document>>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn find_one<'a>(&'a self, _collection: &'a str, id: &'a DocId) -> BoxFuture<'a, Result<Option<Document>>> {
            Box::pin(async move {
                self.reads.fetch_add(1, Ordering::SeqCst);
                self.gate.notified().await;
                Ok(Some(doc! { "_id": id.to_bson(), "v": 1 }))
            })
        }
    }

    #[tokio::test]
    async fn cancelled_leader_releases_waiters_and_key() {
        let source = Arc::new(SlowSource { reads: AtomicUsize::new(0), gate: Notify::new() });
        let fetcher = Arc::new(CoalescingFetcher::new(source.clone()));
        let id = DocId::from("a");

        let leader = {
            let fetcher = fetcher.clone();
            let id = id.clone();
            tokio::spawn(async move { fetcher.fetch("c", &id, "1:1").await })
        };
        while source.reads.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let follower = {
            let fetcher = fetcher.clone();
            let id = id.clone();
            tokio::spawn(async move { fetcher.fetch("c", &id, "1:1").await })
        };
        while fetcher.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());
        let err = follower.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("abandoned"));
        assert_eq!(fetcher.in_flight(), 0);

        // The key is free again: the next fetch leads a fresh read.
        let again = {
            let fetcher = fetcher.clone();
            let id = id.clone();
            tokio::spawn(async move { fetcher.fetch("c", &id, "1:1").await })
        };
        while source.reads.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        source.gate.notify_one();
        assert!(again.await.unwrap().unwrap().is_some());
        assert_eq!(fetcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn same_key_is_read_once() {
        let source = Arc::new(SlowSource { reads: AtomicUsize::new(0), gate: Notify::new() });
        let fetcher = Arc::new(CoalescingFetcher::new(source.clone()));
        let id = DocId::from("a");

        let f1 = {
            let fetcher = fetcher.clone();
            let id = id.clone();
            tokio::spawn(async move { fetcher.fetch("c", &id, "1:1").await })
        };
        while fetcher.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        let f2 = {
            let fetcher = fetcher.clone();
            let id = id.clone();
            tokio::spawn(async move { fetcher.fetch("c", &id, "1:1").await })
        };
        while source.reads.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        while fetcher.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        source.gate.notify_one();

        let a = f1.await.unwrap().unwrap().unwrap();
        let b = f2.await.unwrap().unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(source.reads.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.in_flight(), 0);
    }
}
