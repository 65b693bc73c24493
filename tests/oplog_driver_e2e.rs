use bson::{Document, doc};
use livedata::cursor::CursorDescription;
use livedata::doc_id::DocId;
use livedata::error::{Error, Result};
use livedata::fence::WriteFence;
use livedata::fetcher::{BoxFuture, CoalescingFetcher, DocFetcher};
use livedata::multiplex::{ChannelMultiplexer, ObserveEvent};
use livedata::oplog::{DriverOptions, DriverSnapshot, OplogHandle, OplogObserveDriver, Phase};
use livedata::source::{DocumentSource, MemorySource};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Memory source that counts point reads.
struct CountingSource {
    inner: Arc<MemorySource>,
    fetches: AtomicUsize,
}

impl DocumentSource for CountingSource {
    fn find<'a>(&'a self, cursor: &'a CursorDescription) -> BoxFuture<'a, Result<Vec<Document>>> {
        self.inner.find(cursor)
    }

    fn find_one<'a>(&'a self, collection: &'a str, id: &'a DocId) -> BoxFuture<'a, Result<Option<Document>>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.find_one(collection, id)
    }
}

struct FailingFetcher;

impl DocFetcher for FailingFetcher {
    fn fetch<'a>(&'a self, _collection: &'a str, _id: &'a DocId, _cache_key: &'a str) -> BoxFuture<'a, Result<Option<Document>>> {
        Box::pin(async { Err(Error::Postgres("connection refused".into())) })
    }
}

struct Harness {
    oplog: OplogHandle,
    data: Arc<MemorySource>,
    source: Arc<CountingSource>,
    multiplexer: Arc<ChannelMultiplexer>,
    events: UnboundedReceiver<ObserveEvent>,
    driver: OplogObserveDriver,
}

impl Harness {
    fn start(cursor: CursorDescription, seed: Vec<Document>) -> Self {
        Self::start_with(cursor, seed, None)
    }

    fn start_with(cursor: CursorDescription, seed: Vec<Document>, fetcher: Option<Arc<dyn DocFetcher>>) -> Self {
        let (oplog, _tailer) = OplogHandle::start();
        let data = Arc::new(MemorySource::new(Some(oplog.clone())));
        for d in seed {
            data.put_silently(&cursor.collection_name, d).unwrap();
        }
        let source = Arc::new(CountingSource { inner: data.clone(), fetches: AtomicUsize::new(0) });
        let multiplexer = Arc::new(ChannelMultiplexer::new());
        let events = multiplexer.add_handle();
        let fetcher: Arc<dyn DocFetcher> = match fetcher {
            Some(f) => f,
            None => Arc::new(CoalescingFetcher::new(source.clone())),
        };
        let driver = OplogObserveDriver::spawn(DriverOptions {
            cursor,
            source: source.clone(),
            fetcher,
            oplog: oplog.clone(),
            multiplexer: multiplexer.clone(),
            fetch_concurrency: 4,
        })
        .unwrap();
        Self { oplog, data, source, multiplexer, events, driver }
    }

    async fn settle(&self) -> DriverSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            self.oplog.wait_until_caught_up().await;
            loop {
                let snap = self.driver.snapshot().await.expect("driver running");
                if snap.phase == Phase::Steady {
                    return snap;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("driver did not settle")
    }

    fn take_events(&mut self) -> Vec<ObserveEvent> {
        let mut out = Vec::new();
        while let Ok(e) = self.events.try_recv() {
            out.push(e);
        }
        out
    }

    fn fetches(&self) -> usize {
        self.source.fetches.load(Ordering::SeqCst)
    }
}

fn id(s: &str) -> DocId {
    DocId::from(s)
}

#[tokio::test]
async fn initial_results_then_inserts_and_deletes() {
    let mut h = Harness::start(
        CursorDescription::new("c", doc! { "foo": 1 }),
        vec![doc! { "_id": "A", "foo": 1 }, doc! { "_id": "Z", "foo": 9 }],
    );
    h.settle().await;
    assert_eq!(h.take_events(), vec![ObserveEvent::Added { id: id("A"), fields: doc! { "foo": 1 } }, ObserveEvent::Ready]);

    h.data.insert("c", doc! { "_id": "B", "foo": 1 }, None).unwrap();
    h.data.insert("c", doc! { "_id": "C", "foo": 2 }, None).unwrap();
    h.data.remove("c", &id("A"), None).unwrap();
    h.settle().await;
    assert_eq!(
        h.take_events(),
        vec![ObserveEvent::Added { id: id("B"), fields: doc! { "foo": 1 } }, ObserveEvent::Removed { id: id("A") }]
    );
    assert_eq!(h.fetches(), 0);
}

#[tokio::test]
async fn set_on_published_document_changes_without_fetch() {
    let mut h = Harness::start(CursorDescription::new("c", doc! { "foo": 1 }), vec![doc! { "_id": "A", "foo": 1, "n": 1 }]);
    h.settle().await;
    h.take_events();

    h.data.update("c", &id("A"), &doc! { "$set": { "n": 2 } }, None).unwrap();
    h.settle().await;
    assert_eq!(h.take_events(), vec![ObserveEvent::Changed { id: id("A"), fields: doc! { "n": 2 } }]);
    assert_eq!(h.fetches(), 0);
}

#[tokio::test]
async fn set_that_stops_matching_removes_without_fetch() {
    let mut h = Harness::start(CursorDescription::new("c", doc! { "foo": 1 }), vec![doc! { "_id": "A", "foo": 1 }]);
    h.settle().await;
    h.take_events();

    h.data.update("c", &id("A"), &doc! { "$set": { "foo": 2 } }, None).unwrap();
    let snap = h.settle().await;
    assert_eq!(h.take_events(), vec![ObserveEvent::Removed { id: id("A") }]);
    assert!(snap.published.is_empty());
    assert_eq!(h.fetches(), 0);
}

#[tokio::test]
async fn modifier_on_unknown_document_is_resolved_by_fetch() {
    let mut h = Harness::start(CursorDescription::new("c", doc! { "foo": 1 }), vec![doc! { "_id": "A", "foo": 2, "x": 1 }]);
    h.settle().await;
    assert_eq!(h.take_events(), vec![ObserveEvent::Ready]);

    h.data.update("c", &id("A"), &doc! { "$set": { "foo": 1 } }, None).unwrap();
    h.settle().await;
    assert_eq!(h.take_events(), vec![ObserveEvent::Added { id: id("A"), fields: doc! { "foo": 1, "x": 1 } }]);
    assert_eq!(h.fetches(), 1);
}

#[tokio::test]
async fn fenced_write_is_visible_when_the_fence_fires() {
    let h = Harness::start(CursorDescription::new("c", doc! { "foo": 1 }), vec![]);
    h.settle().await;

    let fence = WriteFence::new();
    h.data.insert("c", doc! { "_id": "A", "foo": 1 }, Some(&fence)).unwrap();
    h.data.update("c", &id("A"), &doc! { "$inc": { "n": 1 } }, Some(&fence)).unwrap();
    tokio::time::timeout(Duration::from_secs(5), fence.arm_and_wait()).await.unwrap();
    assert_eq!(h.multiplexer.snapshot().get(&id("A")), Some(&doc! { "foo": 1, "n": 1 }));
}

#[tokio::test]
async fn drop_collection_forces_a_requery() {
    let mut h = Harness::start(CursorDescription::new("c", doc! {}), vec![doc! { "_id": "A" }]);
    h.settle().await;
    h.take_events();

    // Changes the oplog never reported only show up through a requery.
    h.data.put_silently("c", doc! { "_id": "A", "v": 2 }).unwrap();
    h.data.put_silently("c", doc! { "_id": "B" }).unwrap();
    h.oplog.publish_drop_collection("c", None);
    let snap = h.settle().await;

    assert_eq!(
        h.take_events(),
        vec![
            ObserveEvent::Changed { id: id("A"), fields: doc! { "v": 2 } },
            ObserveEvent::Added { id: id("B"), fields: doc! {} },
        ]
    );
    assert_eq!(snap.fetch_generation, 1);
}

#[tokio::test]
async fn projection_limits_reported_fields() {
    let cursor = CursorDescription::new("c", doc! { "done": false }).with_fields(doc! { "title": 1 });
    let mut h = Harness::start(cursor, vec![doc! { "_id": "A", "done": false, "title": "a", "body": "long" }]);
    h.settle().await;
    assert_eq!(h.take_events()[0], ObserveEvent::Added { id: id("A"), fields: doc! { "title": "a" } });

    h.data.update("c", &id("A"), &doc! { "$set": { "body": "longer" } }, None).unwrap();
    h.data.update("c", &id("A"), &doc! { "$set": { "done": true } }, None).unwrap();
    h.settle().await;
    assert_eq!(h.take_events(), vec![ObserveEvent::Removed { id: id("A") }]);
}

#[tokio::test]
async fn stop_detaches_listeners_and_silences_events() {
    let mut h = Harness::start(CursorDescription::new("c", doc! {}), vec![]);
    h.settle().await;
    h.take_events();
    assert_eq!(h.oplog.listener_count(), 1);

    h.driver.stop().await;
    h.driver.stop().await;
    assert_eq!(h.oplog.listener_count(), 0);

    h.data.insert("c", doc! { "_id": "A" }, None).unwrap();
    h.oplog.wait_until_caught_up().await;
    assert!(h.take_events().is_empty());
    assert!(h.driver.snapshot().await.is_none());

    let Harness { driver, .. } = h;
    driver.join().await.unwrap();
}

#[tokio::test]
async fn fetch_failure_is_fatal() {
    let h = Harness::start_with(
        CursorDescription::new("c", doc! { "foo": 1 }),
        vec![doc! { "_id": "A", "foo": 2 }],
        Some(Arc::new(FailingFetcher)),
    );
    h.settle().await;
    h.data.update("c", &id("A"), &doc! { "$set": { "foo": 1 } }, None).unwrap();

    let Harness { driver, oplog, .. } = h;
    let err = tokio::time::timeout(Duration::from_secs(5), driver.join()).await.unwrap().unwrap_err();
    assert!(err.to_string().contains("connection refused"));
    assert_eq!(oplog.listener_count(), 0);
}

#[tokio::test]
async fn unsupported_cursors_are_rejected() {
    let (oplog, _tailer) = OplogHandle::start();
    let source = Arc::new(MemorySource::new(Some(oplog.clone())));
    let mut cursor = CursorDescription::new("c", doc! {});
    cursor.options.limit = Some(5);
    let result = OplogObserveDriver::spawn(DriverOptions {
        cursor,
        source: source.clone(),
        fetcher: Arc::new(CoalescingFetcher::new(source)),
        oplog: oplog.clone(),
        multiplexer: Arc::new(ChannelMultiplexer::new()),
        fetch_concurrency: 1,
    });
    assert!(result.is_err());
    assert_eq!(oplog.listener_count(), 0);
}
