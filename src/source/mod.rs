//! Document storage backends the observe driver queries and fetches from.
//! Both backends publish their writes to an [`OplogHandle`](crate::oplog::OplogHandle).

pub mod memory;
pub mod postgres;
pub mod translate;

use bson::{Bson, Document, Timestamp};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cursor::CursorDescription;
use crate::doc_id::DocId;
use crate::error::Result;
use crate::fetcher::BoxFuture;

pub use memory::MemorySource;
pub use postgres::PgSource;

pub trait DocumentSource: Send + Sync + 'static {
    /// All documents matching the cursor's selector, with `options.fields`
    /// applied. Order is unspecified.
    fn find<'a>(&'a self, cursor: &'a CursorDescription) -> BoxFuture<'a, Result<Vec<Document>>>;

    fn find_one<'a>(&'a self, collection: &'a str, id: &'a DocId) -> BoxFuture<'a, Result<Option<Document>>>;
}

/// The oplog form of a write that turned `old` into `new`: top-level fields
/// that changed go in `$set`, fields that disappeared in `$unset`.
pub fn oplog_modifier(old: &Document, new: &Document) -> Document {
    let mut set = Document::new();
    let mut unset = Document::new();
    for (k, v) in new {
        if k != "_id" && old.get(k) != Some(v) {
            set.insert(k.clone(), v.clone());
        }
    }
    for k in old.keys() {
        if !new.contains_key(k) {
            unset.insert(k.clone(), Bson::Boolean(true));
        }
    }
    let mut out = Document::new();
    if !set.is_empty() {
        out.insert("$set", set);
    }
    if !unset.is_empty() {
        out.insert("$unset", unset);
    }
    out
}

/// Monotonic oplog timestamps: wall-clock seconds plus a process-wide counter.
pub(crate) fn next_timestamp() -> Timestamp {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let time = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0);
    Timestamp { time, increment: COUNTER.fetch_add(1, Ordering::SeqCst) + 1 }
}
