use bson::{Bson, Document, oid::ObjectId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{DocumentSource, next_timestamp, oplog_modifier};
use crate::cursor::CursorDescription;
use crate::doc_id::DocId;
use crate::error::{Error, Result};
use crate::fence::WriteFence;
use crate::fetcher::BoxFuture;
use crate::matcher::{Matcher, Projection, modify};
use crate::oplog::{OplogEntry, OplogHandle};

type Collection = BTreeMap<DocId, Document>;

/// In-process document store. Every write is published to the attached
/// oplog handle, optionally under a write fence.
pub struct MemorySource {
    collections: Mutex<HashMap<String, Collection>>,
    oplog: Option<OplogHandle>,
}

impl MemorySource {
    pub fn new(oplog: Option<OplogHandle>) -> Self {
        Self { collections: Mutex::new(HashMap::new()), oplog }
    }

    fn publish(&self, entry: OplogEntry, fence: Option<&WriteFence>) {
        if let Some(oplog) = &self.oplog {
            oplog.publish(entry, fence);
        }
    }

    /// Insert `doc`, assigning an ObjectId `_id` when missing.
    pub fn insert(&self, collection: &str, mut doc: Document, fence: Option<&WriteFence>) -> Result<DocId> {
        if !doc.contains_key("_id") {
            doc.insert("_id", Bson::ObjectId(ObjectId::new()));
        }
        let id = DocId::of(&doc).ok_or_else(|| Error::Msg("unsupported _id type".into()))?;
        {
            let mut cols = self.collections.lock();
            let coll = cols.entry(collection.to_string()).or_default();
            if coll.contains_key(&id) {
                return Err(Error::Msg(format!("duplicate key: {id}")));
            }
            coll.insert(id.clone(), doc.clone());
        }
        tracing::trace!(collection, id = %id, "insert");
        self.publish(OplogEntry::insert(collection, doc, next_timestamp()), fence);
        Ok(id)
    }

    /// Apply a modifier or replacement. Returns false when the document does not exist.
    pub fn update(&self, collection: &str, id: &DocId, update: &Document, fence: Option<&WriteFence>) -> Result<bool> {
        let (before, after) = {
            let mut cols = self.collections.lock();
            let Some(doc) = cols.get_mut(collection).and_then(|c| c.get_mut(id)) else {
                return Ok(false);
            };
            let before = doc.clone();
            modify(doc, update)?;
            (before, doc.clone())
        };
        // Modifiers are logged as their resulting $set/$unset; replacements as-is.
        let logged = if crate::matcher::is_modifier(update) { oplog_modifier(&before, &after) } else { after };
        if !logged.is_empty() {
            self.publish(OplogEntry::update(collection, id, logged, next_timestamp()), fence);
        }
        Ok(true)
    }

    pub fn remove(&self, collection: &str, id: &DocId, fence: Option<&WriteFence>) -> Result<bool> {
        let removed = self.collections.lock().get_mut(collection).and_then(|c| c.remove(id)).is_some();
        if removed {
            self.publish(OplogEntry::delete(collection, id, next_timestamp()), fence);
        }
        Ok(removed)
    }

    pub fn drop_collection(&self, collection: &str, fence: Option<&WriteFence>) {
        self.collections.lock().remove(collection);
        if let Some(oplog) = &self.oplog {
            oplog.publish_drop_collection(collection, fence);
        }
    }

    /// Overwrite a document without publishing anything; simulates writes
    /// the oplog never saw.
    pub fn put_silently(&self, collection: &str, doc: Document) -> Result<()> {
        let id = DocId::of(&doc).ok_or_else(|| Error::Msg("document needs a supported _id".into()))?;
        self.collections.lock().entry(collection.to_string()).or_default().insert(id, doc);
        Ok(())
    }

    pub fn count(&self, collection: &str) -> usize {
        self.collections.lock().get(collection).map(|c| c.len()).unwrap_or(0)
    }
}

impl DocumentSource for MemorySource {
    fn find<'a>(&'a self, cursor: &'a CursorDescription) -> BoxFuture<'a, Result<Vec<Document>>> {
        Box::pin(async move {
            let matcher = Matcher::compile(&cursor.selector)?;
            let projection = match &cursor.options.fields {
                Some(fields) => Projection::compile(fields)?,
                None => Projection::all(),
            };
            let cols = self.collections.lock();
            let Some(coll) = cols.get(&cursor.collection_name) else { return Ok(Vec::new()) };
            let skip = cursor.options.skip.unwrap_or(0).max(0) as usize;
            let limit = cursor.options.limit.filter(|l| *l > 0).map(|l| l as usize).unwrap_or(usize::MAX);
            Ok(coll
                .values()
                .filter(|d| matcher.document_matches(d))
                .skip(skip)
                .take(limit)
                .map(|d| projection.apply(d))
                .collect())
        })
    }

    fn find_one<'a>(&'a self, collection: &'a str, id: &'a DocId) -> BoxFuture<'a, Result<Option<Document>>> {
        Box::pin(async move { Ok(self.collections.lock().get(collection).and_then(|c| c.get(id)).cloned()) })
    }
}
