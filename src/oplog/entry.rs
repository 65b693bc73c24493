use bson::{Document, Timestamp};
use serde::{Deserialize, Serialize};

use crate::doc_id::DocId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
}

/// One replicated write.
/// - insert: `o` is the full document
/// - update: `o2` holds `_id`, `o` is a modifier or a replacement
/// - delete: `o` holds `_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub op: OpKind,
    #[serde(rename = "ns")]
    pub collection: String,
    pub o: Document,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o2: Option<Document>,
    pub ts: Timestamp,
}

impl OplogEntry {
    pub fn insert(collection: impl Into<String>, doc: Document, ts: Timestamp) -> Self {
        Self { op: OpKind::Insert, collection: collection.into(), o: doc, o2: None, ts }
    }

    pub fn update(collection: impl Into<String>, id: &DocId, update: Document, ts: Timestamp) -> Self {
        let mut o2 = Document::new();
        o2.insert("_id", id.to_bson());
        Self { op: OpKind::Update, collection: collection.into(), o: update, o2: Some(o2), ts }
    }

    pub fn delete(collection: impl Into<String>, id: &DocId, ts: Timestamp) -> Self {
        let mut o = Document::new();
        o.insert("_id", id.to_bson());
        Self { op: OpKind::Delete, collection: collection.into(), o, o2: None, ts }
    }

    /// The document this entry touches.
    pub fn id(&self) -> Option<DocId> {
        let source = match self.op {
            OpKind::Update => self.o2.as_ref()?,
            OpKind::Insert | OpKind::Delete => &self.o,
        };
        source.get("_id").and_then(DocId::from_bson)
    }

    /// Fetch cache key. Two fetches with the same key for the same id must
    /// return the same version of the document.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.ts.time, self.ts.increment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn id_comes_from_o2_for_updates() {
        let ts = Timestamp { time: 1, increment: 2 };
        let u = OplogEntry::update("c", &DocId::from("A"), doc! { "$set": { "x": 1 } }, ts);
        assert_eq!(u.id(), Some(DocId::from("A")));
        assert_eq!(u.cache_key(), "1:2");
        let i = OplogEntry::insert("c", doc! { "_id": "B", "x": 1 }, ts);
        assert_eq!(i.id(), Some(DocId::from("B")));
    }

    #[test]
    fn wire_shape_uses_short_op_codes() {
        let d = OplogEntry::delete("c", &DocId::Int(3), Timestamp { time: 5, increment: 0 });
        let b = bson::to_document(&d).unwrap();
        assert_eq!(b.get_str("op").unwrap(), "d");
        assert_eq!(b.get_str("ns").unwrap(), "c");
    }
}
