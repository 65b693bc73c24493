use bson::{Bson, Document, oid::ObjectId};
use std::fmt;

/// Hashable document identity. Covers the `_id` types the oplog path
/// publishes: strings, ObjectIds and integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocId {
    String(String),
    ObjectId(ObjectId),
    Int(i64),
}

impl DocId {
    pub fn from_bson(b: &Bson) -> Option<Self> {
        match b {
            Bson::String(s) => Some(DocId::String(s.clone())),
            Bson::ObjectId(oid) => Some(DocId::ObjectId(*oid)),
            Bson::Int32(n) => Some(DocId::Int(*n as i64)),
            Bson::Int64(n) => Some(DocId::Int(*n)),
            _ => None,
        }
    }

    /// The `_id` of a document, if it has a supported one.
    pub fn of(doc: &Document) -> Option<Self> {
        doc.get("_id").and_then(Self::from_bson)
    }

    pub fn to_bson(&self) -> Bson {
        match self {
            DocId::String(s) => Bson::String(s.clone()),
            DocId::ObjectId(oid) => Bson::ObjectId(*oid),
            DocId::Int(n) => Bson::Int64(*n),
        }
    }

    /// Stable textual key, used as the primary key in SQL storage.
    pub fn storage_key(&self) -> String {
        match self {
            DocId::String(s) => format!("s:{s}"),
            DocId::ObjectId(oid) => format!("o:{}", oid.to_hex()),
            DocId::Int(n) => format!("i:{n}"),
        }
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocId::String(s) => write!(f, "{s}"),
            DocId::ObjectId(oid) => write!(f, "ObjectId({})", oid.to_hex()),
            DocId::Int(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        DocId::String(s.to_string())
    }
}

impl From<ObjectId> for DocId {
    fn from(oid: ObjectId) -> Self {
        DocId::ObjectId(oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn int_widths_share_identity() {
        assert_eq!(DocId::from_bson(&Bson::Int32(5)), DocId::from_bson(&Bson::Int64(5)));
        assert_eq!(DocId::of(&doc! { "_id": 1.5 }), None);
    }

    #[test]
    fn storage_keys_do_not_collide_across_types() {
        assert_ne!(DocId::from("5").storage_key(), DocId::Int(5).storage_key());
    }
}
