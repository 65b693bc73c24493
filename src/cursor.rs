use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::matcher::{Matcher, check_supported_projection};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CursorOptions {
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    pub sort: Option<Document>,
    pub fields: Option<Document>,
    pub disable_oplog: bool,
}

/// A live query: collection, selector and cursor options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorDescription {
    pub collection_name: String,
    #[serde(default)]
    pub selector: Document,
    #[serde(default)]
    pub options: CursorOptions,
}

impl CursorDescription {
    pub fn new(collection_name: impl Into<String>, selector: Document) -> Self {
        Self { collection_name: collection_name.into(), selector, options: CursorOptions::default() }
    }

    pub fn with_fields(mut self, fields: Document) -> Self {
        self.options.fields = Some(fields);
        self
    }

    /// Scalar `_id` named by the selector, if any.
    pub fn selector_id(&self) -> Option<&Bson> {
        match self.selector.get("_id") {
            Some(Bson::Document(_)) | None => None,
            Some(v) => Some(v),
        }
    }
}

/// Whether the oplog driver can observe this cursor. Anything rejected here
/// falls back to polling.
pub fn cursor_supported(cursor: &CursorDescription) -> bool {
    let reject = |why: &str| {
        tracing::debug!(collection = %cursor.collection_name, reason = why, "cursor not supported by oplog driver");
        false
    };
    let opts = &cursor.options;
    if opts.disable_oplog {
        return reject("disableOplog set");
    }
    if opts.limit.is_some() || opts.skip.is_some() {
        return reject("limit or skip");
    }
    if let Some(fields) = &opts.fields
        && let Err(e) = check_supported_projection(fields)
    {
        return reject(&e.to_string());
    }
    if let Err(e) = Matcher::compile(&cursor.selector) {
        return reject(&e.to_string());
    }
    true
}
