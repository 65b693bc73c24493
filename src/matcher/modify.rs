//! In-memory application of update modifiers (`$set`, `$unset`, `$inc`) and
//! whole-document replacement.

use bson::{Bson, Document};

use super::values::number_as_f64;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ModifyError {
    /// A path walked through a value that cannot hold fields.
    #[error("cannot create field '{field}' in element at '{path}'")]
    CannotTraverse { path: String, field: String },

    #[error("cannot apply $inc to non-numeric value at '{0}'")]
    NonNumeric(String),

    #[error("modifier {0} is not supported")]
    Unsupported(String),

    #[error("modifier {op} expects a document of fields")]
    Malformed { op: String },

    #[error("cannot mix modifier operators and plain fields")]
    Mixed,
}

impl From<ModifyError> for crate::error::Error {
    fn from(e: ModifyError) -> Self {
        crate::error::Error::Matcher(e.to_string())
    }
}

/// True when the document contains modifier operators rather than a
/// replacement body.
pub fn is_modifier(update: &Document) -> bool {
    update.keys().any(|k| k.starts_with('$'))
}

/// Field names carrying `EJSON$`, in a path or anywhere inside a written
/// value, belong to custom-encoded values and cannot be reproduced from the
/// oplog alone.
pub fn can_be_directly_applied(modifier: &Document) -> bool {
    modifier.iter().all(|(_, fields)| match fields {
        Bson::Document(d) => d.iter().all(|(path, value)| !path.contains("EJSON$") && !is_custom_encoded(value)),
        _ => true,
    })
}

fn is_custom_encoded(value: &Bson) -> bool {
    match value {
        Bson::Document(d) => d.iter().any(|(k, v)| k.starts_with("EJSON$") || is_custom_encoded(v)),
        Bson::Array(items) => items.iter().any(is_custom_encoded),
        _ => false,
    }
}

/// Field paths written by a modifier, in modifier order.
pub fn modified_paths(modifier: &Document) -> Vec<String> {
    let mut out = Vec::new();
    for (op, fields) in modifier {
        if !op.starts_with('$') {
            continue;
        }
        if let Bson::Document(d) = fields {
            out.extend(d.keys().cloned());
        }
    }
    out
}

/// Apply `update` to `doc` in place. A replacement keeps the existing `_id`.
pub fn modify(doc: &mut Document, update: &Document) -> Result<(), ModifyError> {
    if !is_modifier(update) {
        let id = doc.get("_id").cloned();
        let mut replacement = update.clone();
        if let Some(id) = id {
            replacement.insert("_id", id);
        }
        *doc = replacement;
        return Ok(());
    }

    // Work on a copy so a failing modifier leaves the document untouched.
    let mut working = doc.clone();
    for (op, fields) in update {
        let Bson::Document(fields) = fields else {
            if op.starts_with('$') {
                return Err(ModifyError::Malformed { op: op.clone() });
            }
            return Err(ModifyError::Mixed);
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(&mut working, path, value.clone())?;
                }
            }
            "$unset" => {
                for (path, _) in fields {
                    unset_path(&mut working, path);
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    apply_inc(&mut working, path, delta)?;
                }
            }
            other if other.starts_with('$') => return Err(ModifyError::Unsupported(other.to_string())),
            _ => return Err(ModifyError::Mixed),
        }
    }
    *doc = working;
    Ok(())
}

fn seg_is_index(seg: &str) -> Option<usize> {
    seg.parse::<usize>().ok()
}

pub fn set_path(doc: &mut Document, path: &str, value: Bson) -> Result<(), ModifyError> {
    let segs: Vec<&str> = path.split('.').collect();
    set_in_document(doc, &segs, path, value)
}

fn set_in_document(d: &mut Document, segs: &[&str], full: &str, value: Bson) -> Result<(), ModifyError> {
    let Some((seg, rest)) = segs.split_first() else { return Ok(()) };
    if rest.is_empty() {
        d.insert(seg.to_string(), value);
        return Ok(());
    }
    let next_is_index = rest.first().and_then(|s| seg_is_index(s)).is_some();
    let entry = d
        .entry(seg.to_string())
        .or_insert_with(|| if next_is_index { Bson::Array(Vec::new()) } else { Bson::Document(Document::new()) });
    set_in_bson(entry, rest, full, value)
}

fn set_in_bson(cur: &mut Bson, segs: &[&str], full: &str, value: Bson) -> Result<(), ModifyError> {
    match cur {
        Bson::Document(d) => set_in_document(d, segs, full, value),
        Bson::Array(arr) => {
            let Some((seg, rest)) = segs.split_first() else { return Ok(()) };
            let Some(idx) = seg_is_index(seg) else {
                return Err(ModifyError::CannotTraverse { path: full.to_string(), field: seg.to_string() });
            };
            if arr.len() < idx + 1 {
                let pad = idx + 1 - arr.len();
                arr.extend(std::iter::repeat(Bson::Null).take(pad));
            }
            if rest.is_empty() {
                arr[idx] = value;
                return Ok(());
            }
            if matches!(arr[idx], Bson::Null) {
                let next_is_index = rest.first().and_then(|s| seg_is_index(s)).is_some();
                arr[idx] = if next_is_index { Bson::Array(Vec::new()) } else { Bson::Document(Document::new()) };
            }
            set_in_bson(&mut arr[idx], rest, full, value)
        }
        _ => Err(ModifyError::CannotTraverse {
            path: full.to_string(),
            field: segs.first().map(|s| s.to_string()).unwrap_or_default(),
        }),
    }
}

pub fn unset_path(doc: &mut Document, path: &str) {
    let segs: Vec<&str> = path.split('.').collect();
    let Some((first, rest)) = segs.split_first() else { return };
    if rest.is_empty() {
        doc.remove(*first);
    } else if let Some(child) = doc.get_mut(*first) {
        unset_in_bson(child, rest);
    }
}

fn unset_in_bson(cur: &mut Bson, segs: &[&str]) {
    let Some((seg, rest)) = segs.split_first() else { return };
    match cur {
        Bson::Array(arr) => {
            if let Some(idx) = seg_is_index(seg)
                && idx < arr.len()
            {
                if rest.is_empty() {
                    arr[idx] = Bson::Null;
                } else {
                    unset_in_bson(&mut arr[idx], rest);
                }
            }
        }
        Bson::Document(d) => {
            if rest.is_empty() {
                d.remove(*seg);
            } else if let Some(child) = d.get_mut(*seg) {
                unset_in_bson(child, rest);
            }
        }
        _ => {}
    }
}

pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segs = path.split('.');
    let mut cur = doc.get(segs.next()?)?;
    for seg in segs {
        cur = match (cur, seg_is_index(seg)) {
            (Bson::Document(d), _) => d.get(seg)?,
            (Bson::Array(arr), Some(idx)) => arr.get(idx)?,
            _ => return None,
        };
    }
    Some(cur)
}

fn apply_inc(doc: &mut Document, path: &str, delta: &Bson) -> Result<(), ModifyError> {
    if number_as_f64(delta).is_none() {
        return Err(ModifyError::NonNumeric(path.to_string()));
    }
    let next = match get_path(doc, path) {
        None => delta.clone(),
        Some(Bson::Int32(cur)) => match delta {
            Bson::Int32(d) => {
                let sum = *cur as i64 + *d as i64;
                i32::try_from(sum).map(Bson::Int32).unwrap_or(Bson::Int64(sum))
            }
            Bson::Int64(d) => Bson::Int64(*cur as i64 + d),
            other => Bson::Double(*cur as f64 + number_as_f64(other).unwrap_or(0.0)),
        },
        Some(Bson::Int64(cur)) => match delta {
            Bson::Int32(d) => Bson::Int64(cur + *d as i64),
            Bson::Int64(d) => Bson::Int64(cur + d),
            other => Bson::Double(*cur as f64 + number_as_f64(other).unwrap_or(0.0)),
        },
        Some(Bson::Double(cur)) => Bson::Double(cur + number_as_f64(delta).unwrap_or(0.0)),
        Some(_) => return Err(ModifyError::NonNumeric(path.to_string())),
    };
    set_path(doc, path, next)
}

/// Fields of `new` that differ from `old`. Fields present only in `old` are
/// reported as `Undefined`, meaning cleared.
pub fn make_changed_fields(new: &Document, old: &Document) -> Document {
    let mut changed = Document::new();
    for (k, v) in new {
        if old.get(k) != Some(v) {
            changed.insert(k.clone(), v.clone());
        }
    }
    for k in old.keys() {
        if !new.contains_key(k) {
            changed.insert(k.clone(), Bson::Undefined);
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn set_creates_intermediate_documents() {
        let mut d = doc! { "_id": 1 };
        modify(&mut d, &doc! { "$set": { "a.b.c": 5 } }).unwrap();
        assert_eq!(d, doc! { "_id": 1, "a": { "b": { "c": 5 } } });
    }

    #[test]
    fn set_through_scalar_is_an_error_and_leaves_doc_untouched() {
        let mut d = doc! { "a": 1 };
        let err = modify(&mut d, &doc! { "$set": { "a.b": 2 } }).unwrap_err();
        assert!(matches!(err, ModifyError::CannotTraverse { .. }));
        assert_eq!(d, doc! { "a": 1 });
    }

    #[test]
    fn unset_and_inc() {
        let mut d = doc! { "a": 1, "n": 2, "m": { "k": 1.5 } };
        modify(&mut d, &doc! { "$unset": { "a": 1 }, "$inc": { "n": 3, "m.k": 1 } }).unwrap();
        assert_eq!(d, doc! { "n": 5, "m": { "k": 2.5 } });
    }

    #[test]
    fn inc_on_string_fails() {
        let mut d = doc! { "s": "x" };
        assert_eq!(modify(&mut d, &doc! { "$inc": { "s": 1 } }), Err(ModifyError::NonNumeric("s".into())));
    }

    #[test]
    fn replacement_keeps_id() {
        let mut d = doc! { "_id": "A", "x": 1 };
        modify(&mut d, &doc! { "y": 2 }).unwrap();
        assert_eq!(d, doc! { "y": 2, "_id": "A" });
    }

    #[test]
    fn array_index_paths() {
        let mut d = doc! { "arr": [1, 2] };
        modify(&mut d, &doc! { "$set": { "arr.3": 9 } }).unwrap();
        assert_eq!(d, doc! { "arr": [1, 2, Bson::Null, 9] });
        assert_eq!(get_path(&d, "arr.3"), Some(&Bson::Int32(9)));
    }

    #[test]
    fn ejson_fields_block_direct_application() {
        assert!(can_be_directly_applied(&doc! { "$set": { "a": 1 } }));
        assert!(!can_be_directly_applied(&doc! { "$set": { "a.EJSON$type": "x" } }));
        assert!(!can_be_directly_applied(&doc! { "$set": { "d": { "EJSON$type": "x", "EJSON$value": 1 } } }));
        assert!(!can_be_directly_applied(&doc! { "$set": { "list": [1, { "inner": { "EJSON$type": "x" } }] } }));
        assert!(can_be_directly_applied(&doc! { "$set": { "d": { "plain": [1, { "k": "v" }] } } }));
    }

    #[test]
    fn changed_fields_report_cleared_keys() {
        let changed = make_changed_fields(&doc! { "a": 1, "b": 3 }, &doc! { "a": 1, "b": 2, "c": 0 });
        assert_eq!(changed, doc! { "b": 3, "c": Bson::Undefined });
    }
}
