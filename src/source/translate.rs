//! Selector → SQL push-down over a `doc jsonb` column.
//!
//! The generated predicate may admit rows the selector rejects (numeric
//! widths, `$ne`, null handling); callers re-check each row with the
//! in-memory matcher. It never drops a row the selector accepts, which is
//! why jsonb containment is not used: it does not see scalars inside arrays.

use bson::{Bson, Document};

pub fn build_where_from_filter(filter: &Document) -> String {
    let mut clauses: Vec<String> = Vec::new();
    for (k, v) in filter.iter() {
        if k == "_id" {
            continue;
        }
        let path = jsonpath_path(k);
        match v {
            Bson::Document(ops) => {
                for (op, val) in ops.iter() {
                    match op.as_str() {
                        "$eq" => {
                            if let Some(lit) = json_literal_from_bson(val)
                                && !matches!(val, Bson::Null)
                            {
                                clauses.push(path_predicate(&path, &format!("@ == {lit}")));
                            }
                        }
                        "$in" => {
                            let Bson::Array(items) = val else { continue };
                            if items.iter().any(|i| matches!(i, Bson::Null)) {
                                continue;
                            }
                            let preds: Vec<String> = items
                                .iter()
                                .filter_map(json_literal_from_bson)
                                .map(|lit| format!("@ == {lit}"))
                                .collect();
                            if preds.len() != items.len() {
                                continue;
                            }
                            if preds.is_empty() {
                                clauses.push("FALSE".to_string());
                            } else {
                                clauses.push(path_predicate(&path, &preds.join(" || ")));
                            }
                        }
                        "$gt" | "$gte" | "$lt" | "$lte" => {
                            let op_sql = match op.as_str() {
                                "$gt" => ">",
                                "$gte" => ">=",
                                "$lt" => "<",
                                _ => "<=",
                            };
                            // Only numbers: string ordering in SQL follows collation rules.
                            if let Some(lit) = json_literal_from_bson(val)
                                && matches!(val, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_))
                            {
                                clauses.push(path_predicate(&path, &format!("@ {op_sql} {lit}")));
                            }
                        }
                        "$exists" => {
                            if matches!(val, Bson::Boolean(true)) {
                                clauses.push(format!("jsonb_path_exists(doc, '{}')", escape_single(&path)));
                            }
                        }
                        // $ne, $nin and `$exists: false` are left to the in-memory check.
                        _ => {}
                    }
                }
            }
            Bson::Null => {}
            other => {
                if let Some(lit) = json_literal_from_bson(other) {
                    clauses.push(path_predicate(&path, &format!("@ == {lit}")));
                }
            }
        }
    }
    if clauses.is_empty() { String::from("TRUE") } else { clauses.join(" AND ") }
}

fn path_predicate(path: &str, predicate: &str) -> String {
    let p1 = format!("jsonb_path_exists(doc, '{} ? ({})')", escape_single(path), escape_single(predicate));
    let p2 = format!("jsonb_path_exists(doc, '{}[*] ? ({})')", escape_single(path), escape_single(predicate));
    format!("({p1} OR {p2})")
}

pub fn jsonpath_path(key: &str) -> String {
    let mut out = String::from("$");
    for seg in key.split('.') {
        let esc = seg.replace('\\', "\\\\").replace('"', "\\\"");
        out.push_str(".\"");
        out.push_str(&esc);
        out.push('"');
    }
    out
}

pub fn json_literal_from_bson(v: &Bson) -> Option<String> {
    match v {
        Bson::Null => Some("null".to_string()),
        Bson::Boolean(b) => Some(if *b { "true".into() } else { "false".into() }),
        Bson::Int32(n) => Some(n.to_string()),
        Bson::Int64(n) => Some(n.to_string()),
        Bson::Double(n) if n.is_finite() => Some(n.to_string()),
        Bson::String(s) => serde_json::to_string(s).ok(),
        _ => None,
    }
}

/// Escape for embedding in a single-quoted SQL string literal.
pub fn escape_single(s: &str) -> String {
    s.replace('\'', "''")
}
