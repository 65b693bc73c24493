use bson::{Bson, Document};
use std::cmp::Ordering;

use super::modify::{self, ModifyError};
use super::values::{bson_cmp, is_scalar, number_as_f64, type_order, values_equal};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum ValueOp {
    Eq(Bson),
    Ne(Bson),
    Gt(Bson),
    Gte(Bson),
    Lt(Bson),
    Lte(Bson),
    In(Vec<Bson>),
    Nin(Vec<Bson>),
    Exists(bool),
}

impl ValueOp {
    fn is_range(&self) -> bool {
        matches!(self, ValueOp::Gt(_) | ValueOp::Gte(_) | ValueOp::Lt(_) | ValueOp::Lte(_))
    }
}

#[derive(Debug, Clone)]
struct Clause {
    path: String,
    /// `false` when the selector value was a bare scalar (`{a: 5}`).
    operator_form: bool,
    ops: Vec<ValueOp>,
}

/// Compiled selector over the supported subset: top-level field paths with
/// scalar equality and the `$eq $ne $gt $gte $lt $lte $in $nin $exists`
/// operators. Anything else is rejected at compile time.
#[derive(Debug, Clone)]
pub struct Matcher {
    clauses: Vec<Clause>,
}

impl Matcher {
    pub fn compile(selector: &Document) -> Result<Self> {
        let mut clauses = Vec::with_capacity(selector.len());
        for (path, value) in selector {
            if path.starts_with('$') {
                return Err(Error::Matcher(format!("selector operator {path}")));
            }
            if path.is_empty() || path.split('.').any(|p| p.is_empty() || p.starts_with('$')) {
                return Err(Error::Matcher(format!("bad field path '{path}'")));
            }
            let clause = match value {
                Bson::Document(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => Clause {
                    path: path.clone(),
                    operator_form: true,
                    ops: compile_ops(path, ops)?,
                },
                v if is_scalar(v) => Clause {
                    path: path.clone(),
                    operator_form: false,
                    ops: vec![ValueOp::Eq(v.clone())],
                },
                _ => return Err(Error::Matcher(format!("non-scalar equality on '{path}'"))),
            };
            clauses.push(clause);
        }
        Ok(Self { clauses })
    }

    pub fn document_matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|c| clause_matches(c, doc))
    }

    /// Selector field paths in selector order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.clauses.iter().map(|c| c.path.as_str())
    }

    /// `$exists` makes the placeholder-document check unreliable.
    pub fn is_simple(&self) -> bool {
        !self.clauses.iter().any(|c| c.ops.iter().any(|op| matches!(op, ValueOp::Exists(_))))
    }

    /// True when any selector path shares a prefix with a path the modifier
    /// touches. Replacements affect everything.
    pub fn affected_by_modifier(&self, modifier: &Document) -> bool {
        if !modify::is_modifier(modifier) {
            return true;
        }
        let modified = modify::modified_paths(modifier);
        self.clauses.iter().any(|c| {
            let sel: Vec<&str> = c.path.split('.').collect();
            modified.iter().any(|m| {
                let mp: Vec<&str> = m.split('.').collect();
                paths_overlap(&sel, &mp)
            })
        })
    }

    /// Conservative check: may answer `true` for modifiers that cannot make a
    /// non-matching document match, but never `false` for one that can.
    pub fn can_become_true_by_modifier(&self, modifier: &Document) -> bool {
        if !self.affected_by_modifier(modifier) {
            return false;
        }
        if !modify::is_modifier(modifier) || !self.is_simple() {
            return true;
        }

        let modified = modify::modified_paths(modifier);
        let has_numeric = |p: &str| p.split('.').any(|s| s.parse::<usize>().is_ok());
        if self.paths().any(has_numeric) || modified.iter().any(|m| has_numeric(m)) {
            return true;
        }

        // An operator clause expects a scalar at its path; the modifier writing
        // a sub-field there means the value becomes an object.
        let expected_scalar_is_object = self.clauses.iter().any(|c| {
            c.operator_form && modified.iter().any(|m| m.starts_with(&format!("{}.", c.path)))
        });
        if expected_scalar_is_object {
            return false;
        }

        let Some(mut candidate) = self.matching_document() else { return true };
        match modify::modify(&mut candidate, modifier) {
            Ok(()) => self.document_matches(&candidate),
            Err(ModifyError::CannotTraverse { .. }) => false,
            Err(_) => true,
        }
    }

    /// A document that satisfies the selector, used to probe modifiers. `None`
    /// when no reliable placeholder can be built.
    fn matching_document(&self) -> Option<Document> {
        let mut out = Document::new();
        for clause in &self.clauses {
            let value = self.placeholder_for(clause)?;
            if let Some(v) = value {
                modify::set_path(&mut out, &clause.path, v).ok()?;
            }
        }
        Some(out)
    }

    fn placeholder_for(&self, clause: &Clause) -> Option<Option<Bson>> {
        let ops = &clause.ops;
        if let Some(v) = ops.iter().find_map(|op| if let ValueOp::Eq(v) = op { Some(v) } else { None }) {
            return Some(Some(v.clone()));
        }
        if let Some(values) = ops.iter().find_map(|op| if let ValueOp::In(vs) = op { Some(vs) } else { None }) {
            let hit = values.iter().find(|v| ops.iter().all(|op| op_matches(op, &[Some(*v)])));
            return Some(hit.cloned());
        }
        if ops.iter().all(|op| op.is_range()) {
            return range_midpoint(ops);
        }
        if ops.iter().all(|op| matches!(op, ValueOp::Ne(_) | ValueOp::Nin(_))) {
            return Some(Some(Bson::Document(Document::new())));
        }
        None
    }
}

fn compile_ops(path: &str, ops: &Document) -> Result<Vec<ValueOp>> {
    let scalar = |op: &str, v: &Bson| -> Result<Bson> {
        if is_scalar(v) {
            Ok(v.clone())
        } else {
            Err(Error::Matcher(format!("{op} on '{path}' needs a scalar operand")))
        }
    };
    let scalar_list = |op: &str, v: &Bson| -> Result<Vec<Bson>> {
        match v {
            Bson::Array(items) if items.iter().all(is_scalar) => Ok(items.clone()),
            _ => Err(Error::Matcher(format!("{op} on '{path}' needs an array of scalars"))),
        }
    };
    let mut out = Vec::with_capacity(ops.len());
    for (op, v) in ops {
        let compiled = match op.as_str() {
            "$eq" => ValueOp::Eq(scalar(op, v)?),
            "$ne" => ValueOp::Ne(scalar(op, v)?),
            "$gt" => ValueOp::Gt(scalar(op, v)?),
            "$gte" => ValueOp::Gte(scalar(op, v)?),
            "$lt" => ValueOp::Lt(scalar(op, v)?),
            "$lte" => ValueOp::Lte(scalar(op, v)?),
            "$in" => ValueOp::In(scalar_list(op, v)?),
            "$nin" => ValueOp::Nin(scalar_list(op, v)?),
            "$exists" => ValueOp::Exists(match v {
                Bson::Boolean(b) => *b,
                other => number_as_f64(other).map(|n| n != 0.0).unwrap_or(true),
            }),
            other => return Err(Error::Matcher(format!("operator {other} on '{path}'"))),
        };
        out.push(compiled);
    }
    Ok(out)
}

fn paths_overlap(a: &[&str], b: &[&str]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn range_midpoint(ops: &[ValueOp]) -> Option<Option<Bson>> {
    let mut lower = f64::NEG_INFINITY;
    let mut upper = f64::INFINITY;
    for op in ops {
        match op {
            ValueOp::Gt(v) | ValueOp::Gte(v) => lower = lower.max(number_as_f64(v)?),
            ValueOp::Lt(v) | ValueOp::Lte(v) => upper = upper.min(number_as_f64(v)?),
            _ => return None,
        }
    }
    let middle = if lower.is_infinite() && upper.is_infinite() {
        0.0
    } else if lower.is_infinite() {
        upper - 1.0
    } else if upper.is_infinite() {
        lower + 1.0
    } else {
        (lower + upper) / 2.0
    };
    let candidate = Bson::Double(middle);
    if ops.iter().all(|op| op_matches(op, &[Some(&candidate)])) {
        Some(Some(candidate))
    } else {
        None
    }
}

/// Resolve a dotted path into every value it reaches, descending into arrays
/// of documents. `None` entries mark branches where the path is missing.
fn lookup<'a>(doc: &'a Document, path: &str) -> Vec<Option<&'a Bson>> {
    let segs: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    match doc.get(segs[0]) {
        Some(v) => descend(v, &segs[1..], &mut out),
        None => out.push(None),
    }
    out
}

fn descend<'a>(cur: &'a Bson, segs: &[&str], out: &mut Vec<Option<&'a Bson>>) {
    let Some((seg, rest)) = segs.split_first() else {
        out.push(Some(cur));
        return;
    };
    match cur {
        Bson::Document(d) => match d.get(*seg) {
            Some(v) => descend(v, rest, out),
            None => out.push(None),
        },
        Bson::Array(arr) => {
            if let Ok(idx) = seg.parse::<usize>() {
                match arr.get(idx) {
                    Some(v) => descend(v, rest, out),
                    None => out.push(None),
                }
                return;
            }
            let before = out.len();
            for el in arr.iter().filter(|e| matches!(e, Bson::Document(_))) {
                descend(el, segs, out);
            }
            if out.len() == before {
                out.push(None);
            }
        }
        _ => out.push(None),
    }
}

fn clause_matches(clause: &Clause, doc: &Document) -> bool {
    let branches = lookup(doc, &clause.path);
    clause.ops.iter().all(|op| op_matches(op, &branches))
}

fn op_matches(op: &ValueOp, branches: &[Option<&Bson>]) -> bool {
    match op {
        ValueOp::Eq(v) => branches.iter().any(|b| branch_equals(*b, v)),
        ValueOp::Ne(v) => !branches.iter().any(|b| branch_equals(*b, v)),
        ValueOp::In(vs) => vs.iter().any(|v| branches.iter().any(|b| branch_equals(*b, v))),
        ValueOp::Nin(vs) => !vs.iter().any(|v| branches.iter().any(|b| branch_equals(*b, v))),
        ValueOp::Exists(want) => branches.iter().any(|b| b.is_some()) == *want,
        ValueOp::Gt(v) => branches.iter().any(|b| branch_cmp(*b, v, |o| o == Ordering::Greater)),
        ValueOp::Gte(v) => branches.iter().any(|b| branch_cmp(*b, v, |o| o != Ordering::Less)),
        ValueOp::Lt(v) => branches.iter().any(|b| branch_cmp(*b, v, |o| o == Ordering::Less)),
        ValueOp::Lte(v) => branches.iter().any(|b| branch_cmp(*b, v, |o| o != Ordering::Greater)),
    }
}

fn branch_equals(branch: Option<&Bson>, expected: &Bson) -> bool {
    match branch {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(items)) => items.iter().any(|e| values_equal(e, expected)),
        Some(v) => values_equal(v, expected),
    }
}

fn branch_cmp(branch: Option<&Bson>, bound: &Bson, accept: impl Fn(Ordering) -> bool) -> bool {
    let comparable = |v: &Bson| type_order(v) == type_order(bound) && accept(bson_cmp(v, bound));
    match branch {
        None => false,
        Some(Bson::Array(items)) => items.iter().any(comparable),
        Some(v) => comparable(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn m(sel: Document) -> Matcher {
        Matcher::compile(&sel).unwrap()
    }

    #[test]
    fn equality_and_array_membership() {
        let matcher = m(doc! { "tag": "x" });
        assert!(matcher.document_matches(&doc! { "tag": "x" }));
        assert!(matcher.document_matches(&doc! { "tag": ["a", "x"] }));
        assert!(!matcher.document_matches(&doc! { "tag": "y" }));
        assert!(!matcher.document_matches(&doc! {}));
    }

    #[test]
    fn comparison_operators_respect_type_brackets() {
        let matcher = m(doc! { "n": { "$gt": 3, "$lte": 10 } });
        assert!(matcher.document_matches(&doc! { "n": 4.5 }));
        assert!(matcher.document_matches(&doc! { "n": 10i64 }));
        assert!(!matcher.document_matches(&doc! { "n": 3 }));
        assert!(!matcher.document_matches(&doc! { "n": "7" }));
    }

    #[test]
    fn in_nin_ne_exists() {
        assert!(m(doc! { "a": { "$in": [1, 2] } }).document_matches(&doc! { "a": 2 }));
        assert!(!m(doc! { "a": { "$nin": [1, 2] } }).document_matches(&doc! { "a": 2 }));
        assert!(m(doc! { "a": { "$ne": 1 } }).document_matches(&doc! {}));
        assert!(m(doc! { "a": { "$exists": false } }).document_matches(&doc! { "b": 1 }));
        assert!(!m(doc! { "a": { "$exists": true } }).document_matches(&doc! { "b": 1 }));
    }

    #[test]
    fn dotted_paths_walk_arrays_of_documents() {
        let matcher = m(doc! { "items.sku": "k2" });
        assert!(matcher.document_matches(&doc! { "items": [{ "sku": "k1" }, { "sku": "k2" }] }));
        assert!(m(doc! { "items.1.sku": "k2" }).document_matches(&doc! { "items": [{ "sku": "k1" }, { "sku": "k2" }] }));
    }

    #[test]
    fn null_equality_matches_missing_field() {
        assert!(m(doc! { "a": Bson::Null }).document_matches(&doc! { "b": 1 }));
    }

    #[test]
    fn rejects_unsupported_selectors() {
        assert!(Matcher::compile(&doc! { "$or": [{ "a": 1 }] }).is_err());
        assert!(Matcher::compile(&doc! { "a": { "b": 1 } }).is_err());
        assert!(Matcher::compile(&doc! { "a": [1, 2] }).is_err());
        assert!(Matcher::compile(&doc! { "a": { "$regex": "x" } }).is_err());
        assert!(Matcher::compile(&doc! { "a": { "$in": [{ "x": 1 }] } }).is_err());
        assert!(Matcher::compile(&doc! { "a": bson::Regex { pattern: "x".into(), options: String::new() } }).is_err());
    }

    #[test]
    fn unaffected_modifier_cannot_make_match() {
        let matcher = m(doc! { "foo": 1 });
        assert!(!matcher.can_become_true_by_modifier(&doc! { "$set": { "bar": 2 } }));
        assert!(matcher.can_become_true_by_modifier(&doc! { "$set": { "foo": 1 } }));
        assert!(!matcher.can_become_true_by_modifier(&doc! { "$set": { "foo": 2 } }));
    }

    #[test]
    fn modifier_probe_for_operators() {
        let ranged = m(doc! { "n": { "$gt": 5 } });
        assert!(ranged.can_become_true_by_modifier(&doc! { "$set": { "n": 6 } }));
        assert!(!ranged.can_become_true_by_modifier(&doc! { "$set": { "n": 5 } }));

        let ne = m(doc! { "s": { "$ne": "done" } });
        assert!(!ne.can_become_true_by_modifier(&doc! { "$set": { "s": "done" } }));
        assert!(ne.can_become_true_by_modifier(&doc! { "$set": { "s": "open" } }));

        let within = m(doc! { "c": { "$in": ["red", "blue"] } });
        assert!(!within.can_become_true_by_modifier(&doc! { "$set": { "c": "green" } }));
        assert!(within.can_become_true_by_modifier(&doc! { "$set": { "c": "blue" } }));
    }

    #[test]
    fn setting_subfield_of_expected_scalar_is_false() {
        let matcher = m(doc! { "a": { "$gt": 1 } });
        assert!(!matcher.can_become_true_by_modifier(&doc! { "$set": { "a.b": 3 } }));
        let eq = m(doc! { "a": 1 });
        assert!(!eq.can_become_true_by_modifier(&doc! { "$set": { "a.b": 3 } }));
    }

    #[test]
    fn conservative_answers() {
        let exists = m(doc! { "a": { "$exists": true } });
        assert!(exists.can_become_true_by_modifier(&doc! { "$unset": { "a": 1 } }));
        let numeric = m(doc! { "a.0": 1 });
        assert!(numeric.can_become_true_by_modifier(&doc! { "$set": { "a.0": 2 } }));
        assert!(m(doc! { "a": 1 }).can_become_true_by_modifier(&doc! { "a": 2 }));
    }
}
