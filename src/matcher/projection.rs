use bson::{Bson, Document};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum Rule {
    Leaf,
    Node(BTreeMap<String, Rule>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Include,
    Exclude,
}

/// Compiled field projection (`{a: 1, "b.c": 1}` or `{a: 0}`).
#[derive(Debug, Clone)]
pub struct Projection {
    mode: Mode,
    include_id: bool,
    rules: BTreeMap<String, Rule>,
}

fn projection_flag(v: &Bson) -> Option<bool> {
    match v {
        Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false) => Some(false),
        Bson::Int32(1) | Bson::Int64(1) | Bson::Boolean(true) => Some(true),
        Bson::Double(d) if *d == 0.0 => Some(false),
        Bson::Double(d) if *d == 1.0 => Some(true),
        _ => None,
    }
}

/// Rejects projections the oplog path cannot reproduce from deltas alone:
/// positional `$`, `$elemMatch`, `$meta`, `$slice` and non-flag values.
pub fn check_supported_projection(fields: &Document) -> Result<()> {
    for (path, value) in fields {
        if path.split('.').any(|part| part == "$") {
            return Err(Error::Matcher(format!("positional projection '{path}'")));
        }
        if let Bson::Document(d) = value
            && ["$elemMatch", "$meta", "$slice"].iter().any(|k| d.contains_key(*k))
        {
            return Err(Error::Matcher(format!("projection operator on '{path}'")));
        }
        if projection_flag(value).is_none() {
            return Err(Error::Matcher("projection values should be one of 1, 0, true, or false".into()));
        }
    }
    Ok(())
}

impl Projection {
    /// Projection that returns documents unchanged.
    pub fn all() -> Self {
        Self { mode: Mode::Exclude, include_id: true, rules: BTreeMap::new() }
    }

    pub fn compile(fields: &Document) -> Result<Self> {
        check_supported_projection(fields)?;

        let mut include_id = true;
        let mut has_inclusion = false;
        let mut has_exclusion = false;
        let mut rules = BTreeMap::new();
        for (path, value) in fields {
            let flag = projection_flag(value).unwrap_or(true);
            if path == "_id" {
                include_id = flag;
                continue;
            }
            if flag {
                has_inclusion = true;
            } else {
                has_exclusion = true;
            }
            insert_rule(&mut rules, &path.split('.').collect::<Vec<_>>());
        }
        if has_inclusion && has_exclusion {
            return Err(Error::Matcher("cannot both include and exclude fields".into()));
        }
        let mode = if has_inclusion { Mode::Include } else { Mode::Exclude };
        Ok(Self { mode, include_id, rules })
    }

    pub fn is_all(&self) -> bool {
        self.mode == Mode::Exclude && self.include_id && self.rules.is_empty()
    }

    pub fn apply(&self, doc: &Document) -> Document {
        match self.mode {
            Mode::Include => {
                let mut out = Document::new();
                if self.include_id
                    && let Some(id) = doc.get("_id")
                {
                    out.insert("_id", id.clone());
                }
                for (k, v) in include(doc, &self.rules) {
                    out.insert(k, v);
                }
                out
            }
            Mode::Exclude => {
                let mut out = doc.clone();
                exclude(&mut out, &self.rules);
                if !self.include_id {
                    out.remove("_id");
                }
                out
            }
        }
    }
}

fn insert_rule(rules: &mut BTreeMap<String, Rule>, segs: &[&str]) {
    let Some((first, rest)) = segs.split_first() else { return };
    if rest.is_empty() {
        // An ancestor rule covers every descendant rule.
        rules.insert(first.to_string(), Rule::Leaf);
        return;
    }
    let entry = rules.entry(first.to_string()).or_insert_with(|| Rule::Node(BTreeMap::new()));
    if let Rule::Node(children) = entry {
        insert_rule(children, rest);
    }
}

fn include(doc: &Document, rules: &BTreeMap<String, Rule>) -> Document {
    let mut out = Document::new();
    for (k, v) in doc {
        match rules.get(k) {
            Some(Rule::Leaf) => {
                out.insert(k.clone(), v.clone());
            }
            Some(Rule::Node(children)) => match v {
                Bson::Document(d) => {
                    out.insert(k.clone(), include(d, children));
                }
                Bson::Array(items) => {
                    let kept: Vec<Bson> = items
                        .iter()
                        .filter_map(|e| match e {
                            Bson::Document(d) => Some(Bson::Document(include(d, children))),
                            _ => None,
                        })
                        .collect();
                    out.insert(k.clone(), kept);
                }
                _ => {}
            },
            None => {}
        }
    }
    out
}

fn exclude(doc: &mut Document, rules: &BTreeMap<String, Rule>) {
    for (k, rule) in rules {
        match rule {
            Rule::Leaf => {
                doc.remove(k);
            }
            Rule::Node(children) => match doc.get_mut(k) {
                Some(Bson::Document(d)) => exclude(d, children),
                Some(Bson::Array(items)) => {
                    for item in items.iter_mut() {
                        if let Bson::Document(d) = item {
                            exclude(d, children);
                        }
                    }
                }
                _ => {}
            },
        }
    }
}

/// Widen `projection` so every path in `paths` survives it. An empty result
/// means "all fields".
pub fn combine_into_projection<'a>(paths: impl IntoIterator<Item = &'a str>, projection: &Document) -> Document {
    let important: Vec<String> = paths
        .into_iter()
        .map(|p| {
            // Numeric components address array elements; keep the array itself.
            p.split('.').take_while(|s| s.parse::<usize>().is_err()).collect::<Vec<_>>().join(".")
        })
        .filter(|p| !p.is_empty())
        .collect();

    let non_id: Vec<(&String, bool)> = projection
        .iter()
        .filter(|(k, _)| k.as_str() != "_id")
        .map(|(k, v)| (k, projection_flag(v).unwrap_or(true)))
        .collect();
    let id_flag = projection.get("_id").and_then(projection_flag);

    if non_id.is_empty() {
        // Only `_id` is mentioned: exclusion of `_id` or nothing.
        return match id_flag {
            Some(false) if !important.iter().any(|p| p == "_id") => projection.clone(),
            _ => Document::new(),
        };
    }

    let overlaps = |a: &str, b: &str| is_ancestor_path(a, b) || is_ancestor_path(b, a);

    if non_id[0].1 {
        let mut out = projection.clone();
        for p in &important {
            if p == "_id" {
                out.remove("_id");
                continue;
            }
            let covered = out.keys().any(|k| is_ancestor_path(k, p));
            if !covered {
                let descendants: Vec<String> = out.keys().filter(|k| is_ancestor_path(p, k)).cloned().collect();
                for d in descendants {
                    out.remove(&d);
                }
                out.insert(p.clone(), 1);
            }
        }
        out
    } else {
        let mut out = Document::new();
        for (k, v) in projection {
            if k == "_id" {
                if !important.iter().any(|p| p == "_id") {
                    out.insert(k.clone(), v.clone());
                }
                continue;
            }
            if !important.iter().any(|p| overlaps(p, k)) {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }
}

fn is_ancestor_path(a: &str, b: &str) -> bool {
    b.starts_with(a) && (b.len() == a.len() || b.as_bytes().get(a.len()) == Some(&b'.'))
}
