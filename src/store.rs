//! Persistence seam: the document store the evaluator reads streams from and upserts into.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

pub type Document = JsonValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq {
        field: String,
        value: JsonValue,
    },
    Regex {
        field: String,
        pattern: String,
    },
    Range {
        field: String,
        gte: Option<f64>,
        gt: Option<f64>,
        lt: Option<f64>,
        lte: Option<f64>,
    },
}

/// Conjunction of conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<JsonValue>) -> Self {
        self.conditions.push(Condition::Eq {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn regex(mut self, field: &str, pattern: impl Into<String>) -> Self {
        self.conditions.push(Condition::Regex {
            field: field.to_string(),
            pattern: pattern.into(),
        });
        self
    }

    /// Half-open `[gte, lt)` range on a numeric field.
    pub fn range(mut self, field: &str, gte: Option<f64>, lt: Option<f64>) -> Self {
        self.conditions.push(Condition::Range {
            field: field.to_string(),
            gte,
            gt: None,
            lt,
            lte: None,
        });
        self
    }

    pub fn range_full(
        mut self,
        field: &str,
        gte: Option<f64>,
        gt: Option<f64>,
        lt: Option<f64>,
        lte: Option<f64>,
    ) -> Self {
        self.conditions.push(Condition::Range {
            field: field.to_string(),
            gte,
            gt,
            lt,
            lte,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Vec<String>>,
    pub sort: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn sorted(field: &str, order: SortOrder) -> Self {
        Self {
            sort: Some((field.to_string(), order)),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn project(mut self, fields: &[&str]) -> Self {
        self.projection = Some(fields.iter().map(|field| field.to_string()).collect());
        self
    }
}

/// Blocking document store. Implementations must make `upsert_by_key` atomic per key.
pub trait DocumentStore: Send + Sync {
    fn find(&self, collection: &str, filter: &Filter, options: &FindOptions)
        -> Result<Vec<Document>>;

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64>;

    /// Replaces the document whose fields equal every entry of `key`, or inserts it.
    fn upsert_by_key(&self, collection: &str, key: &Map<String, JsonValue>, document: Document)
        -> Result<()>;
}

/// Escapes an entity for use inside an anchored case-insensitive pattern.
pub fn case_insensitive_exact(value: &str) -> String {
    format!("(?i)^{}$", regex::escape(value))
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, collection: &str, document: Document) {
        let mut guard = self
            .collections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.entry(collection.to_string()).or_default().push(document);
    }

    pub fn insert_many(&self, collection: &str, documents: impl IntoIterator<Item = Document>) {
        let mut guard = self
            .collections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .entry(collection.to_string())
            .or_default()
            .extend(documents);
    }

    pub fn len(&self, collection: &str) -> usize {
        let guard = self
            .collections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(collection).map(Vec::len).unwrap_or(0)
    }

    fn matching(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        let matcher = CompiledFilter::compile(filter)?;
        let guard = self
            .collections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| matcher.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl DocumentStore for MemoryStore {
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        let mut docs = self.matching(collection, filter)?;
        if let Some((field, order)) = &options.sort {
            docs.sort_by(|a, b| {
                let ordering = compare_values(a.get(field), b.get(field));
                match order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = options.limit {
            docs.truncate(limit);
        }
        if let Some(fields) = &options.projection {
            docs = docs
                .into_iter()
                .map(|doc| project(&doc, fields))
                .collect();
        }
        Ok(docs)
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<u64> {
        Ok(self.matching(collection, filter)?.len() as u64)
    }

    fn upsert_by_key(
        &self,
        collection: &str,
        key: &Map<String, JsonValue>,
        document: Document,
    ) -> Result<()> {
        let mut guard = self
            .collections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let docs = guard.entry(collection.to_string()).or_default();
        let existing = docs.iter_mut().find(|doc| {
            key.iter()
                .all(|(field, value)| doc.get(field).is_some_and(|v| values_equal(v, value)))
        });
        match existing {
            Some(slot) => *slot = document,
            None => docs.push(document),
        }
        Ok(())
    }
}

enum CompiledCondition<'a> {
    Eq(&'a str, &'a JsonValue),
    Regex(&'a str, Regex),
    Range {
        field: &'a str,
        gte: Option<f64>,
        gt: Option<f64>,
        lt: Option<f64>,
        lte: Option<f64>,
    },
}

struct CompiledFilter<'a> {
    conditions: Vec<CompiledCondition<'a>>,
}

impl<'a> CompiledFilter<'a> {
    fn compile(filter: &'a Filter) -> Result<Self> {
        let mut conditions = Vec::with_capacity(filter.conditions.len());
        for condition in &filter.conditions {
            conditions.push(match condition {
                Condition::Eq { field, value } => CompiledCondition::Eq(field, value),
                Condition::Regex { field, pattern } => CompiledCondition::Regex(
                    field,
                    Regex::new(pattern).with_context(|| format!("invalid regex {pattern:?}"))?,
                ),
                Condition::Range {
                    field,
                    gte,
                    gt,
                    lt,
                    lte,
                } => CompiledCondition::Range {
                    field,
                    gte: *gte,
                    gt: *gt,
                    lt: *lt,
                    lte: *lte,
                },
            });
        }
        Ok(Self { conditions })
    }

    fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|condition| match condition {
            CompiledCondition::Eq(field, value) => {
                doc.get(*field).is_some_and(|v| values_equal(v, value))
            }
            CompiledCondition::Regex(field, re) => doc
                .get(*field)
                .and_then(JsonValue::as_str)
                .is_some_and(|v| re.is_match(v)),
            CompiledCondition::Range {
                field,
                gte,
                gt,
                lt,
                lte,
            } => {
                // Range comparisons only match numeric values, like a typed index would.
                let Some(v) = doc.get(*field).and_then(JsonValue::as_f64) else {
                    return false;
                };
                gte.map_or(true, |bound| v >= bound)
                    && gt.map_or(true, |bound| v > bound)
                    && lt.map_or(true, |bound| v < bound)
                    && lte.map_or(true, |bound| v <= bound)
            }
        })
    }
}

fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_values(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x.cmp(y),
                _ => Ordering::Equal,
            },
        },
    }
}

fn project(doc: &Document, fields: &[String]) -> Document {
    let Some(object) = doc.as_object() else {
        return doc.clone();
    };
    let projected: Map<String, JsonValue> = fields
        .iter()
        .filter_map(|field| object.get(field).map(|v| (field.clone(), v.clone())))
        .collect();
    JsonValue::Object(projected)
}
