use anyhow::Result;
use serde::Serialize;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::{LocatorConfig, StreamConfig};
use crate::store::{case_insensitive_exact, Document, DocumentStore, Filter, FindOptions};
use crate::time::parse_timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocateStrategy {
    PrimarySeconds,
    PrimaryMillis,
    AlternateSeconds,
    AlternateMillis,
    CaseInsensitiveSeconds,
    CaseInsensitiveMillis,
    ManualScan,
}

impl LocateStrategy {
    pub const ORDERED: [LocateStrategy; 7] = [
        LocateStrategy::PrimarySeconds,
        LocateStrategy::PrimaryMillis,
        LocateStrategy::AlternateSeconds,
        LocateStrategy::AlternateMillis,
        LocateStrategy::CaseInsensitiveSeconds,
        LocateStrategy::CaseInsensitiveMillis,
        LocateStrategy::ManualScan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LocateStrategy::PrimarySeconds => "primary_seconds",
            LocateStrategy::PrimaryMillis => "primary_millis",
            LocateStrategy::AlternateSeconds => "alternate_seconds",
            LocateStrategy::AlternateMillis => "alternate_millis",
            LocateStrategy::CaseInsensitiveSeconds => "case_insensitive_seconds",
            LocateStrategy::CaseInsensitiveMillis => "case_insensitive_millis",
            LocateStrategy::ManualScan => "manual_scan",
        }
    }

    fn millis(&self) -> bool {
        matches!(
            self,
            LocateStrategy::PrimaryMillis
                | LocateStrategy::AlternateMillis
                | LocateStrategy::CaseInsensitiveMillis
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: LocateStrategy,
    pub matched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LocateResult {
    pub documents: Vec<Document>,
    pub strategy: Option<LocateStrategy>,
    pub attempts: Vec<StrategyAttempt>,
}

/// Finds a stream's documents for one entity and range despite inconsistent field naming and
/// timestamp encodings. The winning strategy per (entity, stream) is remembered and tried first
/// on later calls.
pub struct SignalLocator {
    store: Arc<dyn DocumentStore>,
    config: LocatorConfig,
    detected: RwLock<HashMap<(String, String), LocateStrategy>>,
}

impl SignalLocator {
    pub fn new(store: Arc<dyn DocumentStore>, config: LocatorConfig) -> Self {
        Self {
            store,
            config,
            detected: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached_strategy(&self, entity: &str, stream: &str) -> Option<LocateStrategy> {
        let guard = self
            .detected
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(&(entity.to_string(), stream.to_string())).copied()
    }

    /// Documents for `[start_ts, end_ts)`. Never fails: store errors are recorded per attempt.
    pub fn locate(
        &self,
        stream: &StreamConfig,
        entity: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> LocateResult {
        let mut result = LocateResult::default();
        for strategy in self.strategy_order(entity, &stream.name) {
            match self.run_strategy(strategy, &stream.collection, entity, start_ts, end_ts) {
                Ok(documents) => {
                    result.attempts.push(StrategyAttempt {
                        strategy,
                        matched: documents.len(),
                        error: None,
                    });
                    if !documents.is_empty() {
                        self.remember(entity, &stream.name, strategy);
                        result.documents = documents;
                        result.strategy = Some(strategy);
                        return result;
                    }
                }
                Err(err) => {
                    tracing::debug!(
                        stream = %stream.name,
                        entity,
                        strategy = strategy.as_str(),
                        error = %format!("{err:#}"),
                        "locator strategy failed"
                    );
                    result.attempts.push(StrategyAttempt {
                        strategy,
                        matched: 0,
                        error: Some(format!("{err:#}")),
                    });
                }
            }
        }
        result
    }

    fn strategy_order(&self, entity: &str, stream: &str) -> Vec<LocateStrategy> {
        let mut order = LocateStrategy::ORDERED.to_vec();
        if let Some(cached) = self.cached_strategy(entity, stream) {
            order.retain(|strategy| *strategy != cached);
            order.insert(0, cached);
        }
        order
    }

    fn remember(&self, entity: &str, stream: &str, strategy: LocateStrategy) {
        if self.cached_strategy(entity, stream) == Some(strategy) {
            return;
        }
        let mut guard = self
            .detected
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert((entity.to_string(), stream.to_string()), strategy);
    }

    fn run_strategy(
        &self,
        strategy: LocateStrategy,
        collection: &str,
        entity: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<Document>> {
        if strategy == LocateStrategy::ManualScan {
            return self.manual_scan(collection, entity, start_ts, end_ts);
        }

        let scale = if strategy.millis() { 1000.0 } else { 1.0 };
        let base = match strategy {
            LocateStrategy::PrimarySeconds | LocateStrategy::PrimaryMillis => {
                Filter::new().eq(&self.config.entity_field, entity)
            }
            LocateStrategy::AlternateSeconds | LocateStrategy::AlternateMillis => {
                Filter::new().eq(&self.config.alt_entity_field, entity)
            }
            _ => Filter::new().regex(&self.config.entity_field, case_insensitive_exact(entity)),
        };
        let filter = base.range(
            &self.config.timestamp_field,
            Some(start_ts as f64 * scale),
            Some(end_ts as f64 * scale),
        );
        self.store
            .find(collection, &filter, &FindOptions::default())
    }

    /// Most recent `scan_limit` documents per entity field, ordered by whichever timestamp field
    /// parses, then filtered to the window. Documents without a parseable timestamp are skipped.
    fn manual_scan(
        &self,
        collection: &str,
        entity: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<Document>> {
        let pattern = case_insensitive_exact(entity);
        let primary = Regex::new(&pattern)?;

        let mut out = Vec::new();
        let fields = [&self.config.entity_field, &self.config.alt_entity_field];
        for (pass, field) in fields.into_iter().enumerate() {
            let candidates = self.store.find(
                collection,
                &Filter::new().regex(field, pattern.clone()),
                &FindOptions::default(),
            )?;
            let alternate_pass = pass > 0;
            let mut stamped: Vec<(f64, Document)> = candidates
                .into_iter()
                // already returned by the primary-field pass
                .filter(|doc| !(alternate_pass && self.matches_field(doc, &primary)))
                .filter_map(|doc| self.document_timestamp(&doc).map(|ts| (ts, doc)))
                .collect();
            stamped.sort_by(|a, b| b.0.total_cmp(&a.0));
            stamped.truncate(self.config.scan_limit);
            out.extend(
                stamped
                    .into_iter()
                    .filter(|(ts, _)| *ts >= start_ts as f64 && *ts < end_ts as f64)
                    .map(|(_, doc)| doc),
            );
        }
        Ok(out)
    }

    fn matches_field(&self, doc: &Document, pattern: &Regex) -> bool {
        doc.get(self.config.entity_field.as_str())
            .and_then(|v| v.as_str())
            .is_some_and(|v| pattern.is_match(v))
    }

    pub fn document_timestamp(&self, doc: &Document) -> Option<f64> {
        document_timestamp(doc, &self.config)
    }
}

pub fn document_timestamp(doc: &Document, config: &LocatorConfig) -> Option<f64> {
    std::iter::once(&config.timestamp_field)
        .chain(config.scan_timestamp_fields.iter())
        .find_map(|field| doc.get(field.as_str()).and_then(parse_timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MacroGroup, StreamKind};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn stream() -> StreamConfig {
        StreamConfig {
            name: "social".to_string(),
            collection: "social_posts".to_string(),
            kind: StreamKind::Sentiment,
            weight: 1.0,
            macro_group: MacroGroup::Sentiment,
        }
    }

    fn locator(store: Arc<MemoryStore>) -> SignalLocator {
        SignalLocator::new(store, LocatorConfig::default())
    }

    #[test]
    fn prefers_primary_field_with_seconds() {
        let store = Arc::new(MemoryStore::new());
        store.insert("social_posts", json!({ "entity": "acme", "ts": 1_050 }));
        store.insert("social_posts", json!({ "entity": "acme", "ts": 5_000 }));
        let result = locator(store).locate(&stream(), "acme", 1_000, 2_000);
        assert_eq!(result.strategy, Some(LocateStrategy::PrimarySeconds));
        assert_eq!(result.documents.len(), 1);
        assert_eq!(result.attempts.len(), 1);
    }

    #[test]
    fn falls_back_to_millis_then_alternate_field() {
        let store = Arc::new(MemoryStore::new());
        store.insert("social_posts", json!({ "entity_id": "acme", "ts": 1_500_000 }));
        let result = locator(store).locate(&stream(), "acme", 1_000, 2_000);
        assert_eq!(result.strategy, Some(LocateStrategy::AlternateMillis));
        assert_eq!(result.attempts.len(), 4);
    }

    #[test]
    fn matches_entity_case_insensitively() {
        let store = Arc::new(MemoryStore::new());
        store.insert("social_posts", json!({ "entity": "ACME", "ts": 1_200 }));
        let result = locator(store).locate(&stream(), "acme", 1_000, 2_000);
        assert_eq!(result.strategy, Some(LocateStrategy::CaseInsensitiveSeconds));
    }

    #[test]
    fn manual_scan_parses_iso_and_skips_garbage() {
        let store = Arc::new(MemoryStore::new());
        // 1_700_000_000 == 2023-11-14T22:13:20Z
        store.insert_many(
            "social_posts",
            vec![
                json!({ "entity": "acme", "timestamp": "2023-11-14T22:13:20Z" }),
                json!({ "entity": "acme", "created_at": "2023-11-14T22:20:00" }),
                json!({ "entity": "acme", "ts": "yesterday-ish" }),
                json!({ "entity": "acme", "timestamp": "2023-11-15T22:13:20Z" }),
            ],
        );
        let result = locator(store).locate(&stream(), "acme", 1_700_000_000, 1_700_003_600);
        assert_eq!(result.strategy, Some(LocateStrategy::ManualScan));
        assert_eq!(result.documents.len(), 2);
    }

    #[test]
    fn manual_scan_keeps_newest_documents_by_parsed_timestamp() {
        let store = Arc::new(MemoryStore::new());
        let end = 1_700_000_000_i64;
        let posts: Vec<_> = (0..600)
            .map(|minute| {
                let at = chrono::DateTime::from_timestamp(end - 36_000 + minute * 60, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_default();
                json!({ "entity": "acme", "created_at": at, "sentiment": -1 })
            })
            .collect();
        store.insert_many("social_posts", posts);

        let result = locator(store).locate(&stream(), "acme", end - 3_600, end);
        assert_eq!(result.strategy, Some(LocateStrategy::ManualScan));
        assert_eq!(result.documents.len(), 60);
    }

    #[test]
    fn manual_scan_keeps_identical_documents() {
        let store = Arc::new(MemoryStore::new());
        let post = json!({ "entity": "acme", "entity_id": "acme", "time": "2023-11-14T22:30:00Z" });
        store.insert_many("social_posts", vec![post.clone(), post]);
        store.insert(
            "social_posts",
            json!({ "entity_id": "ACME", "time": "2023-11-14T22:40:00Z" }),
        );
        let result = locator(store).locate(&stream(), "acme", 1_700_000_000, 1_700_003_600);
        assert_eq!(result.strategy, Some(LocateStrategy::ManualScan));
        assert_eq!(result.documents.len(), 3);
    }

    #[test]
    fn reports_every_attempt_when_nothing_matches() {
        let store = Arc::new(MemoryStore::new());
        let result = locator(store).locate(&stream(), "acme", 0, 100);
        assert!(result.documents.is_empty());
        assert_eq!(result.strategy, None);
        let attempted: Vec<LocateStrategy> =
            result.attempts.iter().map(|attempt| attempt.strategy).collect();
        assert_eq!(attempted, LocateStrategy::ORDERED.to_vec());
    }

    #[test]
    fn remembers_winning_strategy() {
        let store = Arc::new(MemoryStore::new());
        store.insert("social_posts", json!({ "entity": "acme", "ts": 1_500_000 }));
        let locator = locator(store);
        locator.locate(&stream(), "acme", 1_000, 2_000);
        assert_eq!(
            locator.cached_strategy("acme", "social"),
            Some(LocateStrategy::PrimaryMillis)
        );
        let second = locator.locate(&stream(), "acme", 1_000, 2_000);
        assert_eq!(second.attempts.len(), 1);
    }
}
