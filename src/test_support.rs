use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

use crate::config::EvaluatorConfig;
use crate::evaluator::WindowRiskEvaluator;
use crate::store::MemoryStore;

/// Source document with the default entity/timestamp fields merged into `extra`.
pub fn doc(entity: &str, ts: i64, extra: JsonValue) -> JsonValue {
    let mut document = json!({ "entity": entity, "ts": ts });
    if let (Some(target), JsonValue::Object(fields)) = (document.as_object_mut(), extra) {
        target.extend(fields);
    }
    document
}

pub fn store_with(documents: &[(&str, JsonValue)]) -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    for (collection, document) in documents {
        store.insert(collection, document.clone());
    }
    Arc::new(store)
}

pub fn evaluator(store: Arc<MemoryStore>) -> Arc<WindowRiskEvaluator> {
    Arc::new(WindowRiskEvaluator::new(store, EvaluatorConfig::default()))
}
