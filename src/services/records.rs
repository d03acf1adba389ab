use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;

use crate::config::EvaluatorConfig;
use crate::store::{Document, DocumentStore, Filter, FindOptions, SortOrder};
use crate::types::{Evaluation, Window, WindowKey};

/// Inclusive bounds on `window_start_ts`; `None` leaves a side open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartRange {
    pub since_ts: Option<i64>,
    pub until_ts: Option<i64>,
}

fn series_filter(entity: &str, interval_minutes: u32) -> Filter {
    Filter::new()
        .eq("entity", entity)
        .eq("interval_minutes", interval_minutes)
}

fn start_filter(entity: &str, interval_minutes: u32, range: StartRange) -> Filter {
    series_filter(entity, interval_minutes).range_full(
        "window_start_ts",
        range.since_ts.map(|v| v as f64),
        None,
        None,
        range.until_ts.map(|v| v as f64),
    )
}

fn decode_all<T: DeserializeOwned>(collection: &str, docs: Vec<Document>) -> Vec<T> {
    docs.into_iter()
        .filter_map(|doc| match serde_json::from_value::<T>(doc) {
            Ok(record) => Some(record),
            Err(err) => {
                tracing::warn!(collection, error = %err, "skipping malformed stored record");
                None
            }
        })
        .collect()
}

fn upsert<T: Serialize>(
    store: &dyn DocumentStore,
    collection: &str,
    key: &WindowKey,
    record: &T,
) -> Result<()> {
    let document = serde_json::to_value(record).context("failed to serialize record")?;
    store
        .upsert_by_key(collection, &key.as_document_key(), document)
        .with_context(|| {
            format!(
                "failed to upsert {collection} {}/{}/{}",
                key.entity, key.interval_minutes, key.window_start_ts
            )
        })
}

pub fn upsert_window(
    store: &dyn DocumentStore,
    config: &EvaluatorConfig,
    window: &Window,
) -> Result<()> {
    upsert(store, &config.windows_collection, &window.key(), window)
}

pub fn upsert_evaluation(
    store: &dyn DocumentStore,
    config: &EvaluatorConfig,
    evaluation: &Evaluation,
) -> Result<()> {
    upsert(store, &config.evaluations_collection, &evaluation.key(), evaluation)
}

pub fn persisted_starts(
    store: &dyn DocumentStore,
    config: &EvaluatorConfig,
    entity: &str,
    interval_minutes: u32,
    range: StartRange,
) -> Result<BTreeSet<i64>> {
    let docs = store
        .find(
            &config.windows_collection,
            &start_filter(entity, interval_minutes, range),
            &FindOptions::default().project(&["window_start_ts"]),
        )
        .context("failed to read persisted window keys")?;
    Ok(docs
        .iter()
        .filter_map(|doc| doc.get("window_start_ts").and_then(|v| v.as_i64()))
        .collect())
}

pub fn latest_window(
    store: &dyn DocumentStore,
    config: &EvaluatorConfig,
    entity: &str,
    interval_minutes: u32,
) -> Result<Option<Window>> {
    let docs = store
        .find(
            &config.windows_collection,
            &series_filter(entity, interval_minutes),
            &FindOptions::sorted("window_start_ts", SortOrder::Desc).limit(1),
        )
        .context("failed to read latest window")?;
    Ok(decode_all(&config.windows_collection, docs).into_iter().next())
}

/// Most recent evaluation that ends at or before `key`'s start.
pub fn previous_evaluation(
    store: &dyn DocumentStore,
    config: &EvaluatorConfig,
    key: &WindowKey,
) -> Result<Option<Evaluation>> {
    let filter = series_filter(&key.entity, key.interval_minutes).range_full(
        "window_end_ts",
        None,
        None,
        None,
        Some(key.window_start_ts as f64),
    );
    let docs = store
        .find(
            &config.evaluations_collection,
            &filter,
            &FindOptions::sorted("window_end_ts", SortOrder::Desc).limit(1),
        )
        .context("failed to read previous evaluation")?;
    Ok(decode_all(&config.evaluations_collection, docs).into_iter().next())
}

pub fn windows_in_range(
    store: &dyn DocumentStore,
    config: &EvaluatorConfig,
    entity: &str,
    interval_minutes: u32,
    range: StartRange,
    order: SortOrder,
    limit: Option<usize>,
) -> Result<Vec<Window>> {
    let mut options = FindOptions::sorted("window_start_ts", order);
    options.limit = limit;
    let docs = store
        .find(
            &config.windows_collection,
            &start_filter(entity, interval_minutes, range),
            &options,
        )
        .context("failed to read windows")?;
    Ok(decode_all(&config.windows_collection, docs))
}

pub fn evaluations_in_range(
    store: &dyn DocumentStore,
    config: &EvaluatorConfig,
    entity: &str,
    interval_minutes: u32,
    range: StartRange,
    order: SortOrder,
    limit: Option<usize>,
) -> Result<Vec<Evaluation>> {
    let mut options = FindOptions::sorted("window_start_ts", order);
    options.limit = limit;
    let docs = store
        .find(
            &config.evaluations_collection,
            &start_filter(entity, interval_minutes, range),
            &options,
        )
        .context("failed to read evaluations")?;
    Ok(decode_all(&config.evaluations_collection, docs))
}
