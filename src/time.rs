use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::error::{EvaluatorError, EvaluatorResult};

/// Numeric epochs above this are treated as milliseconds.
pub const MILLIS_THRESHOLD: f64 = 1e11;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

pub fn normalize_interval_label(label: &str) -> String {
    label.trim().to_ascii_lowercase()
}

pub fn resolve_interval(intervals: &BTreeMap<String, u32>, label: &str) -> EvaluatorResult<u32> {
    let normalized = normalize_interval_label(label);
    match intervals.get(&normalized).copied() {
        Some(minutes) if minutes > 0 => Ok(minutes),
        _ => Err(EvaluatorError::UnsupportedInterval {
            label: label.to_string(),
        }),
    }
}

/// Reverse lookup used when only minutes are known (e.g. job labels).
pub fn interval_label_for(intervals: &BTreeMap<String, u32>, minutes: u32) -> Option<String> {
    intervals
        .iter()
        .find(|(_, value)| **value == minutes)
        .map(|(label, _)| label.clone())
}

pub fn validate_interval_minutes(minutes: u32) -> EvaluatorResult<u32> {
    if minutes == 0 || (1440 % minutes != 0 && minutes % 1440 != 0) {
        return Err(EvaluatorError::InvalidInterval { minutes });
    }
    Ok(minutes)
}

pub fn interval_seconds(interval_minutes: u32) -> i64 {
    i64::from(interval_minutes) * 60
}

pub fn align_down(ts: i64, interval_minutes: u32) -> i64 {
    let step = interval_seconds(interval_minutes).max(1);
    ts - ts.rem_euclid(step)
}

/// Starts of every complete window inside `[since, until]`, beginning at `floor(since)`.
pub fn window_starts(since_ts: i64, until_ts: i64, interval_minutes: u32) -> Vec<i64> {
    let step = interval_seconds(interval_minutes).max(1);
    let mut starts = Vec::new();
    let mut cursor = align_down(since_ts, interval_minutes);
    while cursor + step <= until_ts {
        starts.push(cursor);
        cursor += step;
    }
    starts
}

/// Parses a document timestamp into epoch seconds.
///
/// Accepts numeric epochs (seconds or milliseconds), numeric strings, RFC 3339 with `Z` or an
/// offset, and naive ISO-8601 forms which are read as UTC.
pub fn parse_timestamp(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(number) => number.as_f64().and_then(epoch_seconds),
        JsonValue::String(raw) => parse_timestamp_str(raw),
        _ => None,
    }
}

fn parse_timestamp_str(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(number) = trimmed.parse::<f64>() {
        return epoch_seconds(number);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(datetime_seconds(parsed.with_timezone(&Utc)));
    }
    let without_z = trimmed.strip_suffix('Z').unwrap_or(trimmed);
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(without_z, format) {
            return Some(datetime_seconds(naive.and_utc()));
        }
    }
    NaiveDate::parse_from_str(without_z, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| datetime_seconds(naive.and_utc()))
}

fn epoch_seconds(value: f64) -> Option<f64> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    if value > MILLIS_THRESHOLD {
        Some(value / 1000.0)
    } else {
        Some(value)
    }
}

fn datetime_seconds(dt: DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_millis()) / 1000.0
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
