use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "RISK_EVALUATOR_CONFIG_PATH";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Sentiment,
    Rating,
    Flagged,
    Price,
}

/// Macro component a stream feeds in the stability blend. `volume` is derived from counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MacroGroup {
    Wl,
    Market,
    Sentiment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    pub name: String,
    pub collection: String,
    pub kind: StreamKind,
    #[serde(default = "default_stream_weight")]
    pub weight: f64,
    pub macro_group: MacroGroup,
}

fn default_stream_weight() -> f64 {
    1.0
}

fn default_streams() -> Vec<StreamConfig> {
    vec![
        StreamConfig {
            name: "social".to_string(),
            collection: "social_posts".to_string(),
            kind: StreamKind::Sentiment,
            weight: 0.3,
            macro_group: MacroGroup::Sentiment,
        },
        StreamConfig {
            name: "reviews".to_string(),
            collection: "reviews".to_string(),
            kind: StreamKind::Rating,
            weight: 0.2,
            macro_group: MacroGroup::Sentiment,
        },
        StreamConfig {
            name: "transactions".to_string(),
            collection: "transactions".to_string(),
            kind: StreamKind::Flagged,
            weight: 0.3,
            macro_group: MacroGroup::Wl,
        },
        StreamConfig {
            name: "prices".to_string(),
            collection: "prices".to_string(),
            kind: StreamKind::Price,
            weight: 0.2,
            macro_group: MacroGroup::Market,
        },
    ]
}

fn default_intervals() -> BTreeMap<String, u32> {
    BTreeMap::from([
        ("30m".to_string(), 30),
        ("1h".to_string(), 60),
        ("1d".to_string(), 1440),
    ])
}

fn default_windows_collection() -> String {
    "risk_windows".to_string()
}

fn default_evaluations_collection() -> String {
    "risk_evaluations".to_string()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocatorConfig {
    #[serde(default = "default_entity_field")]
    pub entity_field: String,
    #[serde(default = "default_alt_entity_field")]
    pub alt_entity_field: String,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    #[serde(default = "default_scan_timestamp_fields")]
    pub scan_timestamp_fields: Vec<String>,
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
}

fn default_entity_field() -> String {
    "entity".to_string()
}

fn default_alt_entity_field() -> String {
    "entity_id".to_string()
}

fn default_timestamp_field() -> String {
    "ts".to_string()
}

fn default_scan_timestamp_fields() -> Vec<String> {
    strings(&["ts", "timestamp", "created_at", "time"])
}

fn default_scan_limit() -> usize {
    500
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            entity_field: default_entity_field(),
            alt_entity_field: default_alt_entity_field(),
            timestamp_field: default_timestamp_field(),
            scan_timestamp_fields: default_scan_timestamp_fields(),
            scan_limit: default_scan_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalConfig {
    #[serde(default = "default_sentiment_fields")]
    pub sentiment_fields: Vec<String>,
    #[serde(default = "default_text_fields")]
    pub text_fields: Vec<String>,
    #[serde(default = "default_positive_keywords")]
    pub positive_keywords: Vec<String>,
    #[serde(default = "default_negative_keywords")]
    pub negative_keywords: Vec<String>,
    #[serde(default = "default_rating_fields")]
    pub rating_fields: Vec<String>,
    #[serde(default = "default_rating_min")]
    pub rating_min: f64,
    #[serde(default = "default_rating_max")]
    pub rating_max: f64,
    #[serde(default = "default_status_fields")]
    pub status_fields: Vec<String>,
    #[serde(default = "default_flagged_vocabulary")]
    pub flagged_vocabulary: Vec<String>,
    #[serde(default = "default_price_fields")]
    pub price_fields: Vec<String>,
    #[serde(default = "default_min_price_points")]
    pub min_price_points: usize,
    #[serde(default = "default_volatility_ceiling")]
    pub volatility_ceiling: f64,
}

fn default_sentiment_fields() -> Vec<String> {
    strings(&["sentiment", "sentiment_score", "polarity", "compound"])
}

fn default_text_fields() -> Vec<String> {
    strings(&["text", "content", "body", "title", "message"])
}

fn default_positive_keywords() -> Vec<String> {
    strings(&[
        "good", "great", "excellent", "love", "happy", "recommend", "fast", "reliable", "trust",
        "amazing",
    ])
}

fn default_negative_keywords() -> Vec<String> {
    strings(&[
        "bad", "terrible", "scam", "fraud", "hate", "slow", "broken", "refund", "angry", "awful",
        "stolen", "fake",
    ])
}

fn default_rating_fields() -> Vec<String> {
    strings(&["rating", "stars", "score"])
}

fn default_rating_min() -> f64 {
    1.0
}

fn default_rating_max() -> f64 {
    5.0
}

fn default_status_fields() -> Vec<String> {
    strings(&["status", "state", "label"])
}

fn default_flagged_vocabulary() -> Vec<String> {
    strings(&["flagged", "fraud", "chargeback", "blocked", "suspicious"])
}

fn default_price_fields() -> Vec<String> {
    strings(&["price", "close", "last", "value"])
}

fn default_min_price_points() -> usize {
    3
}

fn default_volatility_ceiling() -> f64 {
    0.05
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            sentiment_fields: default_sentiment_fields(),
            text_fields: default_text_fields(),
            positive_keywords: default_positive_keywords(),
            negative_keywords: default_negative_keywords(),
            rating_fields: default_rating_fields(),
            rating_min: default_rating_min(),
            rating_max: default_rating_max(),
            status_fields: default_status_fields(),
            flagged_vocabulary: default_flagged_vocabulary(),
            price_fields: default_price_fields(),
            min_price_points: default_min_price_points(),
            volatility_ceiling: default_volatility_ceiling(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MacroBlendConfig {
    #[serde(default = "default_wl_weight")]
    pub wl: f64,
    #[serde(default = "default_market_weight")]
    pub market: f64,
    #[serde(default = "default_sentiment_weight")]
    pub sentiment: f64,
    #[serde(default = "default_volume_weight")]
    pub volume: f64,
    /// Document count at which the volume component saturates.
    #[serde(default = "default_volume_ceiling")]
    pub volume_ceiling: f64,
    #[serde(default = "default_max_drivers")]
    pub max_drivers: usize,
}

fn default_wl_weight() -> f64 {
    0.35
}

fn default_market_weight() -> f64 {
    0.25
}

fn default_sentiment_weight() -> f64 {
    0.25
}

fn default_volume_weight() -> f64 {
    0.15
}

fn default_volume_ceiling() -> f64 {
    200.0
}

fn default_max_drivers() -> usize {
    3
}

impl Default for MacroBlendConfig {
    fn default() -> Self {
        Self {
            wl: default_wl_weight(),
            market: default_market_weight(),
            sentiment: default_sentiment_weight(),
            volume: default_volume_weight(),
            volume_ceiling: default_volume_ceiling(),
            max_drivers: default_max_drivers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncidentConfig {
    #[serde(default = "default_flagged_threshold")]
    pub flagged_threshold: f64,
    #[serde(default = "default_flagged_scale")]
    pub flagged_scale: f64,
    #[serde(default = "default_flagged_cap")]
    pub flagged_cap: f64,
    #[serde(default = "default_volatility_threshold")]
    pub volatility_threshold: f64,
    #[serde(default = "default_volatility_scale")]
    pub volatility_scale: f64,
    #[serde(default = "default_volatility_cap")]
    pub volatility_cap: f64,
    #[serde(default = "default_total_cap")]
    pub total_cap: f64,
}

fn default_flagged_threshold() -> f64 {
    0.3
}

fn default_flagged_scale() -> f64 {
    0.5
}

fn default_flagged_cap() -> f64 {
    0.25
}

fn default_volatility_threshold() -> f64 {
    0.6
}

fn default_volatility_scale() -> f64 {
    0.4
}

fn default_volatility_cap() -> f64 {
    0.15
}

fn default_total_cap() -> f64 {
    0.3
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            flagged_threshold: default_flagged_threshold(),
            flagged_scale: default_flagged_scale(),
            flagged_cap: default_flagged_cap(),
            volatility_threshold: default_volatility_threshold(),
            volatility_scale: default_volatility_scale(),
            volatility_cap: default_volatility_cap(),
            total_cap: default_total_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DampeningConfig {
    #[serde(default = "default_dampening_exponent")]
    pub exponent: f64,
    #[serde(default = "default_incident_scale")]
    pub incident_scale: f64,
}

fn default_dampening_exponent() -> f64 {
    0.5
}

fn default_incident_scale() -> f64 {
    1.0
}

impl Default for DampeningConfig {
    fn default() -> Self {
        Self {
            exponent: default_dampening_exponent(),
            incident_scale: default_incident_scale(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmoothingConfig {
    #[serde(default = "default_alpha_rise")]
    pub alpha_rise: f64,
    #[serde(default = "default_alpha_fall")]
    pub alpha_fall: f64,
    /// Percentage points; smaller moves are treated as unchanged.
    #[serde(default = "default_min_delta_pct")]
    pub min_delta_pct: f64,
    #[serde(default = "default_max_rise_pct")]
    pub max_rise_pct: f64,
    #[serde(default = "default_max_drop_pct")]
    pub max_drop_pct: f64,
}

fn default_alpha_rise() -> f64 {
    0.5
}

fn default_alpha_fall() -> f64 {
    0.2
}

fn default_min_delta_pct() -> f64 {
    0.5
}

fn default_max_rise_pct() -> f64 {
    15.0
}

fn default_max_drop_pct() -> f64 {
    10.0
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            alpha_rise: default_alpha_rise(),
            alpha_fall: default_alpha_fall(),
            min_delta_pct: default_min_delta_pct(),
            max_rise_pct: default_max_rise_pct(),
            max_drop_pct: default_max_drop_pct(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HysteresisConfig {
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    #[serde(default = "default_release_delta")]
    pub release_delta: f64,
    #[serde(default = "default_consecutive_required")]
    pub consecutive_required: u32,
}

fn default_high_threshold() -> f64 {
    70.0
}

fn default_release_delta() -> f64 {
    10.0
}

fn default_consecutive_required() -> u32 {
    2
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            high_threshold: default_high_threshold(),
            release_delta: default_release_delta(),
            consecutive_required: default_consecutive_required(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackfillConfig {
    #[serde(default = "default_max_backfill_hours")]
    pub max_backfill_hours: u32,
    #[serde(default = "default_max_hours_by_interval")]
    pub max_hours_by_interval: BTreeMap<String, u32>,
    #[serde(default = "default_max_job_errors")]
    pub max_job_errors: usize,
    #[serde(default = "default_job_retention_minutes")]
    pub job_retention_minutes: i64,
    /// Ceiling for a caller-requested horizon.
    #[serde(default = "default_max_requested_hours")]
    pub max_requested_hours: u32,
}

fn default_max_backfill_hours() -> u32 {
    168
}

fn default_max_hours_by_interval() -> BTreeMap<String, u32> {
    BTreeMap::from([
        ("30m".to_string(), 48),
        ("1h".to_string(), 168),
        ("1d".to_string(), 90 * 24),
    ])
}

fn default_max_job_errors() -> usize {
    50
}

fn default_job_retention_minutes() -> i64 {
    60
}

fn default_max_requested_hours() -> u32 {
    365 * 24
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            max_backfill_hours: default_max_backfill_hours(),
            max_hours_by_interval: default_max_hours_by_interval(),
            max_job_errors: default_max_job_errors(),
            job_retention_minutes: default_job_retention_minutes(),
            max_requested_hours: default_max_requested_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyntheticConfig {
    #[serde(default = "default_synthetic_min")]
    pub min_component: f64,
    #[serde(default = "default_synthetic_max")]
    pub max_component: f64,
}

fn default_synthetic_min() -> f64 {
    0.1
}

fn default_synthetic_max() -> f64 {
    0.45
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            min_component: default_synthetic_min(),
            max_component: default_synthetic_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluatorConfig {
    #[serde(default = "default_intervals")]
    pub intervals: BTreeMap<String, u32>,
    #[serde(default = "default_windows_collection")]
    pub windows_collection: String,
    #[serde(default = "default_evaluations_collection")]
    pub evaluations_collection: String,
    #[serde(default = "default_streams")]
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub locator: LocatorConfig,
    #[serde(default)]
    pub signals: SignalConfig,
    #[serde(default)]
    pub macro_blend: MacroBlendConfig,
    #[serde(default)]
    pub incident: IncidentConfig,
    #[serde(default)]
    pub dampening: DampeningConfig,
    #[serde(default)]
    pub smoothing: SmoothingConfig,
    #[serde(default)]
    pub hysteresis: HysteresisConfig,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            intervals: default_intervals(),
            windows_collection: default_windows_collection(),
            evaluations_collection: default_evaluations_collection(),
            streams: default_streams(),
            locator: LocatorConfig::default(),
            signals: SignalConfig::default(),
            macro_blend: MacroBlendConfig::default(),
            incident: IncidentConfig::default(),
            dampening: DampeningConfig::default(),
            smoothing: SmoothingConfig::default(),
            hysteresis: HysteresisConfig::default(),
            backfill: BackfillConfig::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

// Override document: every field optional, merged section by section onto the defaults.

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub intervals: Option<BTreeMap<String, u32>>,
    #[serde(default)]
    pub windows_collection: Option<String>,
    #[serde(default)]
    pub evaluations_collection: Option<String>,
    /// Replaces the stream list wholesale.
    #[serde(default)]
    pub streams: Option<Vec<StreamConfig>>,
    /// Per-stream weight overrides keyed by stream name.
    #[serde(default)]
    pub component_weights: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub locator: Option<LocatorOverrides>,
    #[serde(default)]
    pub signals: Option<SignalOverrides>,
    #[serde(default)]
    pub macro_blend: Option<MacroBlendOverrides>,
    #[serde(default)]
    pub incident: Option<IncidentOverrides>,
    #[serde(default)]
    pub dampening: Option<DampeningOverrides>,
    #[serde(default)]
    pub smoothing: Option<SmoothingOverrides>,
    #[serde(default)]
    pub hysteresis: Option<HysteresisOverrides>,
    #[serde(default)]
    pub backfill: Option<BackfillOverrides>,
    #[serde(default)]
    pub synthetic: Option<SyntheticOverrides>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocatorOverrides {
    pub entity_field: Option<String>,
    pub alt_entity_field: Option<String>,
    pub timestamp_field: Option<String>,
    pub scan_timestamp_fields: Option<Vec<String>>,
    pub scan_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalOverrides {
    pub sentiment_fields: Option<Vec<String>>,
    pub text_fields: Option<Vec<String>>,
    pub positive_keywords: Option<Vec<String>>,
    pub negative_keywords: Option<Vec<String>>,
    pub rating_fields: Option<Vec<String>>,
    pub rating_min: Option<f64>,
    pub rating_max: Option<f64>,
    pub status_fields: Option<Vec<String>>,
    pub flagged_vocabulary: Option<Vec<String>>,
    pub price_fields: Option<Vec<String>>,
    pub min_price_points: Option<usize>,
    pub volatility_ceiling: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MacroBlendOverrides {
    pub wl: Option<f64>,
    pub market: Option<f64>,
    pub sentiment: Option<f64>,
    pub volume: Option<f64>,
    pub volume_ceiling: Option<f64>,
    pub max_drivers: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncidentOverrides {
    pub flagged_threshold: Option<f64>,
    pub flagged_scale: Option<f64>,
    pub flagged_cap: Option<f64>,
    pub volatility_threshold: Option<f64>,
    pub volatility_scale: Option<f64>,
    pub volatility_cap: Option<f64>,
    pub total_cap: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DampeningOverrides {
    pub exponent: Option<f64>,
    pub incident_scale: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmoothingOverrides {
    pub alpha_rise: Option<f64>,
    pub alpha_fall: Option<f64>,
    pub min_delta_pct: Option<f64>,
    pub max_rise_pct: Option<f64>,
    pub max_drop_pct: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HysteresisOverrides {
    pub high_threshold: Option<f64>,
    pub release_delta: Option<f64>,
    pub consecutive_required: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackfillOverrides {
    pub max_backfill_hours: Option<u32>,
    pub max_hours_by_interval: Option<BTreeMap<String, u32>>,
    pub max_job_errors: Option<usize>,
    pub job_retention_minutes: Option<i64>,
    pub max_requested_hours: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyntheticOverrides {
    pub min_component: Option<f64>,
    pub max_component: Option<f64>,
}

macro_rules! merge_fields {
    ($target:expr, $source:expr; $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $source.$field.clone() {
                $target.$field = value;
            }
        )+
    };
}

impl EvaluatorConfig {
    /// Defaults merged with the override document named by `RISK_EVALUATOR_CONFIG_PATH`.
    pub fn load() -> Self {
        match config_path_from_env() {
            Some(path) => Self::load_from_path(&path),
            None => Self::default(),
        }
    }

    /// Unreadable or invalid override documents fall back to defaults with a warning.
    pub fn load_from_path(path: &Path) -> Self {
        match read_overrides(path) {
            Ok(overrides) => {
                let mut config = Self::default();
                config.apply_overrides(&overrides);
                config.sanitized()
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "failed to load evaluator config overrides; using defaults"
                );
                Self::default()
            }
        }
    }

    pub fn from_override_document(document: &JsonValue) -> Result<Self> {
        let overrides: ConfigOverrides = serde_json::from_value(document.clone())
            .context("invalid evaluator config override document")?;
        let mut config = Self::default();
        config.apply_overrides(&overrides);
        Ok(config.sanitized())
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(intervals) = &overrides.intervals {
            for (label, minutes) in intervals {
                self.intervals
                    .insert(crate::time::normalize_interval_label(label), *minutes);
            }
        }
        if let Some(name) = overrides
            .windows_collection
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            self.windows_collection = name.to_string();
        }
        if let Some(name) = overrides
            .evaluations_collection
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            self.evaluations_collection = name.to_string();
        }
        if let Some(streams) = overrides.streams.as_ref().filter(|s| !s.is_empty()) {
            self.streams = streams.clone();
        }
        if let Some(weights) = &overrides.component_weights {
            for stream in &mut self.streams {
                if let Some(weight) = weights.get(&stream.name) {
                    stream.weight = *weight;
                }
            }
        }
        if let Some(o) = &overrides.locator {
            merge_fields!(
                self.locator, o;
                entity_field, alt_entity_field, timestamp_field, scan_timestamp_fields, scan_limit
            );
        }
        if let Some(o) = &overrides.signals {
            merge_fields!(
                self.signals, o;
                sentiment_fields, text_fields, positive_keywords, negative_keywords,
                rating_fields, rating_min, rating_max, status_fields, flagged_vocabulary,
                price_fields, min_price_points, volatility_ceiling,
            );
        }
        if let Some(o) = &overrides.macro_blend {
            merge_fields!(
                self.macro_blend, o;
                wl, market, sentiment, volume, volume_ceiling, max_drivers
            );
        }
        if let Some(o) = &overrides.incident {
            merge_fields!(
                self.incident, o;
                flagged_threshold, flagged_scale, flagged_cap, volatility_threshold,
                volatility_scale, volatility_cap, total_cap,
            );
        }
        if let Some(o) = &overrides.dampening {
            merge_fields!(self.dampening, o; exponent, incident_scale);
        }
        if let Some(o) = &overrides.smoothing {
            merge_fields!(
                self.smoothing, o;
                alpha_rise, alpha_fall, min_delta_pct, max_rise_pct, max_drop_pct
            );
        }
        if let Some(o) = &overrides.hysteresis {
            merge_fields!(self.hysteresis, o; high_threshold, release_delta, consecutive_required);
        }
        if let Some(o) = &overrides.backfill {
            merge_fields!(
                self.backfill, o;
                max_backfill_hours, max_job_errors, job_retention_minutes, max_requested_hours
            );
            if let Some(by_interval) = &o.max_hours_by_interval {
                for (label, hours) in by_interval {
                    self.backfill
                        .max_hours_by_interval
                        .insert(crate::time::normalize_interval_label(label), *hours);
                }
            }
        }
        if let Some(o) = &overrides.synthetic {
            merge_fields!(self.synthetic, o; min_component, max_component);
        }
    }

    /// Clamps values that would make the math degenerate (negative weights, alphas outside (0,1]).
    pub fn sanitized(mut self) -> Self {
        for stream in &mut self.streams {
            stream.weight = non_negative(stream.weight, 0.0);
        }
        self.intervals.retain(|_, minutes| *minutes > 0);
        self.locator.scan_limit = self.locator.scan_limit.max(1);

        let s = &mut self.signals;
        if !(s.rating_max > s.rating_min) {
            s.rating_min = default_rating_min();
            s.rating_max = default_rating_max();
        }
        s.min_price_points = s.min_price_points.max(3);
        if !(s.volatility_ceiling > 0.0) {
            s.volatility_ceiling = default_volatility_ceiling();
        }

        let m = &mut self.macro_blend;
        m.wl = non_negative(m.wl, default_wl_weight());
        m.market = non_negative(m.market, default_market_weight());
        m.sentiment = non_negative(m.sentiment, default_sentiment_weight());
        m.volume = non_negative(m.volume, default_volume_weight());
        if !(m.volume_ceiling > 0.0) {
            m.volume_ceiling = default_volume_ceiling();
        }

        let i = &mut self.incident;
        i.flagged_scale = non_negative(i.flagged_scale, default_flagged_scale());
        i.flagged_cap = non_negative(i.flagged_cap, default_flagged_cap());
        i.volatility_scale = non_negative(i.volatility_scale, default_volatility_scale());
        i.volatility_cap = non_negative(i.volatility_cap, default_volatility_cap());
        i.total_cap = non_negative(i.total_cap, default_total_cap());

        if !(self.dampening.exponent > 0.0) {
            self.dampening.exponent = default_dampening_exponent();
        }
        self.dampening.incident_scale =
            non_negative(self.dampening.incident_scale, default_incident_scale());

        let sm = &mut self.smoothing;
        sm.alpha_rise = unit_alpha(sm.alpha_rise, default_alpha_rise());
        sm.alpha_fall = unit_alpha(sm.alpha_fall, default_alpha_fall());
        sm.min_delta_pct = non_negative(sm.min_delta_pct, default_min_delta_pct());
        sm.max_rise_pct = non_negative(sm.max_rise_pct, default_max_rise_pct());
        sm.max_drop_pct = non_negative(sm.max_drop_pct, default_max_drop_pct());

        self.hysteresis.release_delta =
            non_negative(self.hysteresis.release_delta, default_release_delta());
        self.hysteresis.consecutive_required = self.hysteresis.consecutive_required.max(1);

        self.backfill.max_backfill_hours = self.backfill.max_backfill_hours.max(1);
        self.backfill.max_requested_hours = self.backfill.max_requested_hours.max(1);

        let syn = &mut self.synthetic;
        syn.min_component = syn.min_component.clamp(0.0, 1.0);
        syn.max_component = syn.max_component.clamp(syn.min_component, 1.0);
        self
    }

    pub fn stream(&self, name: &str) -> Option<&StreamConfig> {
        self.streams.iter().find(|stream| stream.name == name)
    }
}

fn non_negative(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        fallback
    }
}

fn unit_alpha(value: f64, fallback: f64) -> f64 {
    if value.is_finite() && value > 0.0 && value <= 1.0 {
        value
    } else {
        fallback
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    let raw = std::env::var(CONFIG_PATH_ENV).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

fn read_overrides(path: &Path) -> Result<ConfigOverrides> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn override_document_merges_sections_without_dropping_defaults() {
        let config = EvaluatorConfig::from_override_document(&json!({
            "component_weights": { "transactions": 0.6 },
            "smoothing": { "alpha_rise": 0.8 },
            "hysteresis": { "consecutive_required": 3 },
            "intervals": { "4H": 240 },
            "backfill": { "max_requested_hours": 720 },
        }))
        .unwrap();

        assert_eq!(config.stream("transactions").unwrap().weight, 0.6);
        assert_eq!(config.stream("social").unwrap().weight, 0.3);
        assert_eq!(config.smoothing.alpha_rise, 0.8);
        assert_eq!(config.smoothing.alpha_fall, default_alpha_fall());
        assert_eq!(config.hysteresis.consecutive_required, 3);
        assert_eq!(config.hysteresis.high_threshold, default_high_threshold());
        assert_eq!(config.intervals.get("4h"), Some(&240));
        assert_eq!(config.intervals.get("1h"), Some(&60));
        assert_eq!(config.backfill.max_requested_hours, 720);
        assert_eq!(config.backfill.max_backfill_hours, default_max_backfill_hours());
    }

    #[test]
    fn sanitizes_degenerate_values() {
        let config = EvaluatorConfig::from_override_document(&json!({
            "smoothing": { "alpha_rise": 0.0, "alpha_fall": 3.0, "max_rise_pct": -1.0 },
            "hysteresis": { "consecutive_required": 0 },
            "signals": { "rating_min": 5.0, "rating_max": 1.0 },
            "component_weights": { "social": -2.0 },
            "backfill": { "max_requested_hours": 0 },
        }))
        .unwrap();

        assert_eq!(config.smoothing.alpha_rise, default_alpha_rise());
        assert_eq!(config.smoothing.alpha_fall, default_alpha_fall());
        assert_eq!(config.smoothing.max_rise_pct, default_max_rise_pct());
        assert_eq!(config.hysteresis.consecutive_required, 1);
        assert_eq!(config.signals.rating_min, 1.0);
        assert_eq!(config.stream("social").unwrap().weight, 0.0);
        assert_eq!(config.backfill.max_requested_hours, 1);
    }

    #[test]
    fn rejects_malformed_override_document() {
        let err = EvaluatorConfig::from_override_document(&json!({ "smoothing": "fast" }));
        assert!(err.is_err());
    }

    #[test]
    fn load_from_path_falls_back_to_defaults_on_parse_failure() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "{{ not json")?;
        let config = EvaluatorConfig::load_from_path(file.path());
        assert_eq!(config, EvaluatorConfig::default());
        Ok(())
    }

    #[test]
    fn load_from_path_applies_overrides() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{ "dampening": {{ "exponent": 1.0 }} }}"#)?;
        let config = EvaluatorConfig::load_from_path(file.path());
        assert_eq!(config.dampening.exponent, 1.0);
        assert_eq!(config.dampening.incident_scale, default_incident_scale());
        Ok(())
    }
}
