use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// Natural key shared by a window and its evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub entity: String,
    pub interval_minutes: u32,
    pub window_start_ts: i64,
}

impl WindowKey {
    pub fn new(entity: &str, interval_minutes: u32, window_start_ts: i64) -> Self {
        Self {
            entity: entity.to_string(),
            interval_minutes,
            window_start_ts,
        }
    }

    pub fn window_end_ts(&self) -> i64 {
        self.window_start_ts + crate::time::interval_seconds(self.interval_minutes)
    }

    pub fn as_document_key(&self) -> Map<String, JsonValue> {
        let mut key = Map::new();
        key.insert("entity".to_string(), JsonValue::from(self.entity.clone()));
        key.insert(
            "interval_minutes".to_string(),
            JsonValue::from(self.interval_minutes),
        );
        key.insert(
            "window_start_ts".to_string(),
            JsonValue::from(self.window_start_ts),
        );
        key
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub entity: String,
    pub interval_minutes: u32,
    pub window_start_ts: i64,
    pub window_end_ts: i64,
    /// Stream name -> normalized risk in [0,1], or null when no signal was derivable.
    pub components: BTreeMap<String, Option<f64>>,
    pub raw_counts: BTreeMap<String, u64>,
    /// Weighted blend scaled to [0,100].
    pub score: Option<f64>,
    pub confidence: f64,
    pub synthetic: bool,
    /// Stream name -> locator strategy that produced its documents.
    #[serde(default)]
    pub retrieval: BTreeMap<String, Option<String>>,
}

impl Window {
    pub fn key(&self) -> WindowKey {
        WindowKey::new(&self.entity, self.interval_minutes, self.window_start_ts)
    }

    pub fn total_documents(&self) -> u64 {
        self.raw_counts.values().sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Normal,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Normal => "normal",
            RiskLevel::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RiskState {
    pub risk_state: RiskLevel,
    pub consecutive_high: u32,
}

/// Percent-scale scores; sub-scores are null when their macro component had no input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationScores {
    /// Exported total (smoothed).
    pub total: f64,
    /// Dampened blend plus incident bump, before smoothing.
    pub total_raw: f64,
    pub wl: Option<f64>,
    pub market: Option<f64>,
    pub sentiment: Option<f64>,
    pub volume: Option<f64>,
    pub incident_bump: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothedScores {
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub entity: String,
    pub interval_minutes: u32,
    pub window_start_ts: i64,
    pub window_end_ts: i64,
    pub scores: EvaluationScores,
    pub scores_smoothed: SmoothedScores,
    pub state: RiskState,
    pub drivers: Vec<String>,
    #[serde(default)]
    pub synthetic: bool,
}

impl Evaluation {
    pub fn key(&self) -> WindowKey {
        WindowKey::new(&self.entity, self.interval_minutes, self.window_start_ts)
    }
}
