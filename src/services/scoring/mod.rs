mod extract;
mod synthetic;

pub use extract::{Signal, SignalExtractor, SignalPipeline};
pub use synthetic::{synthesize_components, window_seed};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{EvaluatorConfig, SignalConfig, StreamKind};
use crate::services::locator::{LocateResult, SignalLocator};
use crate::types::Window;

/// Builds one `Window` per key from the configured streams.
pub struct WindowScorer {
    config: Arc<EvaluatorConfig>,
    locator: Arc<SignalLocator>,
    pipelines: HashMap<String, SignalPipeline>,
}

/// Per-stream outcome kept alongside a scored window for diagnostics.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub located: LocateResult,
    pub signal: Option<Signal>,
    pub component: Option<f64>,
}

impl WindowScorer {
    pub fn new(config: Arc<EvaluatorConfig>, locator: Arc<SignalLocator>) -> Self {
        let pipelines = config
            .streams
            .iter()
            .map(|stream| {
                (
                    stream.name.clone(),
                    SignalPipeline::for_kind(stream.kind, &config.signals, &config.locator),
                )
            })
            .collect();
        Self {
            config,
            locator,
            pipelines,
        }
    }

    /// Locates and extracts every stream for one window. Never fails; unusable streams yield
    /// `None`.
    pub fn collect_streams(
        &self,
        entity: &str,
        window_start_ts: i64,
        window_end_ts: i64,
    ) -> BTreeMap<String, StreamOutcome> {
        let mut outcomes = BTreeMap::new();
        for stream in &self.config.streams {
            let located = self
                .locator
                .locate(stream, entity, window_start_ts, window_end_ts);
            let signal = self
                .pipelines
                .get(&stream.name)
                .and_then(|pipeline| pipeline.run(&located.documents));
            let component =
                signal.map(|signal| normalize(stream.kind, signal.value, &self.config.signals));
            outcomes.insert(
                stream.name.clone(),
                StreamOutcome {
                    located,
                    signal,
                    component,
                },
            );
        }
        outcomes
    }

    pub fn score_window(
        &self,
        entity: &str,
        interval_minutes: u32,
        window_start_ts: i64,
    ) -> Window {
        let window_end_ts = window_start_ts + crate::time::interval_seconds(interval_minutes);
        let outcomes = self.collect_streams(entity, window_start_ts, window_end_ts);

        let mut components: BTreeMap<String, Option<f64>> = BTreeMap::new();
        let mut raw_counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut retrieval: BTreeMap<String, Option<String>> = BTreeMap::new();
        for (name, outcome) in &outcomes {
            components.insert(name.clone(), outcome.component);
            raw_counts.insert(name.clone(), outcome.located.documents.len() as u64);
            retrieval.insert(
                name.clone(),
                outcome.located.strategy.map(|s| s.as_str().to_string()),
            );
        }

        let mut synthetic = false;
        if components.values().all(Option::is_none) && !self.config.streams.is_empty() {
            synthetic = true;
            let seed = window_seed(entity, interval_minutes, window_start_ts);
            let names = self.config.streams.iter().map(|stream| stream.name.as_str());
            for (name, value) in synthesize_components(seed, names, &self.config.synthetic) {
                components.insert(name, Some(value));
            }
            tracing::debug!(
                entity,
                interval_minutes,
                window_start_ts,
                "no real components; using synthetic fallback"
            );
        }

        // Over the final component set, synthetic fill included.
        let confidence = self.confidence(&components, &raw_counts);
        let score = self.blend(&components);
        Window {
            entity: entity.to_string(),
            interval_minutes,
            window_start_ts,
            window_end_ts,
            components,
            raw_counts,
            score,
            confidence,
            synthetic,
            retrieval,
        }
    }

    /// `100 × Σ(component·weight) / Σ weight` over available components only.
    fn blend(&self, components: &BTreeMap<String, Option<f64>>) -> Option<f64> {
        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        let mut plain = Vec::new();
        for stream in &self.config.streams {
            let Some(Some(value)) = components.get(&stream.name) else {
                continue;
            };
            weighted += value * stream.weight;
            weight_sum += stream.weight;
            plain.push(*value);
        }
        if plain.is_empty() {
            return None;
        }
        let blended = if weight_sum > 0.0 {
            weighted / weight_sum
        } else {
            plain.iter().sum::<f64>() / plain.len() as f64
        };
        Some((blended * 100.0).clamp(0.0, 100.0))
    }

    fn confidence(
        &self,
        components: &BTreeMap<String, Option<f64>>,
        raw_counts: &BTreeMap<String, u64>,
    ) -> f64 {
        let total: u64 = raw_counts.values().sum();
        if total > 0 {
            let supported: u64 = raw_counts
                .iter()
                .filter(|(name, _)| matches!(components.get(*name), Some(Some(_))))
                .map(|(_, count)| *count)
                .sum();
            return (supported as f64 / total as f64).clamp(0.0, 1.0);
        }
        let configured = self.config.streams.len();
        if configured == 0 {
            return 0.0;
        }
        let available = components.values().filter(|value| value.is_some()).count();
        (available as f64 / configured as f64).clamp(0.0, 1.0)
    }
}

/// Maps a raw signal into [0,1] risk space.
pub fn normalize(kind: StreamKind, value: f64, signals: &SignalConfig) -> f64 {
    let risk = match kind {
        StreamKind::Sentiment => (1.0 - value.clamp(-1.0, 1.0)) / 2.0,
        StreamKind::Rating => {
            let span = signals.rating_max - signals.rating_min;
            if span > 0.0 {
                (signals.rating_max - value) / span
            } else {
                0.5
            }
        }
        StreamKind::Flagged => value,
        StreamKind::Price => value / signals.volatility_ceiling,
    };
    risk.clamp(0.0, 1.0)
}
