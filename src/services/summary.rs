use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::services::locator::StrategyAttempt;
use crate::types::{Evaluation, RiskLevel, Window};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub window_start_ts: i64,
    pub window_end_ts: i64,
    pub score: Option<f64>,
    pub confidence: f64,
    pub synthetic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoothed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_state: Option<RiskLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreSummary {
    pub entity: String,
    pub interval_minutes: u32,
    pub latest: Option<Window>,
    pub previous: Option<Window>,
    /// `latest.score - previous.score` when both are scored.
    pub delta: Option<f64>,
    /// Oldest first.
    pub trend: Vec<TrendPoint>,
    pub component_averages: BTreeMap<String, Option<f64>>,
    pub avg_score: Option<f64>,
    pub avg_confidence: Option<f64>,
    pub window_count: usize,
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Builds a summary from windows (any order) and their evaluations, where available.
pub fn summarize(
    entity: &str,
    interval_minutes: u32,
    windows: &[Window],
    evaluations: &[Evaluation],
) -> ScoreSummary {
    let mut ordered: Vec<&Window> = windows.iter().collect();
    ordered.sort_by_key(|window| window.window_start_ts);

    let by_start: HashMap<i64, &Evaluation> = evaluations
        .iter()
        .map(|evaluation| (evaluation.window_start_ts, evaluation))
        .collect();

    let trend = ordered
        .iter()
        .map(|window| {
            let evaluation = by_start.get(&window.window_start_ts);
            TrendPoint {
                window_start_ts: window.window_start_ts,
                window_end_ts: window.window_end_ts,
                score: window.score,
                confidence: window.confidence,
                synthetic: window.synthetic,
                smoothed: evaluation.map(|e| e.scores_smoothed.total),
                risk_state: evaluation.map(|e| e.state.risk_state),
            }
        })
        .collect();

    let mut names: Vec<&String> = ordered
        .iter()
        .flat_map(|window| window.components.keys())
        .collect();
    names.sort();
    names.dedup();
    let component_averages = names
        .into_iter()
        .map(|name| {
            let average = mean(
                ordered
                    .iter()
                    .filter_map(|window| window.components.get(name).copied().flatten()),
            );
            (name.clone(), average)
        })
        .collect();

    let latest = ordered.last().map(|window| (*window).clone());
    let previous = ordered
        .len()
        .checked_sub(2)
        .and_then(|index| ordered.get(index))
        .map(|window| (*window).clone());
    let delta = match (
        latest.as_ref().and_then(|w| w.score),
        previous.as_ref().and_then(|w| w.score),
    ) {
        (Some(latest), Some(previous)) => Some(latest - previous),
        _ => None,
    };

    ScoreSummary {
        entity: entity.to_string(),
        interval_minutes,
        latest,
        previous,
        delta,
        trend,
        component_averages,
        avg_score: mean(ordered.iter().filter_map(|window| window.score)),
        avg_confidence: mean(ordered.iter().map(|window| window.confidence)),
        window_count: ordered.len(),
    }
}

/// Per-stream retrieval outcome for one inspected window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeStream {
    pub stream: String,
    pub collection: String,
    pub strategy: Option<String>,
    pub documents: usize,
    pub extractor: Option<String>,
    pub component: Option<f64>,
    pub attempts: Vec<StrategyAttempt>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeWindow {
    pub window_start_ts: i64,
    pub window_end_ts: i64,
    pub persisted: bool,
    pub streams: Vec<ProbeStream>,
}

/// Read-only diagnostic of how each stream would be retrieved across a range.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub entity: String,
    pub interval_minutes: u32,
    pub since_ts: i64,
    pub until_ts: i64,
    /// Complete windows in the range before `max_windows` was applied.
    pub windows_in_range: usize,
    pub truncated: bool,
    pub windows: Vec<ProbeWindow>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EvaluationScores, RiskState, SmoothedScores};

    fn window(start: i64, score: Option<f64>, social: Option<f64>, confidence: f64) -> Window {
        Window {
            entity: "acme".to_string(),
            interval_minutes: 60,
            window_start_ts: start,
            window_end_ts: start + 3_600,
            components: BTreeMap::from([
                ("social".to_string(), social),
                ("prices".to_string(), None),
            ]),
            raw_counts: BTreeMap::new(),
            score,
            confidence,
            synthetic: false,
            retrieval: BTreeMap::new(),
        }
    }

    fn evaluation(start: i64, smoothed: f64) -> Evaluation {
        Evaluation {
            entity: "acme".to_string(),
            interval_minutes: 60,
            window_start_ts: start,
            window_end_ts: start + 3_600,
            scores: EvaluationScores {
                total: smoothed,
                total_raw: smoothed,
                wl: None,
                market: None,
                sentiment: None,
                volume: None,
                incident_bump: 0.0,
            },
            scores_smoothed: SmoothedScores { total: smoothed },
            state: RiskState::default(),
            drivers: Vec::new(),
            synthetic: false,
        }
    }

    #[test]
    fn summary_orders_trend_and_computes_delta() {
        let windows = vec![
            window(7_200, Some(60.0), Some(0.6), 1.0),
            window(0, Some(20.0), Some(0.2), 0.5),
            window(3_600, Some(40.0), None, 0.0),
        ];
        let summary = summarize("acme", 60, &windows, &[evaluation(3_600, 35.0)]);

        let starts: Vec<i64> = summary.trend.iter().map(|p| p.window_start_ts).collect();
        assert_eq!(starts, vec![0, 3_600, 7_200]);
        assert_eq!(summary.trend[1].smoothed, Some(35.0));
        assert_eq!(summary.trend[0].smoothed, None);
        assert_eq!(summary.latest.as_ref().map(|w| w.window_start_ts), Some(7_200));
        assert_eq!(summary.previous.as_ref().map(|w| w.window_start_ts), Some(3_600));
        assert_eq!(summary.delta, Some(20.0));
        assert_eq!(summary.avg_score, Some(40.0));
        assert_eq!(summary.avg_confidence, Some(0.5));
        let social = summary.component_averages["social"].unwrap();
        assert!((social - 0.4).abs() < 1e-12);
        assert_eq!(summary.component_averages["prices"], None);
        assert_eq!(summary.window_count, 3);
    }

    #[test]
    fn empty_summary_has_no_latest_or_averages() {
        let summary = summarize("acme", 60, &[], &[]);
        assert!(summary.latest.is_none());
        assert!(summary.previous.is_none());
        assert_eq!(summary.delta, None);
        assert_eq!(summary.avg_score, None);
        assert!(summary.trend.is_empty());
    }
}
