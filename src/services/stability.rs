use std::sync::Arc;

use crate::config::{EvaluatorConfig, MacroGroup};
use crate::types::{
    Evaluation, EvaluationScores, RiskLevel, RiskState, SmoothedScores, Window,
};

/// Macro components on the 0..1 scale; `None` when nothing fed the group.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MacroComponents {
    pub wl: Option<f64>,
    pub market: Option<f64>,
    pub sentiment: Option<f64>,
    pub volume: Option<f64>,
}

impl MacroComponents {
    fn weighted(&self, config: &EvaluatorConfig) -> [(&'static str, Option<f64>, f64); 4] {
        let m = &config.macro_blend;
        [
            ("wl", self.wl, m.wl),
            ("market", self.market, m.market),
            ("sentiment", self.sentiment, m.sentiment),
            ("volume", self.volume, m.volume),
        ]
    }
}

/// Turns a window into its UI-facing evaluation: secondary blend, incident bump, dampening,
/// asymmetric EMA with rate caps, and the hysteresis state machine.
pub struct StabilityLayer {
    config: Arc<EvaluatorConfig>,
}

impl StabilityLayer {
    pub fn new(config: Arc<EvaluatorConfig>) -> Self {
        Self { config }
    }

    pub fn macro_components(&self, window: &Window) -> MacroComponents {
        let group_mean = |group: MacroGroup| -> Option<f64> {
            let values: Vec<f64> = self
                .config
                .streams
                .iter()
                .filter(|stream| stream.macro_group == group)
                .filter_map(|stream| window.components.get(&stream.name).copied().flatten())
                .collect();
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        };
        let volume = if window.synthetic {
            None
        } else {
            let ceiling = self.config.macro_blend.volume_ceiling;
            Some((window.total_documents() as f64 / ceiling).clamp(0.0, 1.0))
        };
        MacroComponents {
            wl: group_mean(MacroGroup::Wl),
            market: group_mean(MacroGroup::Market),
            sentiment: group_mean(MacroGroup::Sentiment),
            volume,
        }
    }

    /// Weighted mean over available macro components (0 when none are available).
    pub fn macro_blend(&self, components: &MacroComponents) -> f64 {
        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for (_, value, weight) in components.weighted(&self.config) {
            if let Some(value) = value {
                weighted += value * weight;
                weight_sum += weight;
            }
        }
        if weight_sum > 0.0 {
            (weighted / weight_sum).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn incident_bump(&self, components: &MacroComponents) -> f64 {
        let incident = &self.config.incident;
        let flagged = components
            .wl
            .filter(|value| *value > incident.flagged_threshold)
            .map(|value| {
                ((value - incident.flagged_threshold) * incident.flagged_scale)
                    .min(incident.flagged_cap)
            })
            .unwrap_or(0.0);
        let volatility = components
            .market
            .filter(|value| *value > incident.volatility_threshold)
            .map(|value| {
                ((value - incident.volatility_threshold) * incident.volatility_scale)
                    .min(incident.volatility_cap)
            })
            .unwrap_or(0.0);
        (flagged + volatility).clamp(0.0, incident.total_cap)
    }

    /// `min(1, blend^p + bump × scale)`.
    pub fn raw_total(&self, blend: f64, bump: f64) -> f64 {
        let dampening = &self.config.dampening;
        let compressed = blend.clamp(0.0, 1.0).powf(dampening.exponent);
        (compressed + bump * dampening.incident_scale).clamp(0.0, 1.0)
    }

    /// Smoothed total in percentage points, chained from the previous smoothed value.
    pub fn smooth(&self, raw_pct: f64, previous_smoothed: Option<f64>) -> f64 {
        let Some(previous) = previous_smoothed else {
            return raw_pct.clamp(0.0, 100.0);
        };
        let s = &self.config.smoothing;
        let alpha = if raw_pct > previous {
            s.alpha_rise
        } else {
            s.alpha_fall
        };
        let ema = previous + alpha * (raw_pct - previous);
        let mut delta = ema - previous;
        if delta.abs() < s.min_delta_pct {
            delta = 0.0;
        }
        let delta = delta.clamp(-s.max_drop_pct, s.max_rise_pct);
        (previous + delta).clamp(0.0, 100.0)
    }

    pub fn next_state(&self, smoothed: f64, previous: RiskState) -> RiskState {
        let h = &self.config.hysteresis;
        let mut state = previous;
        if smoothed >= h.high_threshold {
            state.consecutive_high = state.consecutive_high.saturating_add(1);
            if state.consecutive_high >= h.consecutive_required {
                state.risk_state = RiskLevel::High;
            }
        } else if smoothed < h.high_threshold - h.release_delta {
            state.consecutive_high = 0;
            state.risk_state = RiskLevel::Normal;
        } else if state.risk_state == RiskLevel::Normal {
            // Release band: a normal series must re-qualify from scratch.
            state.consecutive_high = 0;
        }
        state
    }

    pub fn drivers(&self, components: &MacroComponents) -> Vec<String> {
        let mut contributions: Vec<(&'static str, f64)> = components
            .weighted(&self.config)
            .into_iter()
            .filter_map(|(name, value, weight)| value.map(|value| (name, value * weight)))
            .filter(|(_, contribution)| *contribution > 0.0)
            .collect();
        contributions.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        contributions
            .into_iter()
            .take(self.config.macro_blend.max_drivers)
            .map(|(name, _)| name.to_string())
            .collect()
    }

    pub fn evaluate(&self, window: &Window, previous: Option<&Evaluation>) -> Evaluation {
        let components = self.macro_components(window);
        let blend = self.macro_blend(&components);
        let bump = self.incident_bump(&components);
        let raw_pct = self.raw_total(blend, bump) * 100.0;
        let smoothed = self.smooth(raw_pct, previous.map(|p| p.scores_smoothed.total));
        let state = self.next_state(smoothed, previous.map(|p| p.state).unwrap_or_default());

        let pct = |value: Option<f64>| value.map(|v| (v * 100.0).clamp(0.0, 100.0));
        Evaluation {
            entity: window.entity.clone(),
            interval_minutes: window.interval_minutes,
            window_start_ts: window.window_start_ts,
            window_end_ts: window.window_end_ts,
            scores: EvaluationScores {
                total: smoothed,
                total_raw: raw_pct,
                wl: pct(components.wl),
                market: pct(components.market),
                sentiment: pct(components.sentiment),
                volume: pct(components.volume),
                incident_bump: (bump * 100.0).clamp(0.0, 100.0),
            },
            scores_smoothed: SmoothedScores { total: smoothed },
            state,
            drivers: self.drivers(&components),
            synthetic: window.synthetic,
        }
    }
}
