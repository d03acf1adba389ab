use serde_json::Value as JsonValue;
use statrs::statistics::Statistics;

use crate::config::{LocatorConfig, SignalConfig, StreamKind};
use crate::services::locator::document_timestamp;
use crate::store::Document;

/// One way of reading a raw signal out of a stream's documents. `None` means "not matched";
/// the next extractor in the pipeline gets a turn.
pub trait SignalExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, docs: &[Document]) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Signal {
    pub value: f64,
    pub extractor: &'static str,
}

/// Ranked extractors for one stream kind.
pub struct SignalPipeline {
    extractors: Vec<Box<dyn SignalExtractor>>,
}

impl SignalPipeline {
    pub fn for_kind(kind: StreamKind, signals: &SignalConfig, locator: &LocatorConfig) -> Self {
        let extractors: Vec<Box<dyn SignalExtractor>> = match kind {
            StreamKind::Sentiment => vec![
                Box::new(NumericFieldMean {
                    label: "sentiment_field",
                    fields: signals.sentiment_fields.clone(),
                    bounds: (-1.0, 1.0),
                }),
                Box::new(LexicalSentiment {
                    text_fields: signals.text_fields.clone(),
                    positive: lowercase(&signals.positive_keywords),
                    negative: lowercase(&signals.negative_keywords),
                }),
            ],
            StreamKind::Rating => vec![Box::new(NumericFieldMean {
                label: "rating_field",
                fields: signals.rating_fields.clone(),
                bounds: (signals.rating_min, signals.rating_max),
            })],
            StreamKind::Flagged => vec![Box::new(StatusRatio {
                status_fields: signals.status_fields.clone(),
                vocabulary: lowercase(&signals.flagged_vocabulary),
            })],
            StreamKind::Price => vec![Box::new(ReturnVolatility {
                price_fields: signals.price_fields.clone(),
                locator: locator.clone(),
                min_points: signals.min_price_points,
            })],
        };
        Self { extractors }
    }

    pub fn run(&self, docs: &[Document]) -> Option<Signal> {
        if docs.is_empty() {
            return None;
        }
        self.extractors.iter().find_map(|extractor| {
            extractor
                .extract(docs)
                .filter(|value| value.is_finite())
                .map(|value| Signal {
                    value,
                    extractor: extractor.name(),
                })
        })
    }
}

fn lowercase(values: &[String]) -> Vec<String> {
    values.iter().map(|value| value.to_lowercase()).collect()
}

pub(crate) fn numeric(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(number) => number.as_f64(),
        JsonValue::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|value| value.is_finite())
}

fn first_numeric(doc: &Document, fields: &[String]) -> Option<f64> {
    fields
        .iter()
        .find_map(|field| doc.get(field.as_str()).and_then(numeric))
}

/// Mean of the first numeric field found per document, each value clamped to `bounds`.
struct NumericFieldMean {
    label: &'static str,
    fields: Vec<String>,
    bounds: (f64, f64),
}

impl SignalExtractor for NumericFieldMean {
    fn name(&self) -> &'static str {
        self.label
    }

    fn extract(&self, docs: &[Document]) -> Option<f64> {
        let (low, high) = self.bounds;
        let values: Vec<f64> = docs
            .iter()
            .filter_map(|doc| first_numeric(doc, &self.fields))
            .map(|value| value.clamp(low, high))
            .collect();
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Signed keyword balance over free-text fields, in [-1,1]. Text without any keyword is neutral.
struct LexicalSentiment {
    text_fields: Vec<String>,
    positive: Vec<String>,
    negative: Vec<String>,
}

impl SignalExtractor for LexicalSentiment {
    fn name(&self) -> &'static str {
        "lexical"
    }

    fn extract(&self, docs: &[Document]) -> Option<f64> {
        let mut saw_text = false;
        let mut positive = 0u64;
        let mut negative = 0u64;
        for doc in docs {
            for field in &self.text_fields {
                let Some(text) = doc.get(field.as_str()).and_then(JsonValue::as_str) else {
                    continue;
                };
                saw_text = true;
                let lowered = text.to_lowercase();
                for token in lowered.split(|ch: char| !ch.is_alphanumeric()) {
                    if token.is_empty() {
                        continue;
                    }
                    if self.positive.iter().any(|word| word == token) {
                        positive += 1;
                    } else if self.negative.iter().any(|word| word == token) {
                        negative += 1;
                    }
                }
            }
        }
        if !saw_text {
            return None;
        }
        let total = positive + negative;
        if total == 0 {
            return Some(0.0);
        }
        Some((positive as f64 - negative as f64) / total as f64)
    }
}

/// Share of documents with a status field whose status hits the flagged vocabulary.
struct StatusRatio {
    status_fields: Vec<String>,
    vocabulary: Vec<String>,
}

const NEGATIONS: [&str; 4] = ["not", "no", "non", "never"];

impl StatusRatio {
    /// Whole-token match against the vocabulary; a token preceded by a negation does not count.
    fn is_flagged(&self, status: &str) -> bool {
        let lowered = status.to_lowercase();
        let mut previous = "";
        for token in lowered.split(|ch: char| !ch.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            if !NEGATIONS.contains(&previous) && self.vocabulary.iter().any(|word| word == token) {
                return true;
            }
            previous = token;
        }
        false
    }
}

impl SignalExtractor for StatusRatio {
    fn name(&self) -> &'static str {
        "status_ratio"
    }

    fn extract(&self, docs: &[Document]) -> Option<f64> {
        let mut with_status = 0u64;
        let mut flagged = 0u64;
        for doc in docs {
            let Some(status) = self
                .status_fields
                .iter()
                .find_map(|field| doc.get(field.as_str()).and_then(JsonValue::as_str))
            else {
                continue;
            };
            with_status += 1;
            if self.is_flagged(status) {
                flagged += 1;
            }
        }
        if with_status == 0 {
            return None;
        }
        Some(flagged as f64 / with_status as f64)
    }
}

/// Population standard deviation of period-over-period returns, ordered by timestamp.
struct ReturnVolatility {
    price_fields: Vec<String>,
    locator: LocatorConfig,
    min_points: usize,
}

impl SignalExtractor for ReturnVolatility {
    fn name(&self) -> &'static str {
        "return_volatility"
    }

    fn extract(&self, docs: &[Document]) -> Option<f64> {
        let mut points: Vec<(f64, f64)> = docs
            .iter()
            .filter_map(|doc| {
                let ts = document_timestamp(doc, &self.locator)?;
                let price = first_numeric(doc, &self.price_fields)?;
                (price > 0.0).then_some((ts, price))
            })
            .collect();
        if points.len() < self.min_points {
            return None;
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let returns: Vec<f64> = points
            .windows(2)
            .map(|pair| pair[1].1 / pair[0].1 - 1.0)
            .collect();
        if returns.len() < 2 {
            return None;
        }
        Some(returns.iter().population_std_dev())
    }
}
