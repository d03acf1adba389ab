pub mod config;
pub mod error;
pub mod evaluator;
pub mod services;
pub mod store;
pub mod telemetry;
pub mod time;
pub mod types;

#[cfg(test)]
mod test_support;

pub use config::EvaluatorConfig;
pub use error::{EvaluatorError, EvaluatorResult};
pub use evaluator::WindowRiskEvaluator;
pub use services::backfill::{Job, JobState, Submitter, TokioWorkerPool};
pub use store::{DocumentStore, MemoryStore};
pub use types::{Evaluation, RiskLevel, RiskState, Window, WindowKey};
