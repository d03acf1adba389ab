use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::EvaluatorConfig;
use crate::error::EvaluatorResult;
use crate::services::backfill::{
    self, resolve_backfill_horizon, BackfillTask, Job, JobError, JobManager, JobState, Submitter,
};
use crate::services::locator::SignalLocator;
use crate::services::records::{self, StartRange};
use crate::services::scoring::WindowScorer;
use crate::services::stability::StabilityLayer;
use crate::services::summary::{self, ProbeReport, ProbeStream, ProbeWindow, ScoreSummary};
use crate::store::{DocumentStore, SortOrder};
use crate::time::{
    align_down, interval_label_for, interval_seconds, now_ts, resolve_interval,
    validate_interval_minutes, window_starts,
};
use crate::types::{Evaluation, Window, WindowKey};

/// Entry point: scores windows, derives evaluations, runs backfills and answers range queries
/// for any number of entities over one document store.
pub struct WindowRiskEvaluator {
    config: Arc<EvaluatorConfig>,
    store: Arc<dyn DocumentStore>,
    scorer: WindowScorer,
    stability: StabilityLayer,
    jobs: JobManager,
}

impl WindowRiskEvaluator {
    pub fn new(store: Arc<dyn DocumentStore>, config: EvaluatorConfig) -> Self {
        let config = Arc::new(config.sanitized());
        let locator = Arc::new(SignalLocator::new(store.clone(), config.locator.clone()));
        let jobs = JobManager::new(
            config.backfill.max_job_errors,
            config.backfill.job_retention_minutes,
        );
        Self {
            scorer: WindowScorer::new(config.clone(), locator),
            stability: StabilityLayer::new(config.clone()),
            jobs,
            store,
            config,
        }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn resolve_interval(&self, interval_label: &str) -> EvaluatorResult<u32> {
        validate_interval_minutes(resolve_interval(&self.config.intervals, interval_label)?)
    }

    pub fn compute_window(
        &self,
        entity: &str,
        interval_minutes: u32,
        window_start_ts: i64,
    ) -> EvaluatorResult<Window> {
        self.compute_window_with_evaluation(entity, interval_minutes, window_start_ts)
            .map(|(window, _)| window)
    }

    /// Scores one window, chains its evaluation from the latest earlier evaluation and upserts
    /// both. `window_start_ts` is aligned down to the interval first.
    pub fn compute_window_with_evaluation(
        &self,
        entity: &str,
        interval_minutes: u32,
        window_start_ts: i64,
    ) -> EvaluatorResult<(Window, Evaluation)> {
        let interval_minutes = validate_interval_minutes(interval_minutes)?;
        let key = WindowKey::new(
            entity,
            interval_minutes,
            align_down(window_start_ts, interval_minutes),
        );
        let window = self
            .scorer
            .score_window(entity, interval_minutes, key.window_start_ts);
        let previous = records::previous_evaluation(self.store.as_ref(), &self.config, &key)?;
        let evaluation = self.stability.evaluate(&window, previous.as_ref());

        records::upsert_window(self.store.as_ref(), &self.config, &window)?;
        records::upsert_evaluation(self.store.as_ref(), &self.config, &evaluation)?;

        tracing::debug!(
            entity,
            interval_minutes,
            window_start_ts = key.window_start_ts,
            score = ?window.score,
            smoothed = evaluation.scores_smoothed.total,
            synthetic = window.synthetic,
            "window computed"
        );
        Ok((window, evaluation))
    }

    /// Computes any missing complete windows in `[since_ts, until_ts]` and returns every window
    /// in the range, oldest first.
    pub fn ensure_windows(
        &self,
        entity: &str,
        interval_label: &str,
        since_ts: i64,
        until_ts: i64,
    ) -> EvaluatorResult<Vec<Window>> {
        let interval_minutes = self.resolve_interval(interval_label)?;
        let missing = self.plan_missing_windows(entity, interval_minutes, since_ts, until_ts)?;
        if !missing.is_empty() {
            tracing::info!(
                entity,
                interval_minutes,
                missing = missing.len(),
                "computing missing windows"
            );
        }
        for start in missing {
            self.compute_window(entity, interval_minutes, start)?;
        }

        let starts = window_starts(since_ts, until_ts, interval_minutes);
        let (Some(first), Some(last)) = (starts.first(), starts.last()) else {
            return Ok(Vec::new());
        };
        let windows = records::windows_in_range(
            self.store.as_ref(),
            &self.config,
            entity,
            interval_minutes,
            StartRange {
                since_ts: Some(*first),
                until_ts: Some(*last),
            },
            SortOrder::Asc,
            None,
        )?;
        Ok(windows)
    }

    /// Persisted windows, newest first. A `limit` of 0 returns every match.
    pub fn fetch_scores(
        &self,
        entity: &str,
        interval_label: &str,
        limit: usize,
        since_ts: Option<i64>,
        until_ts: Option<i64>,
    ) -> EvaluatorResult<Vec<Window>> {
        let interval_minutes = self.resolve_interval(interval_label)?;
        let windows = records::windows_in_range(
            self.store.as_ref(),
            &self.config,
            entity,
            interval_minutes,
            StartRange { since_ts, until_ts },
            SortOrder::Desc,
            (limit > 0).then_some(limit),
        )?;
        Ok(windows)
    }

    /// Persisted evaluations, newest first. A `limit` of 0 returns every match.
    pub fn fetch_evaluations(
        &self,
        entity: &str,
        interval_label: &str,
        limit: usize,
        since_ts: Option<i64>,
        until_ts: Option<i64>,
    ) -> EvaluatorResult<Vec<Evaluation>> {
        let interval_minutes = self.resolve_interval(interval_label)?;
        let evaluations = records::evaluations_in_range(
            self.store.as_ref(),
            &self.config,
            entity,
            interval_minutes,
            StartRange { since_ts, until_ts },
            SortOrder::Desc,
            (limit > 0).then_some(limit),
        )?;
        Ok(evaluations)
    }

    /// Summary over the newest `lookback` windows in the optional range.
    pub fn summarize_scores(
        &self,
        entity: &str,
        interval_label: &str,
        lookback: usize,
        since_ts: Option<i64>,
        until_ts: Option<i64>,
    ) -> EvaluatorResult<ScoreSummary> {
        let interval_minutes = self.resolve_interval(interval_label)?;
        let windows =
            self.fetch_scores(entity, interval_label, lookback.max(1), since_ts, until_ts)?;
        let evaluations = match (
            windows.iter().map(|w| w.window_start_ts).min(),
            windows.iter().map(|w| w.window_start_ts).max(),
        ) {
            (Some(oldest), Some(newest)) => records::evaluations_in_range(
                self.store.as_ref(),
                &self.config,
                entity,
                interval_minutes,
                StartRange {
                    since_ts: Some(oldest),
                    until_ts: Some(newest),
                },
                SortOrder::Asc,
                None,
            )?,
            _ => Vec::new(),
        };
        Ok(summary::summarize(
            entity,
            interval_minutes,
            &windows,
            &evaluations,
        ))
    }

    /// Starts of complete windows in `[since_ts, until_ts]` with no persisted record, oldest first.
    pub fn plan_missing_windows(
        &self,
        entity: &str,
        interval_minutes: u32,
        since_ts: i64,
        until_ts: i64,
    ) -> EvaluatorResult<Vec<i64>> {
        let interval_minutes = validate_interval_minutes(interval_minutes)?;
        let candidates = window_starts(since_ts, until_ts, interval_minutes);
        let (Some(first), Some(last)) = (candidates.first(), candidates.last()) else {
            return Ok(Vec::new());
        };
        let persisted = records::persisted_starts(
            self.store.as_ref(),
            &self.config,
            entity,
            interval_minutes,
            StartRange {
                since_ts: Some(*first),
                until_ts: Some(*last),
            },
        )?;
        Ok(backfill::missing_starts(&candidates, &persisted))
    }

    /// Returns the active backfill job for the series, or plans and starts a new one.
    ///
    /// The range runs from the latest persisted window's end (or the backfill horizon when the
    /// series is empty) up to the current aligned boundary. Without `submit` the job runs on the
    /// calling thread and is returned finished.
    pub fn trigger_or_status(
        self: &Arc<Self>,
        entity: &str,
        interval_label: &str,
        submit: Option<&dyn Submitter>,
        max_backfill_hours: Option<i64>,
    ) -> EvaluatorResult<Job> {
        let interval_minutes = self.resolve_interval(interval_label)?;
        if let Some(active) = self.jobs.active_for(entity, interval_minutes) {
            return Ok(active);
        }

        let horizon =
            resolve_backfill_horizon(&self.config.backfill, interval_label, max_backfill_hours);
        let until_ts = align_down(now_ts(), interval_minutes);
        let latest =
            records::latest_window(self.store.as_ref(), &self.config, entity, interval_minutes)?;
        let since_ts = latest
            .map(|window| window.window_end_ts)
            .unwrap_or_else(|| until_ts - i64::from(horizon.hours) * 3_600)
            .min(until_ts);
        let planned = self.plan_missing_windows(entity, interval_minutes, since_ts, until_ts)?;

        let now = Utc::now();
        let empty = planned.is_empty();
        let job = Job {
            job_id: Uuid::new_v4(),
            entity: entity.to_string(),
            interval_minutes,
            interval_label: interval_label_for(&self.config.intervals, interval_minutes)
                .unwrap_or_else(|| interval_label.to_string()),
            status: if empty { JobState::Done } else { JobState::Queued },
            planned: planned.len() as u64,
            processed: 0,
            throughput: None,
            eta_seconds: empty.then_some(0.0),
            errors: Vec::new(),
            range_start_ts: since_ts,
            range_end_ts: until_ts,
            horizon_fallback: horizon.fallback_used,
            submitted_at: now,
            started_at: None,
            finished_at: empty.then_some(now),
        };
        let (job, inserted) = self.jobs.register_or_existing(job);
        if !inserted || empty {
            return Ok(job);
        }

        tracing::info!(
            job_id = %job.job_id,
            entity,
            interval_minutes,
            planned = job.planned,
            range_start_ts = since_ts,
            range_end_ts = until_ts,
            "backfill job queued"
        );

        let job_id = job.job_id;
        let Some(submit) = submit else {
            let finished = self.run_backfill(job_id, entity, interval_minutes, &planned);
            return Ok(finished.unwrap_or(job));
        };

        let evaluator = Arc::clone(self);
        let owned_entity = entity.to_string();
        let task: BackfillTask = Box::new(move || {
            evaluator.run_backfill(job_id, &owned_entity, interval_minutes, &planned);
        });
        match submit.submit(task) {
            Ok(()) => Ok(self.jobs.get(job_id).unwrap_or(job)),
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "backfill submission failed");
                let failed = self.jobs.fail(
                    job_id,
                    JobError {
                        window_start_ts: None,
                        code: "submit_failed".to_string(),
                        message: format!("{err:#}"),
                    },
                    Utc::now(),
                );
                Ok(failed.unwrap_or(job))
            }
        }
    }

    fn run_backfill(
        &self,
        job_id: Uuid,
        entity: &str,
        interval_minutes: u32,
        starts: &[i64],
    ) -> Option<Job> {
        let span = tracing::info_span!(
            "window_backfill",
            job_id = %job_id,
            entity,
            interval_minutes,
        );
        let _entered = span.enter();
        backfill::run_job(&self.jobs, job_id, starts, |start| {
            self.compute_window_with_evaluation(entity, interval_minutes, start)
                .map(|_| ())
        })
    }

    pub fn job_status(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.get(job_id)
    }

    /// Shows, per window and stream, which retrieval strategy matched and what signal came out.
    /// Nothing is written. At most `max_windows` of the most recent windows are inspected.
    pub fn probe_range(
        &self,
        entity: &str,
        interval_minutes: u32,
        since_ts: i64,
        until_ts: i64,
        max_windows: usize,
    ) -> EvaluatorResult<ProbeReport> {
        let interval_minutes = validate_interval_minutes(interval_minutes)?;
        let starts = window_starts(since_ts, until_ts, interval_minutes);
        let persisted = match (starts.first(), starts.last()) {
            (Some(first), Some(last)) => records::persisted_starts(
                self.store.as_ref(),
                &self.config,
                entity,
                interval_minutes,
                StartRange {
                    since_ts: Some(*first),
                    until_ts: Some(*last),
                },
            )?,
            _ => Default::default(),
        };

        let max_windows = max_windows.max(1);
        let sampled = &starts[starts.len().saturating_sub(max_windows)..];
        let windows = sampled
            .iter()
            .map(|start| {
                let end = start + interval_seconds(interval_minutes);
                let outcomes = self.scorer.collect_streams(entity, *start, end);
                let streams = self
                    .config
                    .streams
                    .iter()
                    .filter_map(|stream| {
                        let outcome = outcomes.get(&stream.name)?;
                        Some(ProbeStream {
                            stream: stream.name.clone(),
                            collection: stream.collection.clone(),
                            strategy: outcome.located.strategy.map(|s| s.as_str().to_string()),
                            documents: outcome.located.documents.len(),
                            extractor: outcome.signal.map(|signal| signal.extractor.to_string()),
                            component: outcome.component,
                            attempts: outcome.located.attempts.clone(),
                        })
                    })
                    .collect();
                ProbeWindow {
                    window_start_ts: *start,
                    window_end_ts: end,
                    persisted: persisted.contains(start),
                    streams,
                }
            })
            .collect();

        Ok(ProbeReport {
            entity: entity.to_string(),
            interval_minutes,
            since_ts,
            until_ts,
            windows_in_range: starts.len(),
            truncated: starts.len() > sampled.len(),
            windows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvaluatorError;
    use crate::services::backfill::TokioWorkerPool;
    use crate::store::MemoryStore;
    use crate::test_support::{doc, evaluator, store_with};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    const HOUR: i64 = 3_600;

    #[test]
    fn empty_store_yields_synthetic_window_and_evaluation() {
        let store = Arc::new(MemoryStore::new());
        let evaluator = evaluator(store.clone());
        let (window, evaluation) = evaluator
            .compute_window_with_evaluation("acme", 60, 10 * HOUR + 125)
            .unwrap();

        assert_eq!(window.window_start_ts, 10 * HOUR);
        assert_eq!(window.window_end_ts - window.window_start_ts, 60 * 60);
        assert!(window.synthetic);
        assert!(evaluation.synthetic);
        assert_eq!(window.confidence, 1.0);
        let score = window.score.unwrap();
        assert!((0.0..=100.0).contains(&score));
        assert_eq!(store.len("risk_windows"), 1);
        assert_eq!(store.len("risk_evaluations"), 1);

        let again = evaluator.compute_window("acme", 60, 10 * HOUR).unwrap();
        assert_eq!(again, window);
        assert_eq!(store.len("risk_windows"), 1);
    }

    #[test]
    fn rejects_unknown_labels_and_bad_minutes() {
        let evaluator = evaluator(Arc::new(MemoryStore::new()));
        let err = evaluator.ensure_windows("acme", "7m", 0, HOUR).unwrap_err();
        assert!(matches!(err, EvaluatorError::UnsupportedInterval { .. }));
        assert!(!err.is_retryable());
        let err = evaluator.compute_window("acme", 7, 0).unwrap_err();
        assert_eq!(err.code(), "invalid_interval");
        assert_eq!(evaluator.resolve_interval(" 1H ").unwrap(), 60);
    }

    #[test]
    fn ensure_windows_is_idempotent_and_plans_nothing_afterwards() {
        let store = store_with(&[
            ("social_posts", doc("acme", HOUR + 60, json!({ "sentiment": -0.5 }))),
            ("transactions", doc("acme", 2 * HOUR + 60, json!({ "status": "flagged" }))),
            ("prices", doc("acme", 3 * HOUR + 10, json!({ "price": 10.0 }))),
        ]);
        let evaluator = evaluator(store);

        let first = evaluator.ensure_windows("acme", "1h", 0, 5 * HOUR).unwrap();
        assert_eq!(first.len(), 5);
        let starts: Vec<i64> = first.iter().map(|w| w.window_start_ts).collect();
        assert_eq!(starts, vec![0, HOUR, 2 * HOUR, 3 * HOUR, 4 * HOUR]);
        for window in &first {
            assert!((0.0..=1.0).contains(&window.confidence));
            if let Some(score) = window.score {
                assert!((0.0..=100.0).contains(&score));
            }
        }

        let second = evaluator.ensure_windows("acme", "1h", 0, 5 * HOUR).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert!(evaluator
            .plan_missing_windows("acme", 60, 0, 5 * HOUR)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn plan_lists_only_gaps_in_order() {
        let evaluator = evaluator(Arc::new(MemoryStore::new()));
        evaluator.compute_window("acme", 60, HOUR).unwrap();
        evaluator.compute_window("acme", 60, 3 * HOUR).unwrap();
        let missing = evaluator
            .plan_missing_windows("acme", 60, 0, 4 * HOUR + 30)
            .unwrap();
        assert_eq!(missing, vec![0, 2 * HOUR]);
        // other entities are independent
        assert_eq!(
            evaluator.plan_missing_windows("globex", 60, 0, 2 * HOUR).unwrap(),
            vec![0, HOUR]
        );
    }

    #[test]
    fn adjacent_evaluations_respect_rate_caps() {
        let mut docs = Vec::new();
        for hour in 0..12i64 {
            let status = if hour % 3 == 0 { "flagged" } else { "ok" };
            let sentiment = if hour % 2 == 0 { -1.0 } else { 1.0 };
            docs.push((
                "transactions",
                doc("acme", hour * HOUR + 10, json!({ "status": status })),
            ));
            docs.push((
                "social_posts",
                doc("acme", hour * HOUR + 20, json!({ "sentiment": sentiment })),
            ));
        }
        let evaluator = evaluator(store_with(&docs));
        evaluator.ensure_windows("acme", "1h", 0, 12 * HOUR).unwrap();

        let mut evaluations = evaluator
            .fetch_evaluations("acme", "1h", 0, None, None)
            .unwrap();
        assert_eq!(evaluations.len(), 12);
        evaluations.reverse();
        let smoothing = &evaluator.config().smoothing;
        let bound = smoothing.max_rise_pct.max(smoothing.max_drop_pct);
        for pair in evaluations.windows(2) {
            let delta = pair[1].scores_smoothed.total - pair[0].scores_smoothed.total;
            assert!(delta.abs() <= bound + 1e-9);
        }
    }

    #[test]
    fn fetches_are_newest_first_and_limited() {
        let evaluator = evaluator(Arc::new(MemoryStore::new()));
        evaluator.ensure_windows("acme", "1h", 0, 6 * HOUR).unwrap();

        let latest = evaluator.fetch_scores("acme", "1h", 2, None, None).unwrap();
        let starts: Vec<i64> = latest.iter().map(|w| w.window_start_ts).collect();
        assert_eq!(starts, vec![5 * HOUR, 4 * HOUR]);

        let bounded = evaluator
            .fetch_evaluations("acme", "1h", 10, Some(HOUR), Some(3 * HOUR))
            .unwrap();
        let starts: Vec<i64> = bounded.iter().map(|e| e.window_start_ts).collect();
        assert_eq!(starts, vec![3 * HOUR, 2 * HOUR, HOUR]);
    }

    #[test]
    fn summary_covers_lookback_window() {
        let evaluator = evaluator(Arc::new(MemoryStore::new()));
        evaluator.ensure_windows("acme", "1h", 0, 6 * HOUR).unwrap();
        let summary = evaluator
            .summarize_scores("acme", "1h", 4, None, None)
            .unwrap();
        assert_eq!(summary.window_count, 4);
        assert_eq!(summary.trend.first().map(|p| p.window_start_ts), Some(2 * HOUR));
        assert_eq!(summary.latest.as_ref().map(|w| w.window_start_ts), Some(5 * HOUR));
        assert!(summary.trend.iter().all(|point| point.smoothed.is_some()));
        assert!(summary.delta.is_some());
    }

    #[test]
    fn repeated_trigger_returns_the_queued_job() {
        let evaluator = evaluator(Arc::new(MemoryStore::new()));
        let stash: Arc<Mutex<Vec<BackfillTask>>> = Arc::new(Mutex::new(Vec::new()));
        let deferred = {
            let stash = stash.clone();
            move |task: BackfillTask| -> anyhow::Result<()> {
                stash.lock().unwrap().push(task);
                Ok(())
            }
        };
        let submitter: &dyn Submitter = &deferred;

        let first = evaluator
            .trigger_or_status("acme", "1h", Some(submitter), Some(3))
            .unwrap();
        assert_eq!(first.status, JobState::Queued);
        assert_eq!(first.planned, 3);

        let second = evaluator
            .trigger_or_status("acme", "1h", Some(submitter), Some(3))
            .unwrap();
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(stash.lock().unwrap().len(), 1);

        let tasks: Vec<BackfillTask> = stash.lock().unwrap().drain(..).collect();
        for task in tasks {
            task();
        }
        let done = evaluator.job_status(first.job_id).unwrap();
        assert_eq!(done.status, JobState::Done);
        assert_eq!(done.processed, 3);
        assert_eq!(done.eta_seconds, Some(0.0));
        assert!(done.errors.is_empty());
    }

    #[test]
    fn synchronous_trigger_continues_from_latest_window() {
        let evaluator = evaluator(Arc::new(MemoryStore::new()));
        let until = align_down(now_ts(), 60);
        let seeded = evaluator.compute_window("acme", 60, until - 5 * HOUR).unwrap();

        let job = evaluator.trigger_or_status("acme", "1h", None, None).unwrap();
        assert_eq!(job.range_start_ts, seeded.window_end_ts);
        assert_eq!(job.status, JobState::Done);
        assert_eq!(
            job.planned as i64,
            (job.range_end_ts - job.range_start_ts) / HOUR
        );
        assert_eq!(job.processed, job.planned);
        assert!(evaluator
            .plan_missing_windows("acme", 60, job.range_start_ts, job.range_end_ts)
            .unwrap()
            .is_empty());

        let again = evaluator.trigger_or_status("acme", "1h", None, None).unwrap();
        assert_ne!(again.job_id, job.job_id);
        assert_eq!(again.planned, 0);
        assert_eq!(again.status, JobState::Done);
    }

    #[test]
    fn failed_submission_marks_job_as_error() {
        let evaluator = evaluator(Arc::new(MemoryStore::new()));
        let refusing = |_task: BackfillTask| -> anyhow::Result<()> {
            Err(anyhow::anyhow!("worker pool saturated"))
        };
        let job = evaluator
            .trigger_or_status("acme", "1h", Some(&refusing), Some(2))
            .unwrap();
        assert_eq!(job.status, JobState::Error);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].code, "submit_failed");
        assert!(evaluator.jobs().active_for("acme", 60).is_none());
    }

    /// Reads from memory; every write panics.
    struct PanickingWrites(MemoryStore);

    impl DocumentStore for PanickingWrites {
        fn find(
            &self,
            collection: &str,
            filter: &crate::store::Filter,
            options: &crate::store::FindOptions,
        ) -> anyhow::Result<Vec<crate::store::Document>> {
            self.0.find(collection, filter, options)
        }

        fn count(&self, collection: &str, filter: &crate::store::Filter) -> anyhow::Result<u64> {
            self.0.count(collection, filter)
        }

        fn upsert_by_key(
            &self,
            _collection: &str,
            _key: &serde_json::Map<String, serde_json::Value>,
            _document: crate::store::Document,
        ) -> anyhow::Result<()> {
            panic!("write path unavailable");
        }
    }

    #[test]
    fn panicking_store_fails_the_job_instead_of_leaving_it_running() {
        let evaluator = Arc::new(WindowRiskEvaluator::new(
            Arc::new(PanickingWrites(MemoryStore::new())),
            EvaluatorConfig::default(),
        ));
        let inline = |task: BackfillTask| -> anyhow::Result<()> {
            task();
            Ok(())
        };
        let job = evaluator
            .trigger_or_status("acme", "1h", Some(&inline), Some(2))
            .unwrap();
        assert_eq!(job.status, JobState::Error);
        assert_eq!(job.processed, 2);
        assert!(job.errors.iter().all(|error| error.code == "panic"));
        assert!(evaluator.jobs().active_for("acme", 60).is_none());

        let retried = evaluator
            .trigger_or_status("acme", "1h", Some(&inline), Some(2))
            .unwrap();
        assert_ne!(retried.job_id, job.job_id);
    }

    #[test]
    fn unusable_horizon_falls_back_to_interval_default() {
        let evaluator = evaluator(Arc::new(MemoryStore::new()));
        let deferred = |_task: BackfillTask| -> anyhow::Result<()> { Ok(()) };
        let job = evaluator
            .trigger_or_status("acme", "30m", Some(&deferred), Some(0))
            .unwrap();
        assert!(job.horizon_fallback);
        assert_eq!(job.range_end_ts - job.range_start_ts, 48 * HOUR);
        assert_eq!(job.planned, 96);
    }

    #[test]
    fn range_diagnostics_report_strategies_without_writing() {
        let store = store_with(&[
            (
                "social_posts",
                json!({ "entity_id": "ACME", "ts": (HOUR + 5) * 1000, "sentiment": 0.4 }),
            ),
            ("reviews", doc("acme", HOUR + 30, json!({ "rating": 2 }))),
        ]);
        let evaluator = evaluator(store.clone());
        let report = evaluator.probe_range("acme", 60, 0, 3 * HOUR, 2).unwrap();

        assert_eq!(report.windows_in_range, 3);
        assert!(report.truncated);
        assert_eq!(report.windows.len(), 2);
        let window = &report.windows[0];
        assert_eq!(window.window_start_ts, HOUR);
        assert!(!window.persisted);
        let reviews = window.streams.iter().find(|s| s.stream == "reviews").unwrap();
        assert_eq!(reviews.strategy.as_deref(), Some("primary_seconds"));
        assert_eq!(reviews.documents, 1);
        let transactions = window
            .streams
            .iter()
            .find(|s| s.stream == "transactions")
            .unwrap();
        assert_eq!(transactions.strategy, None);
        assert_eq!(transactions.attempts.len(), 7);
        assert_eq!(store.len("risk_windows"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn worker_pool_runs_backfill_in_background() {
        let evaluator = evaluator(Arc::new(MemoryStore::new()));
        let pool = TokioWorkerPool::current(2).unwrap();
        let job = evaluator
            .trigger_or_status("acme", "1h", Some(&pool), Some(4))
            .unwrap();
        assert_eq!(job.planned, 4);

        let mut status = job.status;
        for _ in 0..500 {
            status = evaluator.job_status(job.job_id).unwrap().status;
            if !status.is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, JobState::Done);
        assert_eq!(evaluator.fetch_scores("acme", "1h", 0, None, None).unwrap().len(), 4);
    }
}
