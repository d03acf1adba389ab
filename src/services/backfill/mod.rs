pub mod jobs;
pub mod pool;

pub use jobs::{Job, JobError, JobManager, JobState};
pub use pool::{BackfillTask, Submitter, TokioWorkerPool};

use chrono::Utc;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use uuid::Uuid;

use crate::config::BackfillConfig;
use crate::error::EvaluatorResult;
use crate::time::normalize_interval_label;

/// Backfill cap in hours, and whether the requested value had to be replaced by the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HorizonResolution {
    pub hours: u32,
    pub fallback_used: bool,
}

/// Resolves how far back a first backfill may reach for `interval_label`.
///
/// A positive `requested` value wins, capped at `max_requested_hours`. Missing values use the
/// per-interval default silently; zero or negative values fall back to that default and are
/// reported as a fallback.
pub fn resolve_backfill_horizon(
    config: &BackfillConfig,
    interval_label: &str,
    requested: Option<i64>,
) -> HorizonResolution {
    let default_hours = config
        .max_hours_by_interval
        .get(&normalize_interval_label(interval_label))
        .copied()
        .filter(|hours| *hours > 0)
        .unwrap_or(config.max_backfill_hours)
        .max(1);
    match requested {
        None => HorizonResolution {
            hours: default_hours,
            fallback_used: false,
        },
        Some(hours) if hours > 0 => {
            let ceiling = config.max_requested_hours.max(1);
            let capped = u32::try_from(hours).unwrap_or(u32::MAX).min(ceiling);
            if i64::from(capped) < hours {
                tracing::info!(
                    interval_label,
                    requested_hours = hours,
                    max_requested_hours = ceiling,
                    "requested backfill horizon capped"
                );
            }
            HorizonResolution {
                hours: capped,
                fallback_used: false,
            }
        }
        Some(hours) => {
            tracing::info!(
                interval_label,
                requested_hours = hours,
                default_hours,
                "unusable backfill horizon; using interval default"
            );
            HorizonResolution {
                hours: default_hours,
                fallback_used: true,
            }
        }
    }
}

/// Aligned starts in `candidates` that are not yet persisted, ascending.
pub fn missing_starts(candidates: &[i64], persisted: &BTreeSet<i64>) -> Vec<i64> {
    let mut missing: Vec<i64> = candidates
        .iter()
        .copied()
        .filter(|start| !persisted.contains(start))
        .collect();
    missing.sort_unstable();
    missing.dedup();
    missing
}

/// Computes `starts` one after another in chronological order, reporting progress after each
/// window. A failing or panicking window is recorded on the job and the run moves on.
pub fn run_job<F>(jobs: &JobManager, job_id: Uuid, starts: &[i64], mut compute: F) -> Option<Job>
where
    F: FnMut(i64) -> EvaluatorResult<()>,
{
    let started = Instant::now();
    jobs.mark_running(job_id, Utc::now());

    let mut ordered = starts.to_vec();
    ordered.sort_unstable();

    let mut processed = 0u64;
    let mut failed = 0u64;
    for start in ordered {
        let error = match catch_unwind(AssertUnwindSafe(|| compute(start))) {
            Ok(Ok(())) => None,
            Ok(Err(err)) => {
                failed += 1;
                tracing::warn!(window_start_ts = start, error = %err, "backfill window failed");
                Some(JobError {
                    window_start_ts: Some(start),
                    code: err.code().to_string(),
                    message: err.to_string(),
                })
            }
            Err(payload) => {
                failed += 1;
                let message = panic_message(payload.as_ref());
                tracing::warn!(window_start_ts = start, %message, "backfill window panicked");
                Some(JobError {
                    window_start_ts: Some(start),
                    code: "panic".to_string(),
                    message,
                })
            }
        };
        processed += 1;
        jobs.record_progress(job_id, processed, started.elapsed(), error);
    }

    let finished = jobs.finish(job_id, failed, Utc::now());
    if let Some(job) = &finished {
        tracing::info!(
            status = job.status.as_str(),
            processed = job.processed,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "backfill job finished"
        );
    }
    finished
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "window computation panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvaluatorError;

    fn queued(manager: &JobManager, planned: u64) -> Job {
        let job = Job {
            job_id: Uuid::new_v4(),
            entity: "acme".to_string(),
            interval_minutes: 60,
            interval_label: "1h".to_string(),
            status: JobState::Queued,
            planned,
            processed: 0,
            throughput: None,
            eta_seconds: None,
            errors: Vec::new(),
            range_start_ts: 0,
            range_end_ts: planned as i64 * 3_600,
            horizon_fallback: false,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        manager.register_or_existing(job).0
    }

    #[test]
    fn horizon_uses_request_then_interval_default() {
        let config = BackfillConfig::default();
        assert_eq!(
            resolve_backfill_horizon(&config, "1h", Some(12)),
            HorizonResolution {
                hours: 12,
                fallback_used: false
            }
        );
        assert_eq!(
            resolve_backfill_horizon(&config, " 30M ", None),
            HorizonResolution {
                hours: 48,
                fallback_used: false
            }
        );
        assert_eq!(
            resolve_backfill_horizon(&config, "1d", Some(-5)),
            HorizonResolution {
                hours: 2160,
                fallback_used: true
            }
        );
        assert_eq!(resolve_backfill_horizon(&config, "15m", None).hours, 168);
    }

    #[test]
    fn requested_horizon_is_capped() {
        let config = BackfillConfig {
            max_requested_hours: 720,
            ..BackfillConfig::default()
        };
        assert_eq!(
            resolve_backfill_horizon(&config, "1h", Some(i64::MAX)),
            HorizonResolution {
                hours: 720,
                fallback_used: false
            }
        );
        assert_eq!(resolve_backfill_horizon(&config, "1h", Some(721)).hours, 720);
        assert_eq!(resolve_backfill_horizon(&config, "1h", Some(720)).hours, 720);
    }

    #[test]
    fn missing_starts_are_sorted_and_exclude_persisted() {
        let persisted = BTreeSet::from([3_600, 10_800]);
        assert_eq!(
            missing_starts(&[10_800, 7_200, 0, 3_600, 7_200], &persisted),
            vec![0, 7_200]
        );
    }

    #[test]
    fn runner_processes_in_order_and_keeps_going_after_errors() {
        let manager = JobManager::new(10, 60);
        let job = queued(&manager, 3);
        let mut seen = Vec::new();
        let finished = run_job(&manager, job.job_id, &[7_200, 0, 3_600], |start| {
            seen.push(start);
            if start == 3_600 {
                return Err(EvaluatorError::Store(anyhow::anyhow!("store unavailable")));
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![0, 3_600, 7_200]);
        assert_eq!(finished.status, JobState::Done);
        assert_eq!(finished.processed, 3);
        assert_eq!(finished.errors.len(), 1);
        assert_eq!(finished.errors[0].window_start_ts, Some(3_600));
        assert_eq!(finished.errors[0].code, "store_error");
        assert!(finished.started_at.is_some());
        assert!(finished.finished_at.is_some());
    }

    #[test]
    fn panicking_window_is_recorded_and_the_job_finishes() {
        let manager = JobManager::new(10, 60);
        let job = queued(&manager, 3);
        let finished = run_job(&manager, job.job_id, &[0, 3_600, 7_200], |start| {
            if start == 3_600 {
                panic!("upsert exploded");
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(finished.status, JobState::Done);
        assert_eq!(finished.processed, 3);
        assert_eq!(finished.errors.len(), 1);
        assert_eq!(finished.errors[0].code, "panic");
        assert_eq!(finished.errors[0].message, "upsert exploded");
        assert!(manager.active_for("acme", 60).is_none());
    }

    #[test]
    fn job_with_every_window_failing_ends_in_error() {
        let manager = JobManager::new(10, 60);
        let job = queued(&manager, 2);
        let finished = run_job(&manager, job.job_id, &[0, 3_600], |_| {
            Err(EvaluatorError::Store(anyhow::anyhow!("down")))
        })
        .unwrap();
        assert_eq!(finished.status, JobState::Error);
        assert_eq!(finished.errors.len(), 2);
    }
}
