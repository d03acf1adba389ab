use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Done => "done",
            JobState::Error => "error",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_start_ts: Option<i64>,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub entity: String,
    pub interval_minutes: u32,
    pub interval_label: String,
    pub status: JobState,
    pub planned: u64,
    pub processed: u64,
    /// Windows per minute.
    pub throughput: Option<f64>,
    /// Seconds until the remaining windows are done, at the current throughput.
    pub eta_seconds: Option<f64>,
    pub errors: Vec<JobError>,
    pub range_start_ts: i64,
    pub range_end_ts: i64,
    /// True when the requested backfill horizon was unusable and the default applied.
    pub horizon_fallback: bool,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// In-process registry of backfill jobs. Jobs are not persisted and vanish with the process.
pub struct JobManager {
    jobs: Mutex<HashMap<Uuid, Job>>,
    max_errors: usize,
    retention: chrono::Duration,
}

impl JobManager {
    pub fn new(max_errors: usize, retention_minutes: i64) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            max_errors: max_errors.max(1),
            retention: chrono::Duration::minutes(retention_minutes.max(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        self.lock().get(&job_id).cloned()
    }

    pub fn active_for(&self, entity: &str, interval_minutes: u32) -> Option<Job> {
        find_active(&self.lock(), entity, interval_minutes).cloned()
    }

    /// Every known job, newest submission first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        jobs
    }

    /// Inserts `job` unless an active job for the same series exists; returns the job the caller
    /// should report and whether it is the newly inserted one.
    pub(crate) fn register_or_existing(&self, job: Job) -> (Job, bool) {
        let mut jobs = self.lock();
        if let Some(existing) = find_active(&jobs, &job.entity, job.interval_minutes) {
            return (existing.clone(), false);
        }
        let cutoff = job.submitted_at - self.retention;
        jobs.retain(|_, existing| {
            existing.status.is_active()
                || existing
                    .finished_at
                    .map_or(true, |finished| finished >= cutoff)
        });
        jobs.insert(job.job_id, job.clone());
        (job, true)
    }

    pub(crate) fn mark_running(&self, job_id: Uuid, now: DateTime<Utc>) {
        self.update(job_id, |job| {
            job.status = JobState::Running;
            job.started_at = Some(now);
        });
    }

    pub(crate) fn record_progress(
        &self,
        job_id: Uuid,
        processed: u64,
        elapsed: std::time::Duration,
        error: Option<JobError>,
    ) {
        let max_errors = self.max_errors;
        self.update(job_id, |job| {
            job.processed = processed;
            let elapsed_minutes = elapsed.as_secs_f64() / 60.0;
            if processed > 0 && elapsed_minutes > 0.0 {
                let throughput = processed as f64 / elapsed_minutes;
                let remaining = job.planned.saturating_sub(processed) as f64;
                job.throughput = Some(throughput);
                job.eta_seconds = Some(remaining / throughput * 60.0);
            }
            if let Some(error) = error {
                if job.errors.len() < max_errors {
                    job.errors.push(error);
                }
            }
        });
    }

    pub(crate) fn finish(
        &self,
        job_id: Uuid,
        failed_windows: u64,
        now: DateTime<Utc>,
    ) -> Option<Job> {
        self.update(job_id, |job| {
            job.status = if job.planned > 0 && failed_windows >= job.planned {
                JobState::Error
            } else {
                JobState::Done
            };
            job.eta_seconds = Some(0.0);
            job.finished_at = Some(now);
        })
    }

    pub(crate) fn fail(&self, job_id: Uuid, error: JobError, now: DateTime<Utc>) -> Option<Job> {
        let max_errors = self.max_errors;
        self.update(job_id, |job| {
            job.status = JobState::Error;
            job.finished_at = Some(now);
            if job.errors.len() < max_errors {
                job.errors.push(error);
            }
        })
    }

    fn update(&self, job_id: Uuid, apply: impl FnOnce(&mut Job)) -> Option<Job> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(&job_id)?;
        apply(job);
        Some(job.clone())
    }
}

fn find_active<'a>(
    jobs: &'a HashMap<Uuid, Job>,
    entity: &str,
    interval_minutes: u32,
) -> Option<&'a Job> {
    jobs.values().find(|job| {
        job.status.is_active() && job.entity == entity && job.interval_minutes == interval_minutes
    })
}
