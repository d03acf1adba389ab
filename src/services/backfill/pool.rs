use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

pub type BackfillTask = Box<dyn FnOnce() + Send + 'static>;

/// Hands a backfill job body to a worker. Closures `Fn(BackfillTask) -> Result<()>` qualify.
pub trait Submitter: Send + Sync {
    fn submit(&self, task: BackfillTask) -> Result<()>;
}

impl<F> Submitter for F
where
    F: Fn(BackfillTask) -> Result<()> + Send + Sync,
{
    fn submit(&self, task: BackfillTask) -> Result<()> {
        self(task)
    }
}

/// Bounded pool on a tokio runtime. Job bodies block on the store, so each runs on the
/// blocking thread pool while holding one of `max_concurrent` permits.
#[derive(Clone)]
pub struct TokioWorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl TokioWorkerPool {
    pub fn new(handle: Handle, max_concurrent: usize) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Pool on the runtime the caller is running in.
    pub fn current(max_concurrent: usize) -> Result<Self> {
        let handle = Handle::try_current().context("no tokio runtime available for worker pool")?;
        Ok(Self::new(handle, max_concurrent))
    }
}

impl Submitter for TokioWorkerPool {
    fn submit(&self, task: BackfillTask) -> Result<()> {
        let permits = self.permits.clone();
        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::warn!("backfill worker pool closed; dropping task");
                return;
            };
            if let Err(err) = tokio::task::spawn_blocking(task).await {
                tracing::warn!(error = %err, "backfill worker task panicked");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_submitted_tasks_on_blocking_pool() -> Result<()> {
        let pool = TokioWorkerPool::current(2)?;
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))?;
        }
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        Ok(())
    }

    #[test]
    fn closures_are_submitters() -> Result<()> {
        let ran = Arc::new(AtomicUsize::new(0));
        let inline = |task: BackfillTask| -> Result<()> {
            task();
            Ok(())
        };
        let flag = ran.clone();
        inline.submit(Box::new(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        }))?;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
