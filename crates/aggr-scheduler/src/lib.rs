//! Periodic job scheduling for the aggregation/merge pipeline
//! (`spec.md` §4.7).
//!
//! The scheduler owns no business logic: callers register a name, a
//! cron expression, and an async closure; this crate only handles
//! cadence, single-flight protection (a job already in flight is
//! skipped rather than stacked), and last-run status reporting. The
//! closures that do real work — running the Aggregation Engine, the
//! Merge Engine, or anything else — live in the binary that wires this
//! crate up.

mod registry;

pub use registry::{JobRecord, JobRunStatus};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use registry::JobRegistry;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression {cron:?} for job {job}: {source}")]
    InvalidCron {
        job: String,
        cron: String,
        #[source]
        source: JobSchedulerError,
    },

    #[error("job {job} could not be registered: {source}")]
    Registration {
        job: String,
        #[source]
        source: JobSchedulerError,
    },

    #[error("job scheduler failed to start: {0}")]
    Start(#[source] JobSchedulerError),

    #[error("job scheduler failed to shut down: {0}")]
    Shutdown(#[source] JobSchedulerError),

    #[error("no job named {0} is registered")]
    UnknownJob(String),
}

pub type JobResult = Result<serde_json::Value, String>;
pub type JobFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;
pub type JobBody = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Default cadences named in `spec.md` §4.7, expressed as cron strings
/// (`tokio-cron-scheduler` uses the seconds-first, 7-field form).
pub mod cadence {
    pub const AGGREGATION: &str = "0 0 */2 * * *";
    pub const MERGE: &str = "0 0 3 * * *";
    pub const INGESTION_VALIDATION: &str = "0 */10 * * * *";
    pub const LABELING: &str = "0 0 * * * *";
    pub const CLEANUP: &str = "0 0 4 * * *";
}

/// Single-flight, misfire-aware wrapper around `tokio_cron_scheduler`.
///
/// Each registered job gets its own slot in a [`JobRegistry`]; a fire
/// that lands while the previous one is still running is dropped
/// rather than queued, and the skip is counted so `status()` can
/// surface a cadence that's running hotter than the job can keep up
/// with.
pub struct Scheduler {
    inner: JobScheduler,
    registry: JobRegistry,
    job_ids: HashMap<String, uuid::Uuid>,
}

impl Scheduler {
    pub async fn new() -> Result<Self, SchedulerError> {
        let inner = JobScheduler::new().await.map_err(SchedulerError::Start)?;
        Ok(Self {
            inner,
            registry: JobRegistry::new(),
            job_ids: HashMap::new(),
        })
    }

    /// Register a job under `cron`, firing `body` on each tick. A fire
    /// that overlaps a still-running prior fire of the same job is
    /// skipped. `misfire_grace` is the duration after which an
    /// overlapping fire is logged at warn level instead of debug, since
    /// at that point the cadence is probably too tight for the job.
    pub async fn register(
        &mut self,
        name: &str,
        cron: &str,
        misfire_grace: Duration,
        body: JobBody,
    ) -> Result<(), SchedulerError> {
        self.registry.declare(name, misfire_grace);

        let registry = self.registry.clone();
        let job_name = name.to_string();

        let job = Job::new_async(cron, move |_uuid, _lock| {
            let registry = registry.clone();
            let body = Arc::clone(&body);
            let job_name = job_name.clone();
            Box::pin(async move {
                let guard = match registry.try_acquire(&job_name) {
                    Some(guard) => guard,
                    None => return,
                };

                let outcome = (body)().await;
                drop(guard);

                match outcome {
                    Ok(summary) => {
                        tracing::info!(job = %job_name, "run completed");
                        registry.record_finish(&job_name, JobRunStatus::Success, Some(summary), None);
                    }
                    Err(error) => {
                        tracing::error!(job = %job_name, %error, "run failed");
                        registry.record_finish(&job_name, JobRunStatus::Failed, None, Some(error));
                    }
                }
            })
        })
        .map_err(|source| SchedulerError::InvalidCron {
            job: name.to_string(),
            cron: cron.to_string(),
            source,
        })?;

        let job_id = self
            .inner
            .add(job)
            .await
            .map_err(|source| SchedulerError::Registration {
                job: name.to_string(),
                source,
            })?;
        self.job_ids.insert(name.to_string(), job_id);
        Ok(())
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.inner.start().await.map_err(SchedulerError::Start)
    }

    pub async fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.inner.shutdown().await.map_err(SchedulerError::Shutdown)
    }

    pub fn status(&self, name: &str) -> Result<JobRecord, SchedulerError> {
        self.registry
            .snapshot(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))
    }

    pub fn status_all(&self) -> HashMap<String, JobRecord> {
        self.registry.snapshot_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn registered_job_runs_and_records_success() {
        let mut scheduler = Scheduler::new().await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        scheduler
            .register(
                "every-second",
                "* * * * * *",
                Duration::from_secs(5),
                Arc::new(move || {
                    let calls = Arc::clone(&calls_clone);
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(serde_json::json!({"ok": true}))
                    })
                }),
            )
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.shutdown().await.unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 1);
        let record = scheduler.status("every-second").unwrap();
        assert_eq!(record.last_status, Some(JobRunStatus::Success));
    }

    #[tokio::test]
    async fn failed_run_is_recorded_without_panicking() {
        let mut scheduler = Scheduler::new().await.unwrap();

        scheduler
            .register(
                "flaky",
                "* * * * * *",
                Duration::from_secs(5),
                Arc::new(|| Box::pin(async { Err("boom".to_string()) })),
            )
            .await
            .unwrap();

        scheduler.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.shutdown().await.unwrap();

        let record = scheduler.status("flaky").unwrap();
        assert_eq!(record.last_status, Some(JobRunStatus::Failed));
        assert_eq!(record.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_job_status_is_an_error() {
        let scheduler = Scheduler::new().await.unwrap();
        assert!(matches!(
            scheduler.status("nope"),
            Err(SchedulerError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected_at_registration() {
        let mut scheduler = Scheduler::new().await.unwrap();
        let result = scheduler
            .register(
                "bad",
                "not a cron expression",
                Duration::from_secs(5),
                Arc::new(|| Box::pin(async { Ok(serde_json::json!({})) })),
            )
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidCron { .. })));
    }
}
