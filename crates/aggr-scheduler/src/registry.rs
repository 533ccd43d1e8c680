//! Per-job run bookkeeping: last status, last error, and the
//! single-flight guard that keeps two fires of the same job from
//! running concurrently (`spec.md` §4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Success,
    Failed,
}

/// Snapshot of a job's most recent fire, for status reporting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobRecord {
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_status: Option<JobRunStatus>,
    pub last_error: Option<String>,
    pub last_summary: Option<serde_json::Value>,
    pub skipped_overlap_count: u64,
}

struct Slot {
    record: JobRecord,
    running: Arc<AtomicBool>,
    running_since: Option<Instant>,
    misfire_grace: Duration,
}

/// A single-flight guard acquired before a job body runs; dropping it
/// (including on panic unwind) releases the slot for the next fire.
pub struct RunGuard {
    running: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Shared registry of job slots, cheap to clone (`Arc` inside) so every
/// scheduled closure can hold its own handle.
#[derive(Clone, Default)]
pub struct JobRegistry {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&self, name: &str, misfire_grace: Duration) {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(name.to_string()).or_insert_with(|| Slot {
            record: JobRecord::default(),
            running: Arc::new(AtomicBool::new(false)),
            running_since: None,
            misfire_grace,
        });
    }

    /// Try to acquire the single-flight slot for `name`. Returns `None`
    /// (and records the skip) if a prior fire is still in flight; logs
    /// at warn level when that prior fire has already exceeded its
    /// misfire grace window, since that means the cadence itself may be
    /// too aggressive for how long the job actually takes.
    pub fn try_acquire(&self, name: &str) -> Option<RunGuard> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(name)?;

        if slot.running.swap(true, Ordering::SeqCst) {
            slot.record.skipped_overlap_count += 1;
            let overrun = slot
                .running_since
                .map(|since| since.elapsed() > slot.misfire_grace)
                .unwrap_or(false);
            if overrun {
                tracing::warn!(job = name, "prior run exceeded misfire grace window, still in flight");
            } else {
                tracing::debug!(job = name, "skipping fire, prior run still in flight");
            }
            return None;
        }

        slot.running_since = Some(Instant::now());
        slot.record.last_started_at = Some(Utc::now());
        Some(RunGuard {
            running: Arc::clone(&slot.running),
        })
    }

    pub fn record_finish(
        &self,
        name: &str,
        status: JobRunStatus,
        summary: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(name) {
            slot.running_since = None;
            slot.record.last_finished_at = Some(Utc::now());
            slot.record.last_status = Some(status);
            slot.record.last_summary = summary;
            slot.record.last_error = error;
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<JobRecord> {
        self.slots.lock().unwrap().get(name).map(|s| s.record.clone())
    }

    pub fn snapshot_all(&self) -> HashMap<String, JobRecord> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .map(|(name, slot)| (name.clone(), slot.record.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_while_running_is_rejected() {
        let registry = JobRegistry::new();
        registry.declare("job", Duration::from_secs(60));

        let guard = registry.try_acquire("job").expect("first acquire succeeds");
        assert!(registry.try_acquire("job").is_none());

        drop(guard);
        assert!(registry.try_acquire("job").is_some());
    }

    #[test]
    fn finish_records_status_and_summary() {
        let registry = JobRegistry::new();
        registry.declare("job", Duration::from_secs(60));
        let _guard = registry.try_acquire("job").unwrap();

        registry.record_finish(
            "job",
            JobRunStatus::Success,
            Some(serde_json::json!({"processed": 3})),
            None,
        );

        let record = registry.snapshot("job").unwrap();
        assert_eq!(record.last_status, Some(JobRunStatus::Success));
        assert_eq!(record.last_summary, Some(serde_json::json!({"processed": 3})));
    }

    #[test]
    fn skipped_overlap_is_counted() {
        let registry = JobRegistry::new();
        registry.declare("job", Duration::from_secs(60));
        let _guard = registry.try_acquire("job").unwrap();
        assert!(registry.try_acquire("job").is_none());

        let record = registry.snapshot("job").unwrap();
        assert_eq!(record.skipped_overlap_count, 1);
    }
}
