//! Registered job state and guarded execution

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Serialize, Serializer};
use tracing::{debug, error};

use super::task::ScheduledTask;
use crate::clock::SharedClock;

/// Point-in-time view of one job
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    #[serde(with = "crate::config::duration_str")]
    pub interval: Duration,
    pub running: bool,
    pub runs: u64,
    pub failures: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "serialize_opt_duration")]
    pub last_duration: Option<Duration>,
    pub last_error: Option<String>,
}

fn serialize_opt_duration<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&crate::config::format_duration(*d)),
        None => s.serialize_none(),
    }
}

#[derive(Debug, Default)]
struct LastRun {
    at: Option<DateTime<Utc>>,
    duration: Option<Duration>,
    error: Option<String>,
}

pub(crate) struct Job {
    id: String,
    interval: Duration,
    task: Arc<dyn ScheduledTask>,
    running: AtomicBool,
    runs: AtomicU64,
    failures: AtomicU64,
    last: RwLock<LastRun>,
}

/// Clears the running flag however the run ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Job {
    pub(crate) fn new(id: String, interval: Duration, task: Arc<dyn ScheduledTask>) -> Self {
        Self {
            id,
            interval,
            task,
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last: RwLock::new(LastRun::default()),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the task unless an invocation is already in flight. Errors and
    /// panics are recorded, never propagated. Returns whether it ran.
    pub(crate) async fn run_exclusive(&self, clock: &SharedClock) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(job_id = %self.id, "Job still running, skipping invocation");
            return false;
        }
        let guard = RunningGuard(&self.running);

        let started_at = clock.now();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.task.run()).catch_unwind().await;
        let elapsed = started.elapsed();

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(format!("panicked: {}", panic_message(panic.as_ref()))),
        };

        self.runs.fetch_add(1, Ordering::Relaxed);
        if let Some(reason) = &failure {
            self.failures.fetch_add(1, Ordering::Relaxed);
            error!(job_id = %self.id, error = %reason, "Scheduled job failed");
        } else {
            debug!(job_id = %self.id, elapsed = ?elapsed, "Scheduled job completed");
        }

        *self.last.write() = LastRun {
            at: Some(started_at),
            duration: Some(elapsed),
            error: failure,
        };
        drop(guard);
        true
    }

    pub(crate) fn status(&self) -> JobStatus {
        let last = self.last.read();
        JobStatus {
            job_id: self.id.clone(),
            interval: self.interval,
            running: self.running.load(Ordering::Acquire),
            runs: self.runs.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_run_at: last.at,
            last_duration: last.duration,
            last_error: last.error.clone(),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
