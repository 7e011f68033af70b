//! Job loops and lifecycle

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::job::{Job, JobStatus};
use super::task::ScheduledTask;
use crate::clock::SharedClock;
use crate::error::{Error, Result};

/// Recurring job scheduler
///
/// One loop per job. A job never overlaps itself: the periodic loop and
/// [`Scheduler::run_now`] share the same running flag, and a tick that
/// finds the job busy is skipped.
pub struct Scheduler {
    jobs: RwLock<BTreeMap<String, Arc<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    clock: SharedClock,
}

impl Scheduler {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            handles: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            clock,
        }
    }

    /// Register a job. A job registered after [`start`](Self::start) begins
    /// its schedule immediately.
    pub fn register<T>(&self, job_id: impl Into<String>, interval: Duration, task: T) -> Result<()>
    where
        T: ScheduledTask + 'static,
    {
        let job_id = job_id.into();
        if interval.is_zero() {
            return Err(Error::Config(format!(
                "job {} must have a non-zero interval",
                job_id
            )));
        }

        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job_id) {
            return Err(Error::JobAlreadyRegistered(job_id));
        }

        let job = Arc::new(Job::new(job_id.clone(), interval, Arc::new(task)));
        jobs.insert(job_id.clone(), job.clone());
        info!("Registered job {} every {:?}", job_id, interval);

        if self.started.load(Ordering::Acquire) && !self.cancel.is_cancelled() {
            self.spawn_loop(job);
        }
        Ok(())
    }

    /// Start every registered job loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let jobs = self.jobs.read();
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("Scheduler already started");
            return;
        }
        if self.cancel.is_cancelled() {
            warn!("Scheduler was stopped and cannot be restarted");
            return;
        }

        info!("Starting scheduler with {} jobs", jobs.len());
        for job in jobs.values() {
            self.spawn_loop(job.clone());
        }
    }

    /// Stop every loop and wait for in-flight invocations to finish
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("Job loop terminated abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }

    /// Run a job right now, outside its schedule. Returns `Ok(false)` when
    /// an invocation is already in flight.
    pub async fn run_now(&self, job_id: &str) -> Result<bool> {
        let job = self
            .jobs
            .read()
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        Ok(job.run_exclusive(&self.clock).await)
    }

    /// Status of every job, sorted by id
    pub fn status(&self) -> Vec<JobStatus> {
        self.jobs.read().values().map(|job| job.status()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    fn spawn_loop(&self, job: Arc<Job>) {
        let handle = tokio::spawn(job_loop(job, self.clock.clone(), self.cancel.child_token()));
        self.handles.lock().push(handle);
    }
}

async fn job_loop(job: Arc<Job>, clock: SharedClock, cancel: CancellationToken) {
    let mut tick = interval(job.interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately; the first run waits one interval
    tick.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(job_id = %job.id(), "Job loop shutting down");
                break;
            }

            _ = tick.tick() => {
                job.run_exclusive(&clock).await;
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.jobs.read().keys().collect::<Vec<_>>())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::scheduler::FnTask;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn scheduler() -> Scheduler {
        Scheduler::new(SystemClock::shared())
    }

    fn counting_task(calls: Arc<AtomicUsize>) -> impl ScheduledTask {
        FnTask::new(move || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let s = scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        s.register("flush", Duration::from_secs(1), counting_task(calls.clone()))
            .unwrap();

        let err = s
            .register("flush", Duration::from_secs(5), counting_task(calls))
            .unwrap_err();
        assert_matches!(err, Error::JobAlreadyRegistered(id) if id == "flush");
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let s = scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        assert_matches!(
            s.register("bad", Duration::ZERO, counting_task(calls)),
            Err(Error::Config(_))
        );
    }

    #[tokio::test]
    async fn test_jobs_run_periodically_until_stopped() {
        let s = scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        s.register("tick", Duration::from_millis(10), counting_task(calls.clone()))
            .unwrap();

        s.start();
        sleep(Duration::from_millis(120)).await;
        s.stop().await;

        let after_stop = calls.load(Ordering::SeqCst);
        assert!(after_stop >= 3, "ran {} times", after_stop);

        sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
        assert!(!s.is_running());
    }

    #[tokio::test]
    async fn test_no_overlapping_invocations() {
        let s = Arc::new(scheduler());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let task = FnTask::new({
            let active = active.clone();
            let max_active = max_active.clone();
            move || {
                let active = active.clone();
                let max_active = max_active.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(40)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        });
        s.register("slow", Duration::from_millis(5), task).unwrap();
        s.start();

        let mut skipped = 0;
        for _ in 0..10 {
            if !s.run_now("slow").await.unwrap() {
                skipped += 1;
            }
            sleep(Duration::from_millis(7)).await;
        }
        s.stop().await;

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert!(skipped > 0);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let s = scheduler();
        let task = FnTask::new(|| async { Err(Error::Internal("boom".into())) });
        s.register("failing", Duration::from_millis(10), task).unwrap();

        s.start();
        sleep(Duration::from_millis(80)).await;
        s.stop().await;

        let status = &s.status()[0];
        assert!(status.runs >= 2);
        assert_eq!(status.failures, status.runs);
        assert_eq!(status.last_error.as_deref(), Some("Internal error: boom"));
    }

    #[tokio::test]
    async fn test_panics_are_caught() {
        let s = scheduler();
        let task = FnTask::new(|| async {
            if true {
                panic!("job exploded");
            }
            Ok(())
        });
        s.register("panicky", Duration::from_secs(60), task).unwrap();

        assert!(s.run_now("panicky").await.unwrap());
        assert!(s.run_now("panicky").await.unwrap());

        let status = &s.status()[0];
        assert_eq!(status.failures, 2);
        assert!(!status.running);
        assert!(status.last_error.as_deref().unwrap().contains("job exploded"));
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_run() {
        let s = scheduler();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let task = FnTask::new({
            let started = started.clone();
            let finished = finished.clone();
            move || {
                let started = started.clone();
                let finished = finished.clone();
                async move {
                    started.store(true, Ordering::SeqCst);
                    sleep(Duration::from_millis(100)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }
        });
        s.register("long", Duration::from_millis(10), task).unwrap();
        s.start();

        while !started.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(2)).await;
        }
        s.stop().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_register_after_start_runs() {
        let s = scheduler();
        s.start();

        let calls = Arc::new(AtomicUsize::new(0));
        s.register("late", Duration::from_millis(10), counting_task(calls.clone()))
            .unwrap();
        sleep(Duration::from_millis(60)).await;
        s.stop().await;

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_status_sorted_and_serializable() {
        let s = scheduler();
        let calls = Arc::new(AtomicUsize::new(0));
        s.register("b-reap", Duration::from_secs(10), counting_task(calls.clone()))
            .unwrap();
        s.register("a-flush", Duration::from_secs(30), counting_task(calls))
            .unwrap();
        s.run_now("a-flush").await.unwrap();

        let status = s.status();
        let ids: Vec<_> = status.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["a-flush", "b-reap"]);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json[0]["interval"], "30s");
        assert_eq!(json[0]["runs"], 1);
        assert!(json[1]["last_run_at"].is_null());
    }

    #[tokio::test]
    async fn test_run_now_unknown_job() {
        let s = scheduler();
        assert_matches!(s.run_now("ghost").await, Err(Error::JobNotFound(_)));
    }
}
