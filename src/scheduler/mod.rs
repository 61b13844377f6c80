mod trigger;

pub use trigger::Trigger;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::models::{JobSpec, SCHEDULED_DATE_FORMAT};

/// Errors surfaced synchronously by the scheduler control surface
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("job already registered: {0}")]
    DuplicateJob(String),
    #[error("job not registered: {0}")]
    UnknownJob(String),
}

/// Receives due jobs from the trigger loop
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job_id: &str, job: JobSpec);
}

struct ScheduledJob {
    job: JobSpec,
    trigger: Trigger,
    next_run: NaiveDateTime,
    paused: bool,
}

/// Snapshot of a registered job
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub trigger: Trigger,
    pub next_run: NaiveDateTime,
    pub paused: bool,
}

impl JobInfo {
    pub fn next_run_display(&self) -> Option<String> {
        if self.paused {
            None
        } else {
            Some(self.next_run.format(SCHEDULED_DATE_FORMAT).to_string())
        }
    }
}

/// Scheduler owns the registered jobs and the trigger evaluation loop.
///
/// Each due job is handed to the [`JobDispatcher`] on its own tokio task,
/// so a slow run never delays evaluation of other triggers.
pub struct Scheduler {
    jobs: RwLock<HashMap<String, ScheduledJob>>,
    dispatcher: Arc<dyn JobDispatcher>,
    tick: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(dispatcher: Arc<dyn JobDispatcher>, tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            dispatcher,
            tick,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Register a one-shot job firing at `run_at`
    pub async fn schedule_once(
        &self,
        job_id: &str,
        run_at: NaiveDateTime,
        job: JobSpec,
        replace: bool,
    ) -> Result<(), SchedulerError> {
        self.register(job_id, Trigger::Once { run_at }, job, replace).await
    }

    /// Register a recurring job firing every `period` starting at `start_at`
    pub async fn schedule_interval(
        &self,
        job_id: &str,
        start_at: NaiveDateTime,
        period: chrono::Duration,
        job: JobSpec,
        replace: bool,
    ) -> Result<(), SchedulerError> {
        self.register(job_id, Trigger::Interval { start_at, period }, job, replace).await
    }

    async fn register(
        &self,
        job_id: &str,
        trigger: Trigger,
        job: JobSpec,
        replace: bool,
    ) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().await;
        if !replace && jobs.contains_key(job_id) {
            return Err(SchedulerError::DuplicateJob(job_id.to_string()));
        }
        let next_run = trigger.first_fire_time();
        tracing::info!("Scheduled job {} ({}), first run at {}", job_id, trigger, next_run);
        jobs.insert(
            job_id.to_string(),
            ScheduledJob {
                job,
                trigger,
                next_run,
                paused: false,
            },
        );
        Ok(())
    }

    /// Stop a job from firing without dropping its schedule
    pub async fn pause(&self, job_id: &str) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;
        entry.paused = true;
        tracing::info!("Paused job {}", job_id);
        Ok(())
    }

    /// Re-enable a paused job from its next occurrence onward
    pub async fn resume(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.resume_at(job_id, now()).await
    }

    pub(crate) async fn resume_at(&self, job_id: &str, now: NaiveDateTime) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;
        entry.paused = false;
        // occurrences missed while paused are skipped; a one-shot keeps its time
        if entry.next_run <= now {
            if let Some(next) = entry.trigger.fire_time_after(now) {
                entry.next_run = next;
            }
        }
        tracing::info!("Resumed job {}, next run at {}", job_id, entry.next_run);
        Ok(())
    }

    /// Permanently remove a job
    pub async fn cancel(&self, job_id: &str) -> Result<(), SchedulerError> {
        let removed = self.jobs.write().await.remove(job_id);
        match removed {
            Some(_) => {
                tracing::info!("Cancelled job {}", job_id);
                Ok(())
            }
            None => Err(SchedulerError::UnknownJob(job_id.to_string())),
        }
    }

    pub async fn job_info(&self, job_id: &str) -> Option<JobInfo> {
        self.jobs.read().await.get(job_id).map(|entry| JobInfo {
            trigger: entry.trigger.clone(),
            next_run: entry.next_run,
            paused: entry.paused,
        })
    }

    /// Fire every job due at `now`, returning the ids that were dispatched
    pub async fn run_pending(&self, now: NaiveDateTime) -> Vec<String> {
        let due: Vec<(String, JobSpec)> = {
            let mut jobs = self.jobs.write().await;
            let mut due = Vec::new();
            let mut finished = Vec::new();

            for (id, entry) in jobs.iter_mut() {
                if entry.paused || entry.next_run > now {
                    continue;
                }
                due.push((id.clone(), entry.job.clone()));
                match entry.trigger.fire_time_after(now) {
                    Some(next) => entry.next_run = next,
                    None => {
                        if let Trigger::Interval { .. } = entry.trigger {
                            tracing::warn!(
                                "Job {} ({}) has no occurrence after {}, removing it",
                                id,
                                entry.trigger,
                                now
                            );
                        }
                        finished.push(id.clone());
                    }
                }
            }

            for id in finished {
                jobs.remove(&id);
            }
            due
        };

        let mut fired = Vec::with_capacity(due.len());
        for (job_id, job) in due {
            tracing::debug!("Dispatching job {} for task '{}'", job_id, job.task_name());
            let dispatcher = self.dispatcher.clone();
            let id = job_id.clone();
            self.tracker.spawn(async move {
                dispatcher.dispatch(&id, job).await;
            });
            fired.push(job_id);
        }
        fired
    }

    /// Start the trigger evaluation loop
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!("Scheduler started (tick={:?})", scheduler.tick);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.run_pending(now()).await;
                    }
                    _ = shutdown.cancelled() => {
                        tracing::info!("Scheduler stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Stop the trigger loop and wait up to `grace` for in-flight runs
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                "Scheduler shutdown: {} runs still in flight after {:?}",
                self.tracker.len(),
                grace
            );
        }
    }
}

/// Current local wall-clock time, the reference for all schedules
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DeviceCredentials, GettersJob};
    use chrono::NaiveDate;
    use tokio::sync::mpsc;

    struct RecordingDispatcher {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl JobDispatcher for RecordingDispatcher {
        async fn dispatch(&self, job_id: &str, _job: JobSpec) {
            let _ = self.tx.send(job_id.to_string());
        }
    }

    fn scheduler() -> (Arc<Scheduler>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(Arc::new(RecordingDispatcher { tx }), Duration::from_millis(10));
        (scheduler, rx)
    }

    fn job(name: &str) -> JobSpec {
        JobSpec::Getters(GettersJob {
            task_name: name.to_string(),
            getters: vec!["get_facts".to_string()],
            credentials: DeviceCredentials {
                username: "admin".to_string(),
                password: "admin".to_string(),
            },
            targets: vec![],
        })
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[tokio::test]
    async fn test_once_fires_exactly_once() {
        let (scheduler, mut rx) = scheduler();
        scheduler.schedule_once("job-1", at(10, 0, 5), job("t"), false).await.unwrap();

        assert!(scheduler.run_pending(at(10, 0, 4)).await.is_empty());
        assert_eq!(scheduler.run_pending(at(10, 0, 5)).await, vec!["job-1"]);
        assert!(scheduler.run_pending(at(10, 0, 6)).await.is_empty());
        assert!(scheduler.run_pending(at(11, 0, 0)).await.is_empty());
        assert!(scheduler.job_info("job-1").await.is_none());

        assert_eq!(rx.recv().await.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn test_interval_fires_each_period() {
        let (scheduler, _rx) = scheduler();
        let period = chrono::Duration::seconds(60);
        scheduler.schedule_interval("job-2", at(10, 0, 0), period, job("t"), false).await.unwrap();

        assert!(scheduler.run_pending(at(9, 59, 59)).await.is_empty());
        assert_eq!(scheduler.run_pending(at(10, 0, 0)).await.len(), 1);
        assert_eq!(scheduler.job_info("job-2").await.unwrap().next_run, at(10, 1, 0));
        assert!(scheduler.run_pending(at(10, 0, 30)).await.is_empty());
        assert_eq!(scheduler.run_pending(at(10, 1, 0)).await.len(), 1);
        assert_eq!(scheduler.run_pending(at(10, 2, 0)).await.len(), 1);
        assert_eq!(scheduler.job_info("job-2").await.unwrap().next_run, at(10, 3, 0));
    }

    #[tokio::test]
    async fn test_missed_occurrences_coalesce() {
        let (scheduler, _rx) = scheduler();
        let period = chrono::Duration::seconds(60);
        scheduler.schedule_interval("job-3", at(10, 0, 0), period, job("t"), false).await.unwrap();

        assert_eq!(scheduler.run_pending(at(10, 5, 30)).await.len(), 1);
        assert_eq!(scheduler.job_info("job-3").await.unwrap().next_run, at(10, 6, 0));
    }

    #[tokio::test]
    async fn test_interval_beyond_calendar_fires_once_and_leaves() {
        let (scheduler, mut rx) = scheduler();
        let period = chrono::Duration::try_seconds(10_000_000_000_000).unwrap();
        scheduler.schedule_interval("huge", at(10, 0, 0), period, job("t"), false).await.unwrap();
        scheduler
            .schedule_interval("job-7", at(10, 0, 0), chrono::Duration::seconds(60), job("u"), false)
            .await
            .unwrap();

        let mut fired = scheduler.run_pending(at(10, 0, 0)).await;
        fired.sort();
        assert_eq!(fired, vec!["huge", "job-7"]);
        assert!(scheduler.job_info("huge").await.is_none());

        // the other job keeps firing
        assert_eq!(scheduler.run_pending(at(10, 1, 0)).await, vec!["job-7"]);
        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec!["huge", "job-7", "job-7"]);
    }

    #[tokio::test]
    async fn test_duplicate_job_rejected_unless_replace() {
        let (scheduler, _rx) = scheduler();
        scheduler.schedule_once("dup", at(10, 0, 0), job("a"), false).await.unwrap();

        let err = scheduler.schedule_once("dup", at(11, 0, 0), job("b"), false).await.unwrap_err();
        assert_eq!(err, SchedulerError::DuplicateJob("dup".to_string()));
        assert_eq!(scheduler.job_info("dup").await.unwrap().next_run, at(10, 0, 0));

        scheduler.schedule_once("dup", at(11, 0, 0), job("b"), true).await.unwrap();
        assert_eq!(scheduler.job_info("dup").await.unwrap().next_run, at(11, 0, 0));
    }

    #[tokio::test]
    async fn test_pause_suppresses_and_resume_restarts_from_next_occurrence() {
        let (scheduler, _rx) = scheduler();
        let period = chrono::Duration::seconds(60);
        scheduler.schedule_interval("job-4", at(10, 0, 0), period, job("t"), false).await.unwrap();

        scheduler.pause("job-4").await.unwrap();
        assert!(scheduler.run_pending(at(10, 0, 0)).await.is_empty());
        assert!(scheduler.run_pending(at(10, 1, 0)).await.is_empty());

        scheduler.resume_at("job-4", at(10, 1, 30)).await.unwrap();
        assert_eq!(scheduler.job_info("job-4").await.unwrap().next_run, at(10, 2, 0));
        assert!(scheduler.run_pending(at(10, 1, 45)).await.is_empty());
        assert_eq!(scheduler.run_pending(at(10, 2, 0)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_job_errors() {
        let (scheduler, _rx) = scheduler();
        assert_eq!(
            scheduler.pause("missing").await,
            Err(SchedulerError::UnknownJob("missing".to_string()))
        );
        assert!(scheduler.resume("missing").await.is_err());
        assert!(scheduler.cancel("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_removes_job() {
        let (scheduler, _rx) = scheduler();
        scheduler.schedule_once("job-5", at(10, 0, 0), job("t"), false).await.unwrap();
        scheduler.cancel("job-5").await.unwrap();
        assert!(scheduler.run_pending(at(12, 0, 0)).await.is_empty());
    }

    #[tokio::test]
    async fn test_loop_dispatches_due_jobs_and_shuts_down() {
        let (scheduler, mut rx) = scheduler();
        let past = now() - chrono::Duration::seconds(1);
        scheduler.schedule_once("job-6", past, job("t"), false).await.unwrap();
        scheduler.start();

        let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(fired.as_deref(), Some("job-6"));
        scheduler.shutdown(Duration::from_secs(1)).await;
    }
}
