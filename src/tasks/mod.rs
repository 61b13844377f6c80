use chrono::{NaiveDateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::db::{NotFoundError, Store};
use crate::models::*;
use crate::scheduler::{self, Scheduler, SchedulerError};
use crate::utils::is_valid_device_address;
use crate::ws::{EventType, Hub};

/// Errors returned by task lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid scheduled date '{0}': expected DD/MM/YYYY HH:MM:SS")]
    InvalidScheduledDate(String),
    #[error("invalid frequency '{0}': expected 1 to {} seconds", MAX_FREQUENCY_SECS)]
    InvalidFrequency(String),
    #[error("a task named '{0}' already exists")]
    NameTaken(String),
    #[error("{0}")]
    Validation(String),
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("scheduling failed: {0}")]
    Scheduling(#[from] SchedulerError),
    #[error(transparent)]
    Repository(#[from] anyhow::Error),
}

/// How far after creation a task starts when no date is given
#[derive(Debug, Clone, Copy)]
pub struct StartDelays {
    pub one_time: chrono::Duration,
    pub recurring: chrono::Duration,
}

impl Default for StartDelays {
    fn default() -> Self {
        Self {
            one_time: chrono::Duration::seconds(5),
            recurring: chrono::Duration::seconds(40),
        }
    }
}

/// Parse a user-supplied `DD/MM/YYYY HH:MM:SS` date; empty means "not given"
pub fn parse_scheduled_date(input: &str) -> Result<Option<NaiveDateTime>, TaskError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }
    NaiveDateTime::parse_from_str(input, INPUT_DATE_FORMAT)
        .map(Some)
        .map_err(|_| TaskError::InvalidScheduledDate(input.to_string()))
}

/// Longest accepted period between runs (ten years)
pub const MAX_FREQUENCY_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Largest multiplier applied to the SSH I/O timeout
pub const MAX_DELAY_FACTOR: f64 = 100.0;

/// Parse a frequency in seconds; empty means a one-time task
pub fn parse_frequency(input: &str) -> Result<Option<u64>, TaskError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }
    match input.parse::<u64>() {
        Ok(seconds) if (1..=MAX_FREQUENCY_SECS).contains(&seconds) => Ok(Some(seconds)),
        _ => Err(TaskError::InvalidFrequency(input.to_string())),
    }
}

fn frequency_period(seconds: u64) -> Result<chrono::Duration, TaskError> {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| TaskError::InvalidFrequency(seconds.to_string()))
}

/// Job payload registered for a task; depends only on its kind and parameters
pub fn build_job(task_name: &str, requester: &Requester, targets: &[Target], params: &TaskParams) -> JobSpec {
    let credentials = DeviceCredentials {
        username: requester.username.clone(),
        password: requester.password.clone(),
    };
    match params {
        TaskParams::CommandExecution {
            script,
            mode,
            driver,
            delay_factor,
        } => JobSpec::Command(CommandJob {
            task_name: task_name.to_string(),
            mode: *mode,
            script_name: script.clone(),
            credentials,
            targets: targets.to_vec(),
            driver: driver.clone().filter(|d| !d.trim().is_empty()),
            delay_factor: *delay_factor,
        }),
        TaskParams::ConfigurationPush { script, action } => JobSpec::ConfigPush(ConfigPushJob {
            task_name: task_name.to_string(),
            script_name: script.clone(),
            credentials,
            targets: targets.to_vec(),
            action: action.clone(),
        }),
        TaskParams::GetterRetrieval { getters } => JobSpec::Getters(GettersJob {
            task_name: task_name.to_string(),
            getters: getters.clone(),
            credentials,
            targets: targets.to_vec(),
        }),
    }
}

fn validate(req: &CreateTaskRequest, targets: &[Target]) -> Result<(), TaskError> {
    if req.name.trim().is_empty() {
        return Err(TaskError::Validation("task name is required".to_string()));
    }
    if targets.is_empty() {
        return Err(TaskError::Validation("at least one target is required".to_string()));
    }

    let mut seen = HashSet::new();
    for target in targets {
        if target.name.trim().is_empty() {
            return Err(TaskError::Validation("target name is required".to_string()));
        }
        if !seen.insert(target.name.as_str()) {
            return Err(TaskError::Validation(format!("duplicate target name: {}", target.name)));
        }
        if !is_valid_device_address(&target.address) {
            return Err(TaskError::Validation(format!(
                "invalid address for target {}: {}",
                target.name, target.address
            )));
        }
    }

    match &req.params {
        TaskParams::CommandExecution {
            script, delay_factor, ..
        } => {
            if script.trim().is_empty() {
                return Err(TaskError::Validation("script is required".to_string()));
            }
            if !(*delay_factor > 0.0 && *delay_factor <= MAX_DELAY_FACTOR) {
                return Err(TaskError::Validation(format!(
                    "delay_factor must be greater than 0 and at most {}",
                    MAX_DELAY_FACTOR
                )));
            }
        }
        TaskParams::ConfigurationPush { script, action } => {
            if script.trim().is_empty() || action.trim().is_empty() {
                return Err(TaskError::Validation("script and action are required".to_string()));
            }
        }
        TaskParams::GetterRetrieval { getters } => {
            if getters.is_empty() {
                return Err(TaskError::Validation("at least one getter is required".to_string()));
            }
            if getters.iter().any(|g| g.trim().is_empty()) {
                return Err(TaskError::Validation("getter names must not be blank".to_string()));
            }
        }
    }
    Ok(())
}

fn not_found_to_task_error(err: anyhow::Error, name: &str) -> TaskError {
    if err.downcast_ref::<NotFoundError>().is_some() {
        TaskError::NotFound(name.to_string())
    } else {
        TaskError::Repository(err)
    }
}

/// TaskService owns task creation and the active/suspended lifecycle,
/// keeping the store and the scheduler in step
pub struct TaskService {
    store: Store,
    scheduler: Arc<Scheduler>,
    ws_hub: Option<Arc<Hub>>,
    delays: StartDelays,
}

impl TaskService {
    pub fn new(store: Store, scheduler: Arc<Scheduler>, ws_hub: Option<Arc<Hub>>, delays: StartDelays) -> Self {
        Self {
            store,
            scheduler,
            ws_hub,
            delays,
        }
    }

    /// Create, persist and schedule a task
    pub async fn create_task(
        &self,
        requester: &Requester,
        targets: Vec<Target>,
        req: CreateTaskRequest,
    ) -> Result<Task, TaskError> {
        self.create_task_at(requester, targets, req, scheduler::now()).await
    }

    async fn create_task_at(
        &self,
        requester: &Requester,
        targets: Vec<Target>,
        req: CreateTaskRequest,
        now: NaiveDateTime,
    ) -> Result<Task, TaskError> {
        validate(&req, &targets)?;
        let frequency = parse_frequency(&req.frequency)?;
        let requested_start = parse_scheduled_date(&req.scheduled_date)?;

        let name = req.name.trim().to_string();
        if self.store.get_task_by_name(&name).await?.is_some() {
            return Err(TaskError::NameTaken(name));
        }

        let start = requested_start.unwrap_or_else(|| match frequency {
            Some(_) => now + self.delays.recurring,
            None => now + self.delays.one_time,
        });

        let job = build_job(&name, requester, &targets, &req.params);
        let created_at = Utc::now();
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.clone(),
            kind: job.kind(),
            recurrent: frequency.is_some(),
            frequency,
            scheduled_date: Some(start.format(SCHEDULED_DATE_FORMAT).to_string()),
            status: TaskStatus::Active,
            creation_time: now.format(TIMESTAMP_FORMAT).to_string(),
            creator: requester.username.clone(),
            script: job.script_name().map(str::to_string),
            targets,
            job,
            logs: RunLogs::new(),
            created_at,
            updated_at: created_at,
        };

        self.store.create_task(&task).await?;

        if let Err(e) = self.register(&task, start).await {
            tracing::error!("Failed to schedule task '{}': {}", task.name, e);
            if let Err(cleanup) = self.store.delete_task(&task.name).await {
                tracing::warn!("Failed to remove unscheduled task '{}': {}", task.name, cleanup);
            }
            return Err(e);
        }

        tracing::info!(
            "Created {} task '{}' by {} starting at {}",
            task.kind.as_str(),
            task.name,
            task.creator,
            start
        );
        self.broadcast(EventType::TaskCreated, &task).await;
        Ok(task)
    }

    async fn register(&self, task: &Task, start: NaiveDateTime) -> Result<(), TaskError> {
        match task.frequency {
            Some(seconds) => {
                let period = frequency_period(seconds)?;
                self.scheduler
                    .schedule_interval(&task.creation_time, start, period, task.job.clone(), false)
                    .await?;
            }
            None => {
                self.scheduler
                    .schedule_once(&task.creation_time, start, task.job.clone(), false)
                    .await?;
            }
        }
        Ok(())
    }

    /// Stop future runs of a task, keeping it and its logs
    pub async fn pause_task(&self, task: &mut Task) -> Result<(), TaskError> {
        self.scheduler.pause(&task.creation_time).await?;
        self.set_status(task, TaskStatus::Suspended).await
    }

    /// Re-enable future runs of a suspended task
    pub async fn resume_task(&self, task: &mut Task) -> Result<(), TaskError> {
        self.scheduler.resume(&task.creation_time).await?;
        self.set_status(task, TaskStatus::Active).await
    }

    async fn set_status(&self, task: &mut Task, status: TaskStatus) -> Result<(), TaskError> {
        task.status = status;
        task.updated_at = Utc::now();
        self.store
            .update_task_status(task)
            .await
            .map_err(|e| not_found_to_task_error(e, &task.name))?;
        tracing::info!("Task '{}' is now {}", task.name, status.as_str());

        let event_type = match status {
            TaskStatus::Active => EventType::TaskResumed,
            TaskStatus::Suspended => EventType::TaskPaused,
        };
        self.broadcast(event_type, task).await;
        Ok(())
    }

    /// Cancel a task's job and delete the task with its logs
    pub async fn delete_task(&self, name: &str) -> Result<(), TaskError> {
        let task = self.get_task(name).await?;

        match self.scheduler.cancel(&task.creation_time).await {
            Ok(()) => {}
            // one-shot jobs leave the scheduler once they have fired
            Err(SchedulerError::UnknownJob(_)) => {
                tracing::debug!("Task '{}' had no scheduled job left", name);
            }
            Err(e) => return Err(e.into()),
        }

        self.store
            .delete_task(name)
            .await
            .map_err(|e| not_found_to_task_error(e, name))?;
        tracing::info!("Deleted task '{}'", name);
        self.broadcast(EventType::TaskDeleted, &task).await;
        Ok(())
    }

    pub async fn get_task(&self, name: &str) -> Result<Task, TaskError> {
        self.store
            .get_task_by_name(name)
            .await?
            .ok_or_else(|| TaskError::NotFound(name.to_string()))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>, TaskError> {
        Ok(self.store.list_tasks().await?)
    }

    /// Next fire time of the task's job, if it is scheduled and not paused
    pub async fn next_run(&self, task: &Task) -> Option<String> {
        self.scheduler
            .job_info(&task.creation_time)
            .await
            .and_then(|info| info.next_run_display())
    }

    /// Re-register persisted tasks after a restart.
    ///
    /// Recurring tasks are always restored; one-time tasks only if they never
    /// ran. Suspended tasks come back paused. Returns how many were scheduled.
    pub async fn restore_tasks(&self) -> Result<usize, TaskError> {
        let now = scheduler::now();
        let mut restored = 0;

        for task in self.store.list_tasks().await? {
            if !task.recurrent && !task.logs.is_empty() {
                continue;
            }

            let start = task
                .scheduled_date
                .as_deref()
                .and_then(|date| NaiveDateTime::parse_from_str(date, SCHEDULED_DATE_FORMAT).ok())
                .unwrap_or_else(|| now + self.delays.one_time);

            if let Err(e) = self.register(&task, start).await {
                tracing::warn!("Could not restore task '{}': {}", task.name, e);
                continue;
            }
            if task.status == TaskStatus::Suspended {
                if let Err(e) = self.scheduler.pause(&task.creation_time).await {
                    tracing::warn!("Could not pause restored task '{}': {}", task.name, e);
                }
            }
            restored += 1;
        }

        tracing::info!("Restored {} scheduled tasks", restored);
        Ok(restored)
    }

    async fn broadcast(&self, event_type: EventType, task: &Task) {
        if let Some(ref hub) = self.ws_hub {
            hub.broadcast_task_update(event_type, &task.name, task.status.as_str())
                .await;
        }
    }
}
