mod command;
mod config_push;
mod getters;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::db::TaskRepository;
use crate::device::{ConnectionParams, DeviceConnector, DeviceError, SessionGuard};
use crate::models::*;
use crate::scheduler::JobDispatcher;
use crate::ws::{EventType, Hub, RunEventPayload};

use command::CommandAction;
use config_push::ConfigPushAction;
use getters::GettersAction;

/// Failures that abort a whole run before any device is contacted
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("script not found: {0}")]
    ScriptNotFound(String),
    #[error("repository error: {0:#}")]
    Repository(#[from] anyhow::Error),
}

/// Outcome of one committed run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub task_name: String,
    pub run_time: String,
    pub results: BTreeMap<String, String>,
}

/// Work applied to each target of a run
enum TargetAction {
    Command(CommandAction),
    ConfigPush(ConfigPushAction),
    Getters(GettersAction),
}

impl TargetAction {
    /// Open a session, run the action and render the outcome as log text
    fn run(&self, connector: &dyn DeviceConnector, params: &ConnectionParams) -> String {
        let session = match connector.open(params) {
            Ok(session) => session,
            Err(e) => return self.diagnostic(&e),
        };
        let mut session = SessionGuard::new(session);
        let outcome = match self {
            TargetAction::Command(action) => action.execute(&mut *session),
            TargetAction::ConfigPush(action) => action.execute(&mut *session),
            TargetAction::Getters(action) => action.execute(&mut *session),
        };
        outcome.unwrap_or_else(|e| self.diagnostic(&e))
    }

    fn diagnostic(&self, err: &DeviceError) -> String {
        match self {
            TargetAction::Command(_) => CommandAction::diagnostic(err),
            TargetAction::ConfigPush(_) => ConfigPushAction::diagnostic(err),
            TargetAction::Getters(_) => GettersAction::diagnostic(err),
        }
    }
}

/// Everything a run needs once the task and script are resolved
struct RunPlan {
    credentials: DeviceCredentials,
    targets: Vec<Target>,
    driver_override: Option<String>,
    delay_factor: f64,
    action: TargetAction,
}

impl RunPlan {
    fn new(job: &JobSpec, script: Option<&Script>) -> Result<Self, RunError> {
        let script_for = |name: &str| script.ok_or_else(|| RunError::ScriptNotFound(name.to_string()));
        let plan = match job {
            JobSpec::Command(args) => Self {
                credentials: args.credentials.clone(),
                targets: args.targets.clone(),
                driver_override: args.driver.clone().filter(|d| !d.is_empty()),
                delay_factor: args.delay_factor,
                action: TargetAction::Command(CommandAction::new(args.mode, script_for(&args.script_name)?)),
            },
            JobSpec::ConfigPush(args) => Self {
                credentials: args.credentials.clone(),
                targets: args.targets.clone(),
                driver_override: None,
                delay_factor: 1.0,
                action: TargetAction::ConfigPush(ConfigPushAction::new(
                    &args.action,
                    &script_for(&args.script_name)?.content,
                )),
            },
            JobSpec::Getters(args) => Self {
                credentials: args.credentials.clone(),
                targets: args.targets.clone(),
                driver_override: None,
                delay_factor: 1.0,
                action: TargetAction::Getters(GettersAction::new(&args.getters)),
            },
        };
        Ok(plan)
    }

    fn connection_params(&self, target: &Target) -> ConnectionParams {
        ConnectionParams {
            address: target.address.clone(),
            driver: self
                .driver_override
                .clone()
                .unwrap_or_else(|| target.driver.clone()),
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
            secret: target.secret.clone(),
            delay_factor: self.delay_factor,
        }
    }
}

/// JobExecutor runs a task's job against each of its targets and records
/// one log entry per run
pub struct JobExecutor {
    repo: Arc<dyn TaskRepository>,
    connector: Arc<dyn DeviceConnector>,
    ws_hub: Option<Arc<Hub>>,
    run_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobExecutor {
    pub fn new(
        repo: Arc<dyn TaskRepository>,
        connector: Arc<dyn DeviceConnector>,
        ws_hub: Option<Arc<Hub>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            connector,
            ws_hub,
            run_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Run the job now, keyed by the current local time
    pub async fn run(&self, job: &JobSpec) -> Result<RunReport, RunError> {
        self.run_at(job, current_run_time()).await
    }

    async fn run_at(&self, job: &JobSpec, run_time: String) -> Result<RunReport, RunError> {
        let lock = self.run_lock(job.task_name());
        let outcome = {
            let _running = lock.lock().await;
            self.run_locked(job, run_time).await
        };
        self.release_run_lock(job.task_name(), lock);
        outcome
    }

    async fn run_locked(&self, job: &JobSpec, run_time: String) -> Result<RunReport, RunError> {
        let task_name = job.task_name().to_string();
        let task = self
            .repo
            .find_task_by_name(&task_name)
            .await?
            .ok_or_else(|| RunError::TaskNotFound(task_name.clone()))?;

        let script = match job.script_name() {
            Some(script_name) => Some(
                self.repo
                    .find_script_by_name(script_name)
                    .await?
                    .ok_or_else(|| RunError::ScriptNotFound(script_name.to_string()))?,
            ),
            None => None,
        };

        let plan = Arc::new(RunPlan::new(job, script.as_ref())?);
        let mut results = BTreeMap::new();

        for index in 0..plan.targets.len() {
            let target_name = plan.targets[index].name.clone();
            let connector = self.connector.clone();
            let worker_plan = plan.clone();

            let result = tokio::task::spawn_blocking(move || {
                let params = worker_plan.connection_params(&worker_plan.targets[index]);
                worker_plan.action.run(connector.as_ref(), &params)
            })
            .await
            .unwrap_or_else(|e| format!("device worker failed: {}", e));

            tracing::debug!("Task '{}' run {}: target {} done", task_name, run_time, target_name);
            results.insert(target_name, result);
        }

        self.repo.append_run(&task, &run_time, &results).await?;

        Ok(RunReport {
            task_name,
            run_time,
            results,
        })
    }

    fn run_lock(&self, task_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.run_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(task_name.to_string()).or_default().clone()
    }

    /// Drop the task's lock once no other run holds or awaits it
    fn release_run_lock(&self, task_name: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.run_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let idle = locks
            .get(task_name)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(task_name);
        }
    }
}

fn current_run_time() -> String {
    crate::scheduler::now().format(TIMESTAMP_FORMAT).to_string()
}

#[async_trait]
impl JobDispatcher for JobExecutor {
    async fn dispatch(&self, job_id: &str, job: JobSpec) {
        let run_time = current_run_time();
        let (event_type, payload) = match self.run_at(&job, run_time.clone()).await {
            Ok(report) => {
                tracing::info!(
                    "Job {} for task '{}' finished: {} target(s)",
                    job_id,
                    report.task_name,
                    report.results.len()
                );
                (
                    EventType::TaskRunCompleted,
                    RunEventPayload {
                        task: report.task_name,
                        run_time: report.run_time,
                        results: Some(report.results),
                        error: None,
                    },
                )
            }
            Err(e) => {
                tracing::error!("Job {} for task '{}' failed: {}", job_id, job.task_name(), e);
                (
                    EventType::TaskRunFailed,
                    RunEventPayload {
                        task: job.task_name().to_string(),
                        run_time,
                        results: None,
                        error: Some(e.to_string()),
                    },
                )
            }
        };

        if let Some(ref hub) = self.ws_hub {
            hub.broadcast_run(event_type, payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::device::testing::{FakeConnector, FakeDevice};
    use chrono::Utc;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn target(name: &str, address: &str) -> Target {
        Target {
            name: name.to_string(),
            address: address.to_string(),
            driver: "ios".to_string(),
            secret: "enable".to_string(),
        }
    }

    fn credentials() -> DeviceCredentials {
        DeviceCredentials {
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }

    fn command_job(task_name: &str, mode: CommandMode, targets: Vec<Target>) -> JobSpec {
        JobSpec::Command(CommandJob {
            task_name: task_name.to_string(),
            mode,
            script_name: "script".to_string(),
            credentials: credentials(),
            targets,
            driver: None,
            delay_factor: 1.0,
        })
    }

    async fn store_task(store: &Store, job: &JobSpec) {
        let targets = match job {
            JobSpec::Command(args) => args.targets.clone(),
            JobSpec::ConfigPush(args) => args.targets.clone(),
            JobSpec::Getters(args) => args.targets.clone(),
        };
        let now = Utc::now();
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            name: job.task_name().to_string(),
            kind: job.kind(),
            recurrent: false,
            frequency: None,
            scheduled_date: Some("2024-06-01 10:00:00".to_string()),
            status: TaskStatus::Active,
            creation_time: format!("2024-06-01 09:59:59.{:06}", job.task_name().len()),
            creator: "admin".to_string(),
            script: job.script_name().map(str::to_string),
            targets,
            job: job.clone(),
            logs: RunLogs::new(),
            created_at: now,
            updated_at: now,
        };
        store.create_task(&task).await.unwrap();
    }

    fn executor(store: &Store, connector: &FakeConnector) -> Arc<JobExecutor> {
        JobExecutor::new(Arc::new(store.clone()), Arc::new(connector.clone()), None)
    }

    #[tokio::test]
    async fn test_show_commands_logged_per_target() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_script("script", "show version").await.unwrap();
        let connector = FakeConnector::default();
        connector.add("10.0.0.1", FakeDevice::default().with_output("show version", "IOS 15.2"));

        let job = command_job("version", CommandMode::Show, vec![target("r1", "10.0.0.1")]);
        store_task(&store, &job).await;

        let report = assert_ok!(executor(&store, &connector).run(&job).await);
        assert_eq!(report.results["r1"], "IOS 15.2");

        let task = store.get_task_by_name("version").await.unwrap().unwrap();
        assert_eq!(task.logs.len(), 1);
        assert_eq!(task.logs[&report.run_time]["r1"], "IOS 15.2");
    }

    #[tokio::test]
    async fn test_show_outputs_joined_with_blank_line() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_script("script", "show version\nshow clock").await.unwrap();
        let connector = FakeConnector::default();
        connector.add(
            "10.0.0.1",
            FakeDevice::default()
                .with_output("show version", "IOS 15.2")
                .with_output("show clock", "10:00:00"),
        );

        let job = command_job("two-commands", CommandMode::Show, vec![target("r1", "10.0.0.1")]);
        store_task(&store, &job).await;

        let report = executor(&store, &connector).run(&job).await.unwrap();
        assert_eq!(report.results["r1"], "IOS 15.2\n\n10:00:00");
    }

    #[tokio::test]
    async fn test_connection_failure_is_logged_and_committed() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_script("script", "show version").await.unwrap();
        let connector = FakeConnector::default();
        connector.add("10.0.0.1", FakeDevice::unreachable("TCP connection failed: timed out"));

        let job = command_job("unreachable", CommandMode::Show, vec![target("r1", "10.0.0.1")]);
        store_task(&store, &job).await;

        let report = executor(&store, &connector).run(&job).await.unwrap();
        assert!(report.results["r1"].contains("timed out"));

        let task = store.get_task_by_name("unreachable").await.unwrap().unwrap();
        assert!(task.logs[&report.run_time]["r1"].contains("timed out"));
        assert!(connector.journal.lock().unwrap().closed.is_empty());
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_remaining_targets() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_script("script", "show version").await.unwrap();
        let connector = FakeConnector::default();
        connector.add("10.0.0.1", FakeDevice::unreachable("refused"));
        connector.add("10.0.0.2", FakeDevice::default().with_output("show version", "EOS 4.30"));
        connector.add("10.0.0.3", FakeDevice::default());

        let job = command_job(
            "mixed",
            CommandMode::Show,
            vec![target("A", "10.0.0.1"), target("B", "10.0.0.2"), target("C", "10.0.0.3")],
        );
        store_task(&store, &job).await;

        let report = executor(&store, &connector).run(&job).await.unwrap();
        let keys: Vec<&str> = report.results.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["A", "B", "C"]);
        assert!(report.results["A"].contains("refused"));
        assert_eq!(report.results["B"], "EOS 4.30");
        assert!(report.results["C"].contains("Invalid input"));

        // Every opened session was closed, including the failing one
        let journal = connector.journal.lock().unwrap();
        assert_eq!(journal.closed, vec!["10.0.0.2", "10.0.0.3"]);
    }

    #[tokio::test]
    async fn test_configuration_mode_sends_lines() {
        let store = Store::in_memory().await.unwrap();
        store
            .upsert_script("script", "interface Loopback0\n description managed\n")
            .await
            .unwrap();
        let connector = FakeConnector::default();
        connector.add("10.0.0.1", FakeDevice::default());

        let job = command_job("configure", CommandMode::Configuration, vec![target("r1", "10.0.0.1")]);
        store_task(&store, &job).await;

        let report = executor(&store, &connector).run(&job).await.unwrap();
        assert_eq!(report.results["r1"], CONFIGURATION_OK);
        assert_eq!(
            connector.journal.lock().unwrap().config_lines,
            vec!["interface Loopback0", " description managed"]
        );
    }

    #[tokio::test]
    async fn test_driver_override_applies_to_every_target() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_script("script", "show version").await.unwrap();
        let connector = FakeConnector::default();
        connector.add("10.0.0.1", FakeDevice::default().with_output("show version", "ok"));

        let job = JobSpec::Command(CommandJob {
            task_name: "override".to_string(),
            mode: CommandMode::Show,
            script_name: "script".to_string(),
            credentials: credentials(),
            targets: vec![target("r1", "10.0.0.1")],
            driver: Some("eos".to_string()),
            delay_factor: 2.0,
        });
        store_task(&store, &job).await;

        executor(&store, &connector).run(&job).await.unwrap();
        let journal = connector.journal.lock().unwrap();
        assert_eq!(journal.opened[0].driver, "eos");
        assert_eq!(journal.opened[0].delay_factor, 2.0);
        assert_eq!(journal.opened[0].secret, "enable");
    }

    #[tokio::test]
    async fn test_missing_task_writes_nothing() {
        let store = Store::in_memory().await.unwrap();
        let connector = FakeConnector::default();

        let job = command_job("ghost", CommandMode::Show, vec![target("r1", "10.0.0.1")]);
        let err = assert_err!(executor(&store, &connector).run(&job).await);
        assert!(matches!(err, RunError::TaskNotFound(ref name) if name == "ghost"));
        assert!(connector.journal.lock().unwrap().opened.is_empty());
    }

    #[tokio::test]
    async fn test_missing_script_writes_nothing() {
        let store = Store::in_memory().await.unwrap();
        let connector = FakeConnector::default();
        connector.add("10.0.0.1", FakeDevice::default());

        let job = command_job("no-script", CommandMode::Show, vec![target("r1", "10.0.0.1")]);
        store_task(&store, &job).await;

        let err = executor(&store, &connector).run(&job).await.unwrap_err();
        assert!(matches!(err, RunError::ScriptNotFound(ref name) if name == "script"));

        let task = store.get_task_by_name("no-script").await.unwrap().unwrap();
        assert!(task.logs.is_empty());
        assert!(connector.journal.lock().unwrap().opened.is_empty());
    }

    #[tokio::test]
    async fn test_run_without_targets_is_recorded() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_script("script", "show version").await.unwrap();
        let connector = FakeConnector::default();

        let job = command_job("empty", CommandMode::Show, Vec::new());
        store_task(&store, &job).await;

        let report = executor(&store, &connector).run(&job).await.unwrap();
        let task = store.get_task_by_name("empty").await.unwrap().unwrap();
        assert!(task.logs[&report.run_time].is_empty());
    }

    #[tokio::test]
    async fn test_config_push_merges_and_commits() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_script("script", "hostname edge-1").await.unwrap();
        let connector = FakeConnector::default();
        connector.add("10.0.0.1", FakeDevice::default());
        connector.add(
            "10.0.0.2",
            FakeDevice {
                reject_commit: true,
                ..Default::default()
            },
        );

        let job = JobSpec::ConfigPush(ConfigPushJob {
            task_name: "push".to_string(),
            script_name: "script".to_string(),
            credentials: credentials(),
            targets: vec![target("r1", "10.0.0.1"), target("r2", "10.0.0.2")],
            action: "load_merge_candidate".to_string(),
        });
        store_task(&store, &job).await;

        let report = executor(&store, &connector).run(&job).await.unwrap();
        assert_eq!(report.results["r1"], CONFIGURATION_OK);
        assert!(report.results["r2"].contains("Commit rejected"));

        let journal = connector.journal.lock().unwrap();
        let r1_actions: Vec<&str> = journal
            .invoked
            .iter()
            .filter(|(address, _)| address == "10.0.0.1")
            .map(|(_, action)| action.as_str())
            .collect();
        assert_eq!(r1_actions, vec!["load_merge_candidate", "commit_config"]);
    }

    #[tokio::test]
    async fn test_config_push_other_action_invoked_without_config() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_script("script", "").await.unwrap();
        let connector = FakeConnector::default();
        connector.add("10.0.0.1", FakeDevice::default());

        let job = JobSpec::ConfigPush(ConfigPushJob {
            task_name: "rollback".to_string(),
            script_name: "script".to_string(),
            credentials: credentials(),
            targets: vec![target("r1", "10.0.0.1")],
            action: "rollback".to_string(),
        });
        store_task(&store, &job).await;

        let report = executor(&store, &connector).run(&job).await.unwrap();
        assert_eq!(report.results["r1"], CONFIGURATION_OK);
        assert_eq!(connector.journal.lock().unwrap().invoked.len(), 1);
    }

    #[tokio::test]
    async fn test_getters_aggregated_per_device() {
        let store = Store::in_memory().await.unwrap();
        let connector = FakeConnector::default();
        connector.add(
            "10.0.0.1",
            FakeDevice::default().with_getter("get_facts", json!({"hostname": "r1", "uptime": 42})),
        );
        connector.add("10.0.0.2", FakeDevice::unreachable("no route to host"));

        let job = JobSpec::Getters(GettersJob {
            task_name: "facts".to_string(),
            getters: vec!["get_facts".to_string(), "get_bgp_neighbors".to_string()],
            credentials: credentials(),
            targets: vec![target("r1", "10.0.0.1"), target("r2", "10.0.0.2")],
        });
        store_task(&store, &job).await;

        let report = executor(&store, &connector).run(&job).await.unwrap();
        let r1: serde_json::Value = serde_json::from_str(&report.results["r1"]).unwrap();
        assert_eq!(r1["get_facts"]["hostname"], "r1");
        assert!(r1["get_bgp_neighbors"].as_str().unwrap().contains("could not be retrieved"));
        assert!(report.results["r2"].contains("no route to host"));
    }

    #[tokio::test]
    async fn test_run_locks_released_after_runs() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_script("script", "show version").await.unwrap();
        let connector = FakeConnector::default();
        connector.add(
            "10.0.0.1",
            FakeDevice::default()
                .with_output("show version", "IOS 15.2")
                .with_open_delay(std::time::Duration::from_millis(50)),
        );

        let job = command_job("locked", CommandMode::Show, vec![target("r1", "10.0.0.1")]);
        store_task(&store, &job).await;
        let executor = executor(&store, &connector);

        let (first, second) = tokio::join!(executor.run(&job), executor.run(&job));
        assert_ok!(first);
        assert_ok!(second);
        assert!(executor.run_locks.lock().unwrap().is_empty());

        let ghost = command_job("deleted", CommandMode::Show, Vec::new());
        assert_err!(executor.run(&ghost).await);
        assert!(executor.run_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_publishes_run_outcome() {
        let store = Store::in_memory().await.unwrap();
        let connector = FakeConnector::default();
        let hub = Arc::new(Hub::new());
        let mut events = hub.test_client().await;
        let executor = JobExecutor::new(Arc::new(store.clone()), Arc::new(connector), Some(hub));

        executor
            .dispatch("2024-06-01 09:59:59.000001", command_job("ghost", CommandMode::Show, Vec::new()))
            .await;

        let msg = events.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(json["type"], "task_run_failed");
        assert_eq!(json["payload"]["error"], "task not found: ghost");
    }
}
