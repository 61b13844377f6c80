use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Canonical storage format for scheduled dates
pub const SCHEDULED_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format accepted from users when submitting a scheduled date
pub const INPUT_DATE_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Format of creation times and run keys (microsecond precision)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Fixed result text for successful configuration changes
pub const CONFIGURATION_OK: &str = "configuration OK";

/// Run logs: run timestamp -> target name -> result text
pub type RunLogs = BTreeMap<String, BTreeMap<String, String>>;

/// The kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CommandExecution,
    ConfigurationPush,
    GetterRetrieval,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::CommandExecution => "command_execution",
            TaskKind::ConfigurationPush => "configuration_push",
            TaskKind::GetterRetrieval => "getter_retrieval",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "command_execution" => Some(TaskKind::CommandExecution),
            "configuration_push" => Some(TaskKind::ConfigurationPush),
            "getter_retrieval" => Some(TaskKind::GetterRetrieval),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Suspended,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TaskStatus::Active),
            "suspended" => Some(TaskStatus::Suspended),
            _ => None,
        }
    }
}

/// A device targeted by a task
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub address: String,
    pub driver: String,
    #[serde(default)]
    pub secret: String,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}

/// Device login used for every target of a task
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Whether a command task pushes configuration or runs show commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandMode {
    #[default]
    Show,
    Configuration,
}

/// Arguments of a command-execution run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandJob {
    pub task_name: String,
    pub mode: CommandMode,
    pub script_name: String,
    pub credentials: DeviceCredentials,
    pub targets: Vec<Target>,
    /// Overrides every target's driver when set
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default = "default_delay_factor")]
    pub delay_factor: f64,
}

/// Arguments of a configuration-push run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPushJob {
    pub task_name: String,
    pub script_name: String,
    pub credentials: DeviceCredentials,
    pub targets: Vec<Target>,
    pub action: String,
}

/// Arguments of a getter-retrieval run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GettersJob {
    pub task_name: String,
    pub getters: Vec<String>,
    pub credentials: DeviceCredentials,
    pub targets: Vec<Target>,
}

/// Typed job payload registered with the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    Command(CommandJob),
    ConfigPush(ConfigPushJob),
    Getters(GettersJob),
}

impl JobSpec {
    pub fn task_name(&self) -> &str {
        match self {
            JobSpec::Command(job) => &job.task_name,
            JobSpec::ConfigPush(job) => &job.task_name,
            JobSpec::Getters(job) => &job.task_name,
        }
    }

    pub fn script_name(&self) -> Option<&str> {
        match self {
            JobSpec::Command(job) => Some(&job.script_name),
            JobSpec::ConfigPush(job) => Some(&job.script_name),
            JobSpec::Getters(_) => None,
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            JobSpec::Command(_) => TaskKind::CommandExecution,
            JobSpec::ConfigPush(_) => TaskKind::ConfigurationPush,
            JobSpec::Getters(_) => TaskKind::GetterRetrieval,
        }
    }
}

/// Task is a named, schedulable unit of device automation work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub kind: TaskKind,
    pub recurrent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<String>,
    pub status: TaskStatus,
    pub creation_time: String,
    pub creator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    pub targets: Vec<Target>,
    pub job: JobSpec,
    #[serde(default)]
    pub logs: RunLogs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Script holds the command lines or configuration run by a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    pub content: String,
}

/// The user submitting a task; their login is used on the devices
#[derive(Clone, Deserialize)]
pub struct Requester {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requester")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

fn default_delay_factor() -> f64 {
    1.0
}

/// Kind-specific parameters of a task creation request
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskParams {
    CommandExecution {
        script: String,
        #[serde(default)]
        mode: CommandMode,
        #[serde(default)]
        driver: Option<String>,
        #[serde(default = "default_delay_factor")]
        delay_factor: f64,
    },
    ConfigurationPush {
        script: String,
        action: String,
    },
    GetterRetrieval {
        getters: Vec<String>,
    },
}

/// CreateTaskRequest carries the user-submitted task parameters
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    /// Interval in seconds; empty for one-time tasks
    #[serde(default)]
    pub frequency: String,
    /// `DD/MM/YYYY HH:MM:SS`; empty to use the default start
    #[serde(default)]
    pub scheduled_date: String,
    #[serde(flatten)]
    pub params: TaskParams,
}

/// Target as exposed by the API (no secret)
#[derive(Debug, Clone, Serialize)]
pub struct TargetView {
    pub name: String,
    pub address: String,
    pub driver: String,
}

/// Task as exposed by the API (no credentials or job payload)
#[derive(Debug, Clone, Serialize)]
pub struct TaskResponse {
    pub id: String,
    pub name: String,
    pub kind: TaskKind,
    pub recurrent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_date: Option<String>,
    pub status: TaskStatus,
    pub creation_time: String,
    pub creator: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    pub targets: Vec<TargetView>,
    pub run_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskResponse {
    pub fn new(task: &Task, next_run: Option<String>) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            kind: task.kind,
            recurrent: task.recurrent,
            frequency: task.frequency,
            scheduled_date: task.scheduled_date.clone(),
            status: task.status,
            creation_time: task.creation_time.clone(),
            creator: task.creator.clone(),
            script: task.script.clone(),
            targets: task
                .targets
                .iter()
                .map(|t| TargetView {
                    name: t.name.clone(),
                    address: t.address.clone(),
                    driver: t.driver.clone(),
                })
                .collect(),
            run_count: task.logs.len(),
            next_run,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}
