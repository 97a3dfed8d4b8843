pub mod progress;
pub mod registry;

pub use progress::{Observation, ProgressEvent, ProgressObserver};
pub use registry::{Job, JobContext, JobRegistry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backup::summary::ChangeReport;
use crate::engine::{EngineOutput, TerminateError, LAUNCH_FAILURE_CODE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backup,
    Restore,
    /// Restore straight from a registered storage, keyed by storage id.
    StorageRestore,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Backup => write!(f, "backup"),
            JobKind::Restore => write!(f, "restore"),
            JobKind::StorageRestore => write!(f, "storage_restore"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Manual,
    #[serde(alias = "scheduler")]
    Scheduled,
}

impl Trigger {
    /// Lenient parse for API input; anything unknown counts as manual.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("scheduled") | Some("scheduler") => Trigger::Scheduled,
            _ => Trigger::Manual,
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Manual => write!(f, "manual"),
            Trigger::Scheduled => write!(f, "scheduled"),
        }
    }
}

/// Identity of a job slot: one active job per resource and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub resource: String,
    pub kind: JobKind,
}

impl JobKey {
    pub fn new(resource: impl Into<String>, kind: JobKind) -> Self {
        Self {
            resource: resource.into(),
            kind,
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.resource)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    /// Registered, engine process not spawned yet.
    Starting,
    /// An engine process is attached and can be cancelled.
    Running,
    /// Work returned; draining output and building the result.
    Finishing,
    Done,
}

/// What a job's work hands back to the registry.
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub change_summary: Option<ChangeReport>,
    pub restore_path: Option<String>,
}

impl JobOutcome {
    pub fn from_engine(output: EngineOutput) -> Self {
        Self {
            exit_code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
            ..Default::default()
        }
    }

    pub fn internal_failure(message: impl Into<String>) -> Self {
        Self {
            exit_code: LAUNCH_FAILURE_CODE,
            stderr: message.into(),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Terminal record of a finished job, kept until one observer picks it up.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub kind: JobKind,
    pub trigger: Trigger,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub change_summary: Option<ChangeReport>,
    pub restore_path: Option<String>,
}

impl JobResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.cancelled
    }

    pub fn final_output(&self) -> &str {
        if self.stdout.is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

/// Snapshot of a running job for status endpoints and the scheduler.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStatus {
    pub kind: JobKind,
    pub trigger: Trigger,
    pub phase: JobPhase,
    pub started_at: DateTime<Utc>,
    pub last_output: String,
    pub line_count: usize,
    pub cancel_requested: bool,
    pub pid: Option<u32>,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("a {} job is already running for {}", .0.kind, .0.resource)]
    Conflict(JobKey),

    #[error("no {} job is running for {}", .0.kind, .0.resource)]
    NoActiveJob(JobKey),

    #[error("the {} job for {} has no engine process to cancel yet", .0.kind, .0.resource)]
    NotCancellable(JobKey),

    #[error("failed to cancel the {} job for {}: {source}", key.kind, key.resource)]
    Terminate {
        key: JobKey,
        #[source]
        source: TerminateError,
    },
}

/// Last `max_chars` characters of `text`, on a char boundary.
pub fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
