use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{ActiveStatus, JobError, JobKey, JobOutcome, JobPhase, JobResult, Trigger};
use crate::engine::{LineSink, ProcessHandle, TerminateError, Termination};

pub const CANCEL_NOTICE: &str = "Cancellation requested by user...";

/// One in-flight operation.
///
/// Output lines are append-only; observers read them through a cursor.
#[derive(Debug)]
pub struct Job {
    key: JobKey,
    trigger: Trigger,
    started_at: DateTime<Utc>,
    state: Mutex<JobState>,
}

#[derive(Debug)]
struct JobState {
    phase: JobPhase,
    lines: Vec<String>,
    last_output: String,
    cancel_requested: bool,
    process: Option<ProcessHandle>,
}

impl Job {
    fn new(key: JobKey, trigger: Trigger) -> Self {
        Self {
            key,
            trigger,
            started_at: Utc::now(),
            state: Mutex::new(JobState {
                phase: JobPhase::Starting,
                lines: Vec::new(),
                last_output: "Starting...".to_string(),
                cancel_requested: false,
                process: None,
            }),
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn phase(&self) -> JobPhase {
        self.state.lock().phase
    }

    pub fn cancel_requested(&self) -> bool {
        self.state.lock().cancel_requested
    }

    pub fn line_count(&self) -> usize {
        self.state.lock().lines.len()
    }

    /// Lines appended at or after `cursor`.
    pub fn lines_since(&self, cursor: usize) -> Vec<String> {
        let state = self.state.lock();
        state.lines.get(cursor..).map(<[String]>::to_vec).unwrap_or_default()
    }

    pub fn status(&self) -> ActiveStatus {
        let state = self.state.lock();
        ActiveStatus {
            kind: self.key.kind,
            trigger: self.trigger,
            phase: state.phase,
            started_at: self.started_at,
            last_output: state.last_output.clone(),
            line_count: state.lines.len(),
            cancel_requested: state.cancel_requested,
            pid: state.process.as_ref().and_then(ProcessHandle::pid),
        }
    }

    fn push_line(&self, line: String) {
        let mut state = self.state.lock();
        if !line.trim().is_empty() {
            state.last_output = line.trim().to_string();
        }
        state.lines.push(line);
    }

    fn set_phase(&self, phase: JobPhase) {
        self.state.lock().phase = phase;
    }
}

/// Handed to a job's work future: the way it reports lines, status text and
/// the engine process it is currently waiting on.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Arc<Job>,
    lines: LineSink,
}

impl JobContext {
    pub fn key(&self) -> &JobKey {
        self.job.key()
    }

    pub fn trigger(&self) -> Trigger {
        self.job.trigger()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.job.started_at()
    }

    /// Sink for engine output; lines land in the job in send order.
    pub fn lines(&self) -> &LineSink {
        &self.lines
    }

    /// Append an orchestration message to the job's output.
    pub fn emit(&self, line: impl Into<String>) {
        if self.lines.send(line.into()).is_err() {
            debug!("Dropped output for {}: job is no longer collecting lines", self.job.key);
        }
    }

    /// Replace the one-line status shown to pollers without adding output.
    pub fn set_status(&self, message: impl Into<String>) {
        self.job.state.lock().last_output = message.into();
    }

    pub fn cancel_requested(&self) -> bool {
        self.job.cancel_requested()
    }

    /// Make the running engine process cancellable.
    ///
    /// If a cancel arrived while no process was attached, the new process is
    /// terminated right away.
    pub fn attach_process(&self, handle: ProcessHandle) {
        let cancel_now = {
            let mut state = self.job.state.lock();
            state.phase = JobPhase::Running;
            state.process = Some(handle.clone());
            state.cancel_requested
        };
        debug!("Attached engine process {:?} to {}", handle.pid(), self.job.key);
        if cancel_now {
            if let Err(e) = handle.terminate() {
                warn!("Failed to stop engine process for cancelled job {}: {}", self.job.key, e);
            }
        }
    }

    pub fn detach_process(&self) {
        let mut state = self.job.state.lock();
        state.process = None;
        if state.phase == JobPhase::Running {
            state.phase = JobPhase::Starting;
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    active: HashMap<JobKey, Arc<Job>>,
    completed: HashMap<JobKey, JobResult>,
}

/// Single-flight guard and owner of running jobs and unclaimed results.
///
/// `active` and `completed` are separate maps so a reader can tell "still
/// running" from "finished, result pending pickup". A key moves from one to the
/// other under a single lock acquisition.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job for `key` and run `work` in the background.
    ///
    /// Returns `Conflict` without side effects if a job for the same key is
    /// already active. Never waits on the work itself.
    pub fn start<F, Fut>(&self, key: JobKey, trigger: Trigger, work: F) -> Result<Arc<Job>, JobError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = JobOutcome> + Send + 'static,
    {
        let job = {
            let mut state = self.state.lock();
            if state.active.contains_key(&key) {
                return Err(JobError::Conflict(key));
            }
            if state.completed.remove(&key).is_some() {
                debug!("Discarding unclaimed result for {}", key);
            }
            let job = Arc::new(Job::new(key.clone(), trigger));
            state.active.insert(key, job.clone());
            job
        };

        info!(job = %job.key, trigger = %trigger, "Job started");

        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = JobContext {
            job: job.clone(),
            lines: tx,
        };
        let registry = self.clone();
        let driven = job.clone();
        tokio::spawn(async move {
            let work = tokio::spawn(async move { work(ctx).await });
            registry.drive(driven, rx, work).await;
        });

        Ok(job)
    }

    async fn drive(
        &self,
        job: Arc<Job>,
        mut lines: mpsc::UnboundedReceiver<String>,
        mut work: tokio::task::JoinHandle<JobOutcome>,
    ) {
        let joined = loop {
            tokio::select! {
                biased;
                Some(line) = lines.recv() => job.push_line(line),
                joined = &mut work => break joined,
            }
        };

        job.set_phase(JobPhase::Finishing);
        while let Ok(line) = lines.try_recv() {
            job.push_line(line);
        }

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job = %job.key, "Job task failed: {}", e);
                JobOutcome::internal_failure(format!("internal error while running job: {}", e))
            }
        };
        self.finish(&job, outcome);
    }

    fn finish(&self, job: &Job, outcome: JobOutcome) {
        let cancelled = job.cancel_requested() && outcome.exit_code != 0;
        let finished_at = Utc::now();
        let duration_s = (finished_at - job.started_at).num_milliseconds() as f64 / 1000.0;
        info!(
            job = %job.key,
            code = outcome.exit_code,
            cancelled,
            duration_s,
            "Job finished"
        );

        let result = JobResult {
            kind: job.key.kind,
            trigger: job.trigger,
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            cancelled,
            started_at: job.started_at,
            finished_at,
            change_summary: outcome.change_summary,
            restore_path: outcome.restore_path,
        };

        {
            let mut state = job.state.lock();
            state.phase = JobPhase::Done;
            state.process = None;
        }

        let mut state = self.state.lock();
        state.active.remove(&job.key);
        state.completed.insert(job.key.clone(), result);
    }

    /// Ask the job's engine process to stop.
    ///
    /// The job is only marked cancelled once the process actually ends with a
    /// nonzero code; this returns as soon as the request is delivered.
    pub fn cancel(&self, key: &JobKey) -> Result<Termination, JobError> {
        let job = self
            .active_job(key)
            .ok_or_else(|| JobError::NoActiveJob(key.clone()))?;

        // Signal delivery and the flag flip happen under one lock so that a
        // process attached afterwards never sees a cancel that was refused.
        let mut state = job.state.lock();
        let handle = state
            .process
            .clone()
            .ok_or_else(|| JobError::NotCancellable(key.clone()))?;
        if handle.has_exited() {
            return Err(JobError::NotCancellable(key.clone()));
        }

        info!(job = %key, pid = ?handle.pid(), "Cancelling job");
        let termination = handle.terminate().map_err(|source| match source {
            TerminateError::AlreadyExited => JobError::NotCancellable(key.clone()),
            source => JobError::Terminate {
                key: key.clone(),
                source,
            },
        })?;

        state.cancel_requested = true;
        state.last_output = CANCEL_NOTICE.to_string();
        state.lines.push(CANCEL_NOTICE.to_string());
        Ok(termination)
    }

    pub fn status(&self, key: &JobKey) -> Option<ActiveStatus> {
        self.active_job(key).map(|job| job.status())
    }

    pub fn is_active(&self, key: &JobKey) -> bool {
        self.state.lock().active.contains_key(key)
    }

    pub fn active_job(&self, key: &JobKey) -> Option<Arc<Job>> {
        self.state.lock().active.get(key).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Remove and return the unclaimed result for `key`, if any.
    pub fn take_result(&self, key: &JobKey) -> Option<JobResult> {
        self.state.lock().completed.remove(key)
    }

    pub fn has_result(&self, key: &JobKey) -> bool {
        self.state.lock().completed.contains_key(key)
    }
}
