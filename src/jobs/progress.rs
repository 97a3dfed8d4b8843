use serde::Serialize;
use std::sync::Arc;

use super::{Job, JobKey, JobRegistry, JobResult};
use crate::backup::summary::ChangeReport;

/// What one poll of a job's progress found.
#[derive(Debug)]
pub enum Observation {
    /// Job still active; lines appended since the previous poll.
    Running { new_lines: Vec<String> },
    /// Job finished since the previous poll. `remaining` holds lines the
    /// observer had not yet seen when the job ended.
    Finished {
        remaining: Vec<String>,
        result: Box<JobResult>,
    },
    /// No active job and no pending result.
    Idle,
}

/// Per-connection reader of a job's output.
///
/// The cursor belongs to the observer, so separate connections each see every
/// line, but only the first to poll after completion receives the result.
#[derive(Debug)]
pub struct ProgressObserver {
    registry: JobRegistry,
    key: JobKey,
    job: Option<Arc<Job>>,
    cursor: usize,
}

impl ProgressObserver {
    pub fn new(registry: JobRegistry, key: JobKey) -> Self {
        Self {
            registry,
            key,
            job: None,
            cursor: 0,
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn observe(&mut self) -> Observation {
        if let Some(job) = self.registry.active_job(&self.key) {
            let same_job = self.job.as_ref().is_some_and(|seen| Arc::ptr_eq(seen, &job));
            if !same_job {
                self.job = Some(job.clone());
                self.cursor = 0;
            }
            let new_lines = job.lines_since(self.cursor);
            self.cursor += new_lines.len();
            return Observation::Running { new_lines };
        }

        match self.registry.take_result(&self.key) {
            Some(result) => {
                let remaining = match self.job.take() {
                    Some(job) => job.lines_since(self.cursor),
                    None => Vec::new(),
                };
                self.cursor = 0;
                Observation::Finished {
                    remaining,
                    result: Box::new(result),
                }
            }
            None => Observation::Idle,
        }
    }
}

/// Messages pushed to a progress stream, in wire shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Running {
        running: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Finished {
        done: bool,
        success: bool,
        cancelled: bool,
        code: i32,
        final_output: String,
        change_summary: Option<ChangeReport>,
        #[serde(skip_serializing_if = "Option::is_none")]
        restore_path: Option<String>,
    },
    Idle {
        done: bool,
    },
}

impl ProgressEvent {
    pub fn running(lines: &[String]) -> Self {
        ProgressEvent::Running {
            running: true,
            output: if lines.is_empty() {
                None
            } else {
                Some(lines.join("\n"))
            },
        }
    }

    pub fn finished(result: &JobResult) -> Self {
        ProgressEvent::Finished {
            done: true,
            success: result.success(),
            cancelled: result.cancelled,
            code: result.exit_code,
            final_output: result.final_output().to_string(),
            change_summary: result.change_summary.clone(),
            restore_path: result.restore_path.clone(),
        }
    }

    pub fn idle() -> Self {
        ProgressEvent::Idle { done: true }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Running { .. })
    }
}

impl Observation {
    /// Wire events for this observation, in send order.
    pub fn into_events(self) -> Vec<ProgressEvent> {
        match self {
            Observation::Running { new_lines } => vec![ProgressEvent::running(&new_lines)],
            Observation::Finished { remaining, result } => {
                let mut events = Vec::with_capacity(2);
                if !remaining.is_empty() {
                    events.push(ProgressEvent::running(&remaining));
                }
                events.push(ProgressEvent::finished(&result));
                events
            }
            Observation::Idle => vec![ProgressEvent::idle()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobKind, JobOutcome, Trigger};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn key() -> JobKey {
        JobKey::new("repo-1", JobKind::Backup)
    }

    #[tokio::test]
    async fn test_observed_lines_match_job_output_exactly() {
        let registry = JobRegistry::new();
        let (step_tx, mut step_rx) = mpsc::unbounded_channel::<usize>();
        let job = registry
            .start(key(), Trigger::Manual, |ctx| async move {
                while let Some(n) = step_rx.recv().await {
                    for i in 0..n {
                        ctx.emit(format!("chunk line {}", i));
                    }
                }
                JobOutcome {
                    stdout: "all done\n".to_string(),
                    ..Default::default()
                }
            })
            .unwrap();

        let mut observer = ProgressObserver::new(registry.clone(), key());
        let mut seen = Vec::new();
        let mut expected_total = 0;
        for burst in [3, 0, 5, 1, 7] {
            step_tx.send(burst).unwrap();
            expected_total += burst;
            while job.line_count() < expected_total {
                tokio::task::yield_now().await;
            }
            match observer.observe() {
                Observation::Running { new_lines } => {
                    assert_eq!(new_lines.len(), burst);
                    seen.extend(new_lines);
                }
                other => panic!("expected running, got {:?}", other),
            }
        }
        step_tx.send(2).unwrap();
        drop(step_tx);

        let result = loop {
            match observer.observe() {
                Observation::Running { new_lines } => seen.extend(new_lines),
                Observation::Finished { remaining, result } => {
                    seen.extend(remaining);
                    break result;
                }
                Observation::Idle => panic!("result was lost"),
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert_eq!(seen, job.lines_since(0));
        assert_eq!(seen.len(), expected_total + 2);
        assert!(result.success());
        assert!(matches!(observer.observe(), Observation::Idle));
    }

    #[tokio::test]
    async fn test_only_first_observer_gets_result() {
        let registry = JobRegistry::new();
        registry
            .start(key(), Trigger::Manual, |_| async {
                JobOutcome {
                    exit_code: 2,
                    stdout: "ERROR storage unreachable\n".to_string(),
                    ..Default::default()
                }
            })
            .unwrap();
        while registry.is_active(&key()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut first = ProgressObserver::new(registry.clone(), key());
        let mut second = ProgressObserver::new(registry.clone(), key());
        let Observation::Finished { result, .. } = first.observe() else {
            panic!("first observer should see the result");
        };
        assert_eq!(result.exit_code, 2);
        assert!(matches!(second.observe(), Observation::Idle));
        assert!(matches!(first.observe(), Observation::Idle));
    }

    #[test]
    fn test_event_wire_shapes() {
        assert_eq!(
            serde_json::to_value(ProgressEvent::running(&[])).unwrap(),
            json!({"running": true})
        );
        assert_eq!(
            serde_json::to_value(ProgressEvent::running(&["a".into(), "b".into()])).unwrap(),
            json!({"running": true, "output": "a\nb"})
        );
        assert_eq!(serde_json::to_value(ProgressEvent::idle()).unwrap(), json!({"done": true}));

        let result = JobResult {
            kind: JobKind::Backup,
            trigger: Trigger::Manual,
            exit_code: 0,
            stdout: "Backup complete\n".to_string(),
            stderr: String::new(),
            cancelled: false,
            started_at: chrono::Utc::now(),
            finished_at: chrono::Utc::now(),
            change_summary: None,
            restore_path: None,
        };
        let event = ProgressEvent::finished(&result);
        assert!(event.is_terminal());
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({
                "done": true,
                "success": true,
                "cancelled": false,
                "code": 0,
                "finalOutput": "Backup complete\n",
                "changeSummary": null
            })
        );
    }
}
