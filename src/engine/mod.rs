//! Wrapper around the external versioned-backup engine binary.
//!
//! Every engine call goes through [`EngineClient::run`], which spawns the
//! binary with a merged environment, folds stderr into stdout through a single
//! pipe so diagnostics keep their place among normal lines, and forwards each
//! line to an optional channel while the process is still running.

pub mod commands;
pub mod parse;
pub mod process;

pub use commands::Invocation;
pub use parse::{FileEntry, SnapshotInfo};
pub use process::{ProcessHandle, TerminateError, Termination};

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Exit code recorded when the engine never ran (spawn failure, bad setup).
pub const LAUNCH_FAILURE_CODE: i32 = -1;

/// Receives engine output one line at a time, in emission order.
pub type LineSink = mpsc::UnboundedSender<String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl EngineOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn launch_failure(message: impl Into<String>) -> Self {
        Self {
            code: LAUNCH_FAILURE_CODE,
            stdout: String::new(),
            stderr: message.into(),
        }
    }

    /// Whatever text best explains the outcome.
    pub fn detail(&self) -> &str {
        if self.stdout.trim().is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine `{command}` exited with code {code}: {detail}")]
    Exit {
        command: String,
        code: i32,
        detail: String,
    },
}

impl EngineError {
    fn from_output(invocation: &Invocation, output: &EngineOutput) -> Self {
        EngineError::Exit {
            command: invocation.describe(),
            code: output.code,
            detail: output.detail().trim().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineClient {
    binary: PathBuf,
}

impl EngineClient {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    /// Run the engine to completion.
    ///
    /// `on_start` receives the process handle right after spawn, before any
    /// output is read, so a cancel request arriving mid-run has something to
    /// signal. Lines go to `sink` as soon as they are read.
    pub async fn run<F>(
        &self,
        invocation: &Invocation,
        sink: Option<&LineSink>,
        on_start: F,
    ) -> EngineOutput
    where
        F: FnOnce(ProcessHandle) + Send,
    {
        info!(
            "Running engine: {} {} (in {})",
            self.binary.display(),
            invocation.describe(),
            invocation.working_dir.display()
        );

        let (reader, writer) = match std::io::pipe() {
            Ok(pipe) => pipe,
            Err(e) => return EngineOutput::launch_failure(format!("failed to create output pipe: {}", e)),
        };
        let writer_err = match writer.try_clone() {
            Ok(w) => w,
            Err(e) => return EngineOutput::launch_failure(format!("failed to create output pipe: {}", e)),
        };

        let mut cmd = Command::new(&self.binary);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(writer))
            .stderr(Stdio::from(writer_err))
            .kill_on_drop(true);

        let spawned = cmd.spawn();
        // The command still owns the write ends; drop it so EOF arrives when the child exits.
        drop(cmd);

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to launch engine {}: {}", self.binary.display(), e);
                return EngineOutput::launch_failure(format!(
                    "failed to launch {}: {}",
                    self.binary.display(),
                    e
                ));
            }
        };

        let (handle, mut kill_rx) = ProcessHandle::new(child.id());
        on_start(handle.clone());

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::task::spawn_blocking(move || pump_lines(reader, line_tx));

        let mut stdout = String::new();
        let mut watching_kill = true;
        loop {
            tokio::select! {
                line = line_rx.recv() => match line {
                    Some(line) => {
                        debug!("engine: {}", line);
                        stdout.push_str(&line);
                        stdout.push('\n');
                        if let Some(sink) = sink {
                            let _ = sink.send(line);
                        }
                    }
                    None => break,
                },
                changed = kill_rx.changed(), if watching_kill => {
                    watching_kill = false;
                    if changed.is_ok() && *kill_rx.borrow() {
                        warn!("Killing engine process {:?}", handle.pid());
                        if let Err(e) = child.start_kill() {
                            warn!("Failed to kill engine process: {}", e);
                        }
                    }
                }
            }
        }

        if let Err(e) = reader_task.await {
            warn!("Engine output reader failed: {}", e);
        }

        let code = match child.wait().await {
            Ok(status) => exit_code(status),
            Err(e) => {
                handle.mark_exited();
                return EngineOutput {
                    code: LAUNCH_FAILURE_CODE,
                    stdout,
                    stderr: format!("failed to wait for engine: {}", e),
                };
            }
        };
        handle.mark_exited();

        info!("Engine finished with code {}", code);
        EngineOutput {
            code,
            stdout,
            stderr: String::new(),
        }
    }

    /// Run a short command without streaming and fail on a nonzero exit.
    pub async fn run_checked(&self, invocation: &Invocation) -> Result<EngineOutput, EngineError> {
        let output = self.run(invocation, None, |_| {}).await;
        if output.success() {
            Ok(output)
        } else {
            Err(EngineError::from_output(invocation, &output))
        }
    }

    pub async fn list_snapshots(&self, invocation: &Invocation) -> Result<Vec<SnapshotInfo>, EngineError> {
        let output = self.run_checked(invocation).await?;
        Ok(parse::parse_snapshot_list(&output.stdout))
    }

    pub async fn list_files(&self, invocation: &Invocation) -> Result<Vec<FileEntry>, EngineError> {
        let output = self.run_checked(invocation).await?;
        Ok(parse::parse_file_list(&output.stdout))
    }
}

fn pump_lines(reader: std::io::PipeReader, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Error reading engine output: {}", e);
                break;
            }
        }
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(LAUNCH_FAILURE_CODE)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(LAUNCH_FAILURE_CODE)
}
