//! Backup and restore workflows executed inside a registered job.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::filters::sync_filters_file;
use super::summary::{latest_revision, summarize_backup, EngineLister};
use super::{EnvResolver, Repository, StorageRecord};
use crate::engine::commands::{self, Invocation, RestoreOptions};
use crate::engine::{EngineClient, EngineOutput};
use crate::jobs::{JobContext, JobOutcome};

#[derive(Debug, Clone)]
pub struct BackupPlan {
    pub repo: Repository,
    pub password: Option<String>,
    pub threads: usize,
}

#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub repo: Repository,
    pub password: Option<String>,
    pub revision: u32,
    pub overwrite: bool,
    pub storage: Option<String>,
    pub restore_path: Option<PathBuf>,
    pub patterns: Vec<String>,
    pub threads: usize,
}

/// Restore from a standalone storage into a directory that is initialised
/// against that storage first.
#[derive(Debug, Clone)]
pub struct StorageRestorePlan {
    pub storage: StorageRecord,
    pub snapshot_id: String,
    pub password: Option<String>,
    pub revision: u32,
    pub overwrite: bool,
    pub restore_path: PathBuf,
    pub patterns: Vec<String>,
    pub threads: usize,
}

/// Alias the engine gives the storage of a directory initialised by `init`.
const INIT_STORAGE_NAME: &str = "default";

#[derive(Clone)]
pub struct JobRunner {
    engine: EngineClient,
    env: Arc<dyn EnvResolver>,
}

impl JobRunner {
    pub fn new(engine: EngineClient, env: Arc<dyn EnvResolver>) -> Self {
        Self { engine, env }
    }

    pub fn engine(&self) -> &EngineClient {
        &self.engine
    }

    /// Invocation with the storage's environment and the repository password.
    pub fn prepare(&self, repo: &Repository, storage: &str, password: Option<&str>, inv: Invocation) -> Invocation {
        inv.with_env(self.env.storage_env(repo, storage))
            .with_password(storage, password)
    }

    pub fn lister(&self, repo: &Repository, storage: &str, password: Option<String>) -> EngineLister {
        EngineLister::new(
            self.engine.clone(),
            &repo.path,
            storage,
            self.env.storage_env(repo, storage),
            password,
        )
    }

    /// Run one engine process with its output streamed into the job and its
    /// handle attached for cancellation while it runs.
    async fn run_attached(&self, ctx: &JobContext, inv: &Invocation) -> EngineOutput {
        let output = self
            .engine
            .run(inv, Some(ctx.lines()), |handle| ctx.attach_process(handle))
            .await;
        ctx.detach_process();
        output
    }

    pub async fn run_backup(&self, ctx: &JobContext, plan: BackupPlan) -> JobOutcome {
        let BackupPlan { repo, password, threads } = plan;
        let Some(primary) = repo.primary_storage().cloned() else {
            return JobOutcome::internal_failure("repository has no storage configured");
        };

        let lister = self.lister(&repo, &primary.name, password.clone());
        let pre_latest = latest_revision(&lister, &repo.snapshot_id).await;

        if let Err(e) = sync_filters_file(&repo.path, &repo.content_selection).await {
            return JobOutcome::internal_failure(format!("failed to prepare content selection: {:#}", e));
        }

        ctx.set_status(format!("Backing up to {}...", primary.display_name()));
        let inv = self.prepare(
            &repo,
            &primary.name,
            password.as_deref(),
            commands::backup(&repo.path, &primary.name, threads),
        );
        let mut output = self.run_attached(ctx, &inv).await;

        if output.success() && repo.replication.enabled && !ctx.cancel_requested() {
            if let Some(to) = repo.replication.to.as_deref().filter(|t| !t.is_empty()) {
                let from = repo
                    .replication
                    .from
                    .clone()
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(|| primary.name.clone());
                let copied = self.replicate(ctx, &repo, &from, to, password.as_deref(), threads).await;
                output = join_outputs(output, copied);
            }
        }

        let mut outcome = JobOutcome::from_engine(output);
        if outcome.success() {
            let report = summarize_backup(&lister, &repo.snapshot_id, pre_latest).await;
            match report.summary() {
                Some(summary) => ctx.emit(summary.describe()),
                None => warn!(repo = %repo.id, "Change summary unavailable: {:?}", report),
            }
            outcome.change_summary = Some(report);
        }
        outcome
    }

    async fn replicate(
        &self,
        ctx: &JobContext,
        repo: &Repository,
        from: &str,
        to: &str,
        password: Option<&str>,
        threads: usize,
    ) -> EngineOutput {
        let label = |name: &str| {
            repo.storage(name)
                .map(|s| s.display_name().to_string())
                .unwrap_or_else(|| name.to_string())
        };
        ctx.set_status(format!("Replicating {} to {}...", label(from), label(to)));
        ctx.emit(format!("Replicating backup from {} to {}", label(from), label(to)));
        info!(repo = %repo.id, from, to, "Replicating backup");

        let inv = self.prepare(repo, from, password, commands::copy(&repo.path, from, to, threads));
        let inv = self.prepare(repo, to, password, inv);
        self.run_attached(ctx, &inv).await
    }

    pub async fn run_restore(&self, ctx: &JobContext, plan: RestorePlan) -> JobOutcome {
        let repo = &plan.repo;
        let storage = match plan.storage.as_deref().filter(|s| !s.is_empty()) {
            Some(name) => repo.storage(name).or_else(|| repo.primary_storage()),
            None => repo.primary_storage(),
        };
        let Some(storage) = storage.cloned() else {
            return JobOutcome::internal_failure("repository has no storage configured");
        };

        let target = plan.restore_path.clone().unwrap_or_else(|| repo.path.clone());
        let restore_path = Some(target.display().to_string());

        if target != repo.path {
            let init = self.prepare(
                repo,
                &storage.name,
                plan.password.as_deref(),
                commands::init(&target, &repo.snapshot_id, &storage.url, repo.encrypted),
            );
            let init = self.init_restore_target(ctx, &target, &init).await;
            if !init.success() {
                return JobOutcome {
                    restore_path,
                    ..JobOutcome::from_engine(init)
                };
            }
        }

        ctx.set_status(format!("Restoring revision #{} from {}...", plan.revision, storage.display_name()));
        let inv = self.prepare(
            repo,
            &storage.name,
            plan.password.as_deref(),
            commands::restore(
                &target,
                &RestoreOptions {
                    revision: plan.revision,
                    overwrite: plan.overwrite,
                    threads: plan.threads,
                    storage: &storage.name,
                    patterns: &plan.patterns,
                },
            ),
        );
        let output = self.run_attached(ctx, &inv).await;
        JobOutcome {
            restore_path,
            ..JobOutcome::from_engine(output)
        }
    }

    pub async fn run_storage_restore(&self, ctx: &JobContext, plan: StorageRestorePlan) -> JobOutcome {
        let StorageRestorePlan {
            storage,
            snapshot_id,
            password,
            revision,
            overwrite,
            restore_path,
            patterns,
            threads,
        } = plan;
        let reported_path = Some(restore_path.display().to_string());
        let with_storage = |inv: Invocation| {
            inv.with_env(storage.env.clone())
                .with_password(INIT_STORAGE_NAME, password.as_deref())
        };

        let init = with_storage(commands::init(
            &restore_path,
            &snapshot_id,
            &storage.url,
            password.as_deref().is_some_and(|p| !p.is_empty()),
        ));
        let init = self.init_restore_target(ctx, &restore_path, &init).await;
        if !init.success() {
            return JobOutcome {
                restore_path: reported_path,
                ..JobOutcome::from_engine(init)
            };
        }

        info!(storage = %storage.id, snapshot = %snapshot_id, revision, "Restoring from storage");
        ctx.set_status(format!("Restoring {} revision #{} from {}...", snapshot_id, revision, storage.name));
        let inv = with_storage(commands::restore(
            &restore_path,
            &RestoreOptions {
                revision,
                overwrite,
                threads,
                storage: INIT_STORAGE_NAME,
                patterns: &patterns,
            },
        ));
        let output = self.run_attached(ctx, &inv).await;
        JobOutcome {
            restore_path: reported_path,
            ..JobOutcome::from_engine(output)
        }
    }

    /// Prepare a directory other than a repository to receive a restore by
    /// running `init` in it. A directory that already carries engine
    /// configuration is refused rather than reused.
    async fn init_restore_target(&self, ctx: &JobContext, target: &Path, init: &Invocation) -> EngineOutput {
        if let Err(e) = tokio::fs::create_dir_all(target).await {
            return EngineOutput::launch_failure(format!(
                "failed to create restore directory {}: {}",
                target.display(),
                e
            ));
        }
        let config_dir = target.join(".duplicacy");
        if tokio::fs::try_exists(&config_dir).await.unwrap_or(false) {
            return EngineOutput::launch_failure(format!(
                "restore directory already contains {}; use an empty directory or remove it",
                config_dir.display()
            ));
        }

        ctx.set_status(format!("Preparing restore directory {}...", target.display()));
        self.run_attached(ctx, init).await
    }
}

fn join_text(first: String, second: String) -> String {
    match (first.is_empty(), second.is_empty()) {
        (_, true) => first,
        (true, false) => second,
        (false, false) => {
            let mut joined = first;
            if !joined.ends_with('\n') {
                joined.push('\n');
            }
            joined.push_str(&second);
            joined
        }
    }
}

/// The second step decides the exit code; outputs are concatenated.
fn join_outputs(first: EngineOutput, second: EngineOutput) -> EngineOutput {
    EngineOutput {
        code: second.code,
        stdout: join_text(first.stdout, second.stdout),
        stderr: join_text(first.stderr, second.stderr),
    }
}
