use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::filters::normalize_content_selection;
use super::runner::{BackupPlan, JobRunner, RestorePlan, StorageRestorePlan};
use super::summary::RevisionLister;
use super::{Replication, Repository, StorageRecord, StorageTarget, OUTPUT_TAIL_CHARS};
use crate::engine::{commands, FileEntry, SnapshotInfo};
use crate::error::{AppError, AppResult};
use crate::jobs::{
    tail, ActiveStatus, JobContext, JobKey, JobKind, JobOutcome, JobRegistry, ProgressObserver, Trigger,
};
use crate::scheduler::{
    JobLauncher, LastRunStatus, ScheduleConfig, ScheduleRequest, MAX_ERROR_LEN, MAX_THREADS,
};
use crate::notify::{BackupReport, DeliveryReport, NetworkTransport, Notifier, RepoNotifications};
use crate::storage::Storage;
use crate::utils::config::Config;

#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    pub revision: u32,
    pub overwrite: bool,
    pub storage: Option<String>,
    pub restore_path: Option<PathBuf>,
    pub patterns: Vec<String>,
    pub password: Option<String>,
    pub threads: Option<u32>,
}

/// Restore from a standalone storage into a fresh directory.
#[derive(Debug, Clone, Default)]
pub struct StorageRestoreRequest {
    pub snapshot_id: String,
    pub revision: u32,
    pub overwrite: bool,
    pub restore_path: Option<PathBuf>,
    pub patterns: Vec<String>,
    pub password: Option<String>,
    pub threads: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct NewStorage {
    pub name: String,
    pub url: String,
    pub password: Option<String>,
    pub env: BTreeMap<String, String>,
}

/// Fields accepted when registering a repository.
#[derive(Debug, Clone, Default)]
pub struct NewRepository {
    pub name: String,
    pub path: PathBuf,
    pub snapshot_id: String,
    pub storages: Vec<StorageTarget>,
    pub password: Option<String>,
    /// Defaults to encrypting whenever a password is given.
    pub encrypt: Option<bool>,
    pub content_selection: Vec<String>,
    pub replication: Replication,
    pub schedule: Option<ScheduleRequest>,
    pub notifications: RepoNotifications,
}

#[derive(Debug, Clone, Default)]
pub struct RepositoryUpdate {
    pub name: Option<String>,
    pub content_selection: Option<Vec<String>>,
    pub replication: Option<Replication>,
    pub schedule: Option<ScheduleRequest>,
    pub notifications: Option<RepoNotifications>,
}

/// Entry point for everything that starts, stops or inspects jobs.
///
/// Cheap to clone; used as the axum router state.
#[derive(Clone)]
pub struct BackupManager {
    config: Arc<Config>,
    storage: Storage,
    registry: JobRegistry,
    runner: JobRunner,
    notifier: Notifier,
}

impl BackupManager {
    pub fn new(config: Config, storage: Storage, registry: JobRegistry, runner: JobRunner) -> Self {
        let notifier = Notifier::new(config.notifications.clone(), Arc::new(NetworkTransport::new()));
        Self {
            config: Arc::new(config),
            storage,
            registry,
            runner,
            notifier,
        }
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub async fn repository(&self, id: &str) -> AppResult<Repository> {
        self.storage
            .get_repository(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Repository {} not found", id)))
    }

    fn threads(&self, requested: Option<u32>) -> usize {
        requested
            .filter(|t| *t > 0)
            .map(|t| t.min(MAX_THREADS) as usize)
            .unwrap_or(self.config.engine_threads)
    }

    /// Register and launch a backup; returns once the job is registered.
    pub async fn start_backup(
        &self,
        repo_id: &str,
        password: Option<String>,
        trigger: Trigger,
        threads: Option<u32>,
    ) -> AppResult<()> {
        let repo = self.repository(repo_id).await?;
        let key = JobKey::new(&repo.id, JobKind::Backup);
        let password = password.filter(|p| !p.is_empty()).or_else(|| repo.password.clone());
        let threads = self.threads(threads);

        info!(
            repo = %repo.id,
            name = %repo.name,
            trigger = %trigger,
            threads,
            "Backup requested"
        );

        let manager = self.clone();
        self.registry.start(key, trigger, move |ctx| async move {
            let repo_id = repo.id.clone();
            let outcome = manager
                .runner
                .run_backup(&ctx, BackupPlan { repo, password, threads })
                .await;
            manager.record_backup(&repo_id, &ctx, &outcome).await;
            outcome
        })?;
        Ok(())
    }

    /// Persist the audit fields of a finished backup on its repository.
    async fn record_backup(&self, repo_id: &str, ctx: &JobContext, outcome: &JobOutcome) {
        let status = if ctx.cancel_requested() && !outcome.success() {
            LastRunStatus::Cancelled
        } else if outcome.success() {
            LastRunStatus::Success
        } else {
            LastRunStatus::Error
        };
        let trigger = ctx.trigger();
        let output = tail(&outcome.stdout, OUTPUT_TAIL_CHARS);
        let error = match status {
            LastRunStatus::Success => None,
            _ => {
                let detail = if outcome.stderr.trim().is_empty() {
                    &outcome.stdout
                } else {
                    &outcome.stderr
                };
                Some(tail(detail.trim(), MAX_ERROR_LEN))
            }
        };
        let summary = outcome.change_summary.clone();

        let now = Utc::now();
        let updated = self
            .storage
            .update_repository(repo_id, move |repo| {
                repo.last_backup = Some(now);
                repo.last_backup_status = Some(status);
                repo.last_backup_trigger = Some(trigger);
                repo.last_backup_output = Some(output);
                repo.last_backup_summary = summary;
                repo.schedule.last_run_at = Some(now);
                repo.schedule.last_run_status = Some(status);
                repo.schedule.last_error = error;
            })
            .await;

        let repo = match updated {
            Ok(Some(repo)) => repo,
            Ok(None) => {
                warn!(repo = %repo_id, "Repository removed while its backup was running");
                return;
            }
            Err(e) => {
                warn!(repo = %repo_id, "Failed to record backup result: {:#}", e);
                return;
            }
        };

        if status == LastRunStatus::Success {
            self.notify_backup(&repo, ctx, outcome, now).await;
        }
    }

    async fn notify_backup(
        &self,
        repo: &Repository,
        ctx: &JobContext,
        outcome: &JobOutcome,
        finished_at: DateTime<Utc>,
    ) {
        let target = repo
            .primary_storage()
            .map(|s| format!("{} ({})", s.display_name(), s.url))
            .unwrap_or_default();
        let report = BackupReport {
            repo_name: repo.name.clone(),
            snapshot_id: repo.snapshot_id.clone(),
            trigger: ctx.trigger(),
            source_path: repo.path.display().to_string(),
            target,
            finished_at,
            duration_s: Some((finished_at - ctx.started_at()).num_milliseconds() as f64 / 1000.0),
            summary: outcome.change_summary.clone(),
            log: outcome.stdout.clone(),
        };
        self.notifier.backup_succeeded(&repo.notifications, &report).await;
    }

    /// Send a sample report on the repository's enabled channels.
    pub async fn send_test_notification(&self, repo_id: &str) -> AppResult<DeliveryReport> {
        let repo = self.repository(repo_id).await?;
        Ok(self
            .notifier
            .send_test(&repo.notifications, &repo.name, &repo.snapshot_id)
            .await)
    }

    fn validate_notifications(&self, notifications: &RepoNotifications) -> AppResult<()> {
        self.notifier
            .settings_for(notifications)
            .validate()
            .map_err(AppError::Validation)
    }

    pub async fn start_restore(&self, repo_id: &str, request: RestoreRequest) -> AppResult<()> {
        let repo = self.repository(repo_id).await?;
        if let Some(storage) = request.storage.as_deref().filter(|s| !s.is_empty()) {
            if repo.storage(storage).is_none() {
                return Err(AppError::Validation(format!("Unknown storage {}", storage)));
            }
        }
        if let Some(path) = &request.restore_path {
            if !path.is_absolute() {
                return Err(AppError::Validation("Restore path must be absolute".to_string()));
            }
        }

        let key = JobKey::new(&repo.id, JobKind::Restore);
        let plan = RestorePlan {
            password: request.password.filter(|p| !p.is_empty()).or_else(|| repo.password.clone()),
            revision: request.revision,
            overwrite: request.overwrite,
            storage: request.storage,
            restore_path: request.restore_path,
            patterns: request.patterns,
            threads: self.threads(request.threads),
            repo,
        };

        info!(
            repo = %plan.repo.id,
            revision = plan.revision,
            path = ?plan.restore_path,
            "Restore requested"
        );

        let runner = self.runner.clone();
        self.registry.start(key, Trigger::Manual, move |ctx| async move {
            runner.run_restore(&ctx, plan).await
        })?;
        Ok(())
    }

    /// Validate, initialise the engine configuration in the repository
    /// directory when missing, and persist the record.
    pub async fn create_repository(&self, new: NewRepository) -> AppResult<Repository> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Repository name is required".to_string()));
        }
        if !new.path.is_absolute() {
            return Err(AppError::Validation("Repository path must be absolute".to_string()));
        }
        let snapshot_id = new.snapshot_id.trim();
        if snapshot_id.is_empty() || snapshot_id.chars().any(char::is_whitespace) {
            return Err(AppError::Validation("Snapshot id must be a single non-empty word".to_string()));
        }
        if new.storages.is_empty() {
            return Err(AppError::Validation("At least one storage is required".to_string()));
        }
        for (i, storage) in new.storages.iter().enumerate() {
            if storage.name.trim().is_empty() || storage.url.trim().is_empty() {
                return Err(AppError::Validation("Every storage needs a name and a url".to_string()));
            }
            if new.storages[..i].iter().any(|s| s.name == storage.name) {
                return Err(AppError::Validation(format!("Duplicate storage {}", storage.name)));
            }
        }

        self.validate_notifications(&new.notifications)?;

        let mut repo = Repository::new(name, new.path, snapshot_id);
        repo.notifications = new.notifications;
        repo.password = new.password.filter(|p| !p.is_empty());
        repo.encrypted = new.encrypt.unwrap_or(repo.password.is_some());
        repo.storages = new.storages;
        repo.content_selection = normalize_content_selection(&new.content_selection);
        repo.replication = new.replication;
        if let Some(request) = &new.schedule {
            repo.schedule = ScheduleConfig::normalize(request, &ScheduleConfig::default());
        }

        tokio::fs::create_dir_all(&repo.path).await.map_err(|e| {
            AppError::Validation(format!("Cannot create {}: {}", repo.path.display(), e))
        })?;

        let initialized = tokio::fs::try_exists(repo.path.join(".duplicacy"))
            .await
            .unwrap_or(false);
        if initialized {
            info!(path = %repo.path.display(), "Directory already initialised, registering as is");
        } else if let Some(primary) = repo.primary_storage() {
            let inv = self.runner.prepare(
                &repo,
                &primary.name,
                repo.password.as_deref(),
                commands::init(&repo.path, &repo.snapshot_id, &primary.url, repo.encrypted),
            );
            self.runner.engine().run_checked(&inv).await?;
        }

        self.storage.save_repository(&repo).await?;
        info!(repo = %repo.id, name = %repo.name, "Repository created");
        Ok(repo)
    }

    pub async fn update_repository(&self, repo_id: &str, update: RepositoryUpdate) -> AppResult<Repository> {
        if let Some(notifications) = &update.notifications {
            self.validate_notifications(notifications)?;
        }
        let updated = self
            .storage
            .update_repository(repo_id, move |repo| {
                if let Some(name) = update.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
                    repo.name = name.to_string();
                }
                if let Some(selection) = &update.content_selection {
                    repo.content_selection = normalize_content_selection(selection);
                }
                if let Some(replication) = update.replication {
                    repo.replication = replication;
                }
                if let Some(request) = &update.schedule {
                    repo.schedule = ScheduleConfig::normalize(request, &repo.schedule);
                }
                if let Some(notifications) = update.notifications {
                    repo.notifications = notifications;
                }
            })
            .await?;
        updated.ok_or_else(|| AppError::NotFound(format!("Repository {} not found", repo_id)))
    }

    pub fn cancel(&self, repo_id: &str, kind: JobKind) -> AppResult<()> {
        self.registry.cancel(&JobKey::new(repo_id, kind))?;
        Ok(())
    }

    pub fn status(&self, repo_id: &str, kind: JobKind) -> Option<ActiveStatus> {
        self.registry.status(&JobKey::new(repo_id, kind))
    }

    pub fn observer(&self, repo_id: &str, kind: JobKind) -> ProgressObserver {
        ProgressObserver::new(self.registry.clone(), JobKey::new(repo_id, kind))
    }

    pub async fn list_snapshots(
        &self,
        repo_id: &str,
        storage: Option<&str>,
        password: Option<String>,
    ) -> AppResult<Vec<SnapshotInfo>> {
        let repo = self.repository(repo_id).await?;
        let storage = resolve_storage(&repo, storage)?;
        let password = password.filter(|p| !p.is_empty()).or_else(|| repo.password.clone());

        let inv = self.runner.prepare(
            &repo,
            &storage.name,
            password.as_deref(),
            commands::list_snapshots(&repo.path, &storage.name),
        );
        let mut snapshots = self.runner.engine().list_snapshots(&inv).await?;
        snapshots.retain(|s| s.id == repo.snapshot_id);
        snapshots.sort_by(|a, b| b.revision.cmp(&a.revision));
        Ok(snapshots)
    }

    pub async fn list_files(
        &self,
        repo_id: &str,
        revision: u32,
        storage: Option<&str>,
        password: Option<String>,
    ) -> AppResult<Vec<FileEntry>> {
        let repo = self.repository(repo_id).await?;
        let storage = resolve_storage(&repo, storage)?.name.clone();
        let password = password.filter(|p| !p.is_empty()).or_else(|| repo.password.clone());
        let files = self
            .runner
            .lister(&repo, &storage, password)
            .list_files(revision)
            .await?;
        Ok(files)
    }

    pub async fn delete_repository(&self, repo_id: &str) -> AppResult<()> {
        if self.registry.is_active(&JobKey::new(repo_id, JobKind::Backup)) {
            return Err(AppError::Busy("Cannot delete a repository while its backup is running".to_string()));
        }
        if !self.storage.delete_repository(repo_id).await? {
            return Err(AppError::NotFound(format!("Repository {} not found", repo_id)));
        }
        info!(repo = %repo_id, "Repository deleted");
        Ok(())
    }
}

// Standalone storages
impl BackupManager {
    pub async fn storage_record(&self, id: &str) -> AppResult<StorageRecord> {
        self.storage
            .get_storage(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Storage {} not found", id)))
    }

    pub async fn list_storages(&self) -> AppResult<Vec<StorageRecord>> {
        Ok(self.storage.list_storages().await?)
    }

    /// Register a storage; registering a url twice updates the existing record.
    pub async fn create_storage(&self, new: NewStorage) -> AppResult<StorageRecord> {
        let name = new.name.trim();
        let url = new.url.trim();
        if name.is_empty() {
            return Err(AppError::Validation("Storage name is required".to_string()));
        }
        if url.is_empty() {
            return Err(AppError::Validation("Storage url is required".to_string()));
        }

        let mut record = StorageRecord::new(name, url);
        record.password = new.password.filter(|p| !p.is_empty());
        record.env = new.env;
        let record = self.storage.upsert_storage(record).await?;
        info!(storage = %record.id, name = %record.name, "Storage registered");
        Ok(record)
    }

    pub async fn delete_storage(&self, storage_id: &str) -> AppResult<()> {
        if self.registry.is_active(&JobKey::new(storage_id, JobKind::StorageRestore)) {
            return Err(AppError::Busy("Cannot delete a storage while a restore from it is running".to_string()));
        }
        if !self.storage.delete_storage(storage_id).await? {
            return Err(AppError::NotFound(format!("Storage {} not found", storage_id)));
        }
        info!(storage = %storage_id, "Storage deleted");
        Ok(())
    }

    /// Register and launch a restore straight from a storage. The target
    /// directory is initialised against the storage before restoring.
    pub async fn start_storage_restore(&self, storage_id: &str, request: StorageRestoreRequest) -> AppResult<()> {
        let storage = self.storage_record(storage_id).await?;
        let snapshot_id = request.snapshot_id.trim();
        if snapshot_id.is_empty() || snapshot_id.chars().any(char::is_whitespace) {
            return Err(AppError::Validation("Snapshot id must be a single non-empty word".to_string()));
        }
        let restore_path = request.restore_path.ok_or_else(|| {
            AppError::Validation("A restore path is required when restoring from a storage".to_string())
        })?;
        if !restore_path.is_absolute() {
            return Err(AppError::Validation("Restore path must be absolute".to_string()));
        }

        let key = JobKey::new(&storage.id, JobKind::StorageRestore);
        let plan = StorageRestorePlan {
            password: request.password.filter(|p| !p.is_empty()).or_else(|| storage.password.clone()),
            snapshot_id: snapshot_id.to_string(),
            revision: request.revision,
            overwrite: request.overwrite,
            restore_path,
            patterns: request.patterns,
            threads: self.threads(request.threads),
            storage,
        };

        info!(
            storage = %plan.storage.id,
            snapshot = %plan.snapshot_id,
            revision = plan.revision,
            path = %plan.restore_path.display(),
            "Storage restore requested"
        );

        let runner = self.runner.clone();
        self.registry.start(key, Trigger::Manual, move |ctx| async move {
            runner.run_storage_restore(&ctx, plan).await
        })?;
        Ok(())
    }
}

fn resolve_storage<'a>(repo: &'a Repository, name: Option<&str>) -> AppResult<&'a StorageTarget> {
    match name.filter(|s| !s.is_empty()) {
        Some(name) => repo
            .storage(name)
            .ok_or_else(|| AppError::Validation(format!("Unknown storage {}", name))),
        None => repo
            .primary_storage()
            .ok_or_else(|| AppError::Validation("Repository has no storage configured".to_string())),
    }
}

#[async_trait]
impl JobLauncher for BackupManager {
    async fn launch_scheduled(&self, resource_id: &str, threads: Option<u32>) -> Result<()> {
        self.start_backup(resource_id, None, Trigger::Scheduled, threads).await?;
        Ok(())
    }
}
