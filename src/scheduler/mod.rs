//! Recurring backups.
//!
//! Every tick walks the enabled schedules, arms the ones without a next run,
//! and dispatches the ones that are due. The queued state and the following
//! next run are persisted before the job is launched, so a slow or failing
//! launch can never make the same due time fire twice.

pub mod schedule;

pub use schedule::{
    compute_next_run, LastRunStatus, ScheduleConfig, ScheduleDay, ScheduleMode, ScheduleRequest, TimeOfDay,
    MAX_THREADS,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::jobs::{tail, JobKey, JobKind, JobRegistry};

/// Seconds added to `now` when computing the next run written before dispatch.
pub const DISPATCH_MARGIN_SECS: i64 = 1;
/// Seconds added to `now` when computing the next run after a failed dispatch.
pub const FAILURE_BACKOFF_SECS: i64 = 60;
pub const MAX_ERROR_LEN: usize = 300;

#[derive(Debug, Clone)]
pub struct ScheduledResource {
    pub id: String,
    pub name: String,
    pub schedule: ScheduleConfig,
}

pub type ScheduleUpdate = Box<dyn FnOnce(&mut ScheduleConfig) + Send>;

/// Where schedules live. Reads return committed state; writes are durable
/// before they return.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn scheduled_resources(&self) -> Result<Vec<ScheduledResource>>;

    /// Apply `update` to the stored schedule of `id` atomically. Returns the
    /// new schedule, or `None` when the resource no longer exists.
    async fn update_schedule(&self, id: &str, update: ScheduleUpdate) -> Result<Option<ScheduleConfig>>;
}

/// Starts a scheduled backup. Must not wait for the backup to finish.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch_scheduled(&self, resource_id: &str, threads: Option<u32>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub initialized: usize,
    pub dispatched: usize,
    pub failed: usize,
    pub busy: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        *self == TickReport::default()
    }
}

enum Step {
    Initialized,
    Dispatched,
    Failed,
    Busy,
    Waiting,
}

pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    launcher: Arc<dyn JobLauncher>,
    registry: JobRegistry,
    interval: std::time::Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        launcher: Arc<dyn JobLauncher>,
        registry: JobRegistry,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            launcher,
            registry,
            interval,
        }
    }

    /// Tick until `shutdown` turns true or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Scheduler started, checking every {}",
            humantime::format_duration(self.interval)
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick_at(&Local::now()).await {
                        Ok(report) if !report.is_empty() => debug!("Scheduler tick: {:?}", report),
                        Ok(_) => {}
                        Err(e) => error!("Scheduler tick failed: {:#}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }

    /// One pass over all schedules as of `now`. A failure on one resource is
    /// logged and counted; the others are still processed.
    pub async fn tick_at<Tz>(&self, now: &DateTime<Tz>) -> Result<TickReport>
    where
        Tz: TimeZone + Send + Sync + 'static,
        Tz::Offset: Send + Sync + 'static,
    {
        let resources = self.store.scheduled_resources().await?;
        let mut report = TickReport::default();

        for resource in resources.iter().filter(|r| r.schedule.enabled) {
            match self.step(resource, now).await {
                Ok(Step::Initialized) => report.initialized += 1,
                Ok(Step::Dispatched) => report.dispatched += 1,
                Ok(Step::Failed) => report.failed += 1,
                Ok(Step::Busy) => report.busy += 1,
                Ok(Step::Waiting) => {}
                Err(e) => {
                    error!(repo = %resource.id, "Scheduler failed to process repository: {:#}", e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn step<Tz>(&self, resource: &ScheduledResource, now: &DateTime<Tz>) -> Result<Step>
    where
        Tz: TimeZone + Send + Sync + 'static,
        Tz::Offset: Send + Sync + 'static,
    {
        let Some(next_run) = resource.schedule.next_run_at else {
            let at = now.clone();
            self.store
                .update_schedule(
                    &resource.id,
                    Box::new(move |schedule| {
                        if schedule.enabled && schedule.next_run_at.is_none() {
                            schedule.next_run_at = compute_next_run(schedule, &at);
                        }
                    }),
                )
                .await?;
            debug!(repo = %resource.id, "Armed schedule");
            return Ok(Step::Initialized);
        };

        if self.registry.is_active(&JobKey::new(&resource.id, JobKind::Backup)) {
            return Ok(Step::Busy);
        }

        let now_utc = now.with_timezone(&Utc);
        if now_utc < next_run {
            return Ok(Step::Waiting);
        }

        info!(repo = %resource.id, name = %resource.name, "Scheduled backup is due");

        let at = now.clone();
        let queued = self
            .store
            .update_schedule(
                &resource.id,
                Box::new(move |schedule| {
                    schedule.last_run_at = Some(at.with_timezone(&Utc));
                    schedule.last_run_status = Some(LastRunStatus::Queued);
                    schedule.last_error = None;
                    schedule.next_run_at = compute_next_run(schedule, &(at + Duration::seconds(DISPATCH_MARGIN_SECS)));
                }),
            )
            .await?;
        if queued.is_none() {
            warn!(repo = %resource.id, "Repository disappeared before dispatch");
            return Ok(Step::Waiting);
        }

        match self
            .launcher
            .launch_scheduled(&resource.id, resource.schedule.threads)
            .await
        {
            Ok(()) => Ok(Step::Dispatched),
            Err(e) => {
                error!(repo = %resource.id, "Failed to start scheduled backup: {:#}", e);
                let message = tail(&format!("{:#}", e), MAX_ERROR_LEN);
                let at = now.clone();
                self.store
                    .update_schedule(
                        &resource.id,
                        Box::new(move |schedule| {
                            schedule.last_run_status = Some(LastRunStatus::Error);
                            schedule.last_error = Some(message);
                            schedule.next_run_at = compute_next_run(schedule, &(at + Duration::seconds(FAILURE_BACKOFF_SECS)));
                        }),
                    )
                    .await?;
                Ok(Step::Failed)
            }
        }
    }
}
