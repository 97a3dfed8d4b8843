//! What a backup changed, derived by diffing the file listings of the
//! revision it created and the one before it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::engine::{commands, parse, EngineClient, EngineError, FileEntry, SnapshotInfo};

pub const SAMPLE_LIMIT: usize = 12;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSamples {
    pub new: Vec<String>,
    pub changed: Vec<String>,
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    pub created_revision: u32,
    pub previous_revision: Option<u32>,
    pub file_count: usize,
    pub new_count: usize,
    pub changed_count: usize,
    pub deleted_count: usize,
    pub unchanged: bool,
    pub samples: ChangeSamples,
}

impl ChangeSummary {
    /// No new revision was produced.
    pub fn no_new_revision(revision: u32, previous_revision: Option<u32>) -> Self {
        Self {
            created_revision: revision,
            previous_revision,
            file_count: 0,
            new_count: 0,
            changed_count: 0,
            deleted_count: 0,
            unchanged: true,
            samples: ChangeSamples::default(),
        }
    }

    pub fn describe(&self) -> String {
        if self.unchanged {
            return format!("No changes (latest revision #{})", self.created_revision);
        }
        let previous = self
            .previous_revision
            .map(|r| format!("#{}", r))
            .unwrap_or_else(|| "none".to_string());
        format!(
            "Revision #{} vs {}: {} new, {} changed, {} deleted",
            self.created_revision, previous, self.new_count, self.changed_count, self.deleted_count
        )
    }
}

/// Summary of a backup, or why it could not be computed. Never fails the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChangeReport {
    Available(ChangeSummary),
    #[serde(rename_all = "camelCase")]
    Unavailable {
        message: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        detail: String,
    },
}

impl ChangeReport {
    pub fn unavailable(message: impl Into<String>, detail: impl Into<String>) -> Self {
        ChangeReport::Unavailable {
            message: message.into(),
            detail: detail.into(),
        }
    }

    pub fn summary(&self) -> Option<&ChangeSummary> {
        match self {
            ChangeReport::Available(summary) => Some(summary),
            ChangeReport::Unavailable { .. } => None,
        }
    }
}

/// Path to signature, directories excluded.
pub fn signature_map(entries: &[FileEntry]) -> BTreeMap<String, String> {
    entries
        .iter()
        .filter(|e| !e.is_dir() && !e.path.trim().is_empty())
        .map(|e| (e.path.trim().to_string(), e.signature()))
        .collect()
}

fn sample(paths: &[&String]) -> Vec<String> {
    paths.iter().take(SAMPLE_LIMIT).map(|p| (*p).clone()).collect()
}

/// Compare two listings. An absent previous listing makes every file new.
pub fn diff_listings(
    created_revision: u32,
    previous_revision: Option<u32>,
    latest: &[FileEntry],
    previous: Option<&[FileEntry]>,
) -> ChangeSummary {
    let latest = signature_map(latest);
    let previous = previous.map(signature_map).unwrap_or_default();

    // BTreeMap keys iterate sorted, so the samples are deterministic.
    let new: Vec<&String> = latest.keys().filter(|p| !previous.contains_key(*p)).collect();
    let deleted: Vec<&String> = previous.keys().filter(|p| !latest.contains_key(*p)).collect();
    let changed: Vec<&String> = latest
        .iter()
        .filter(|(path, sig)| previous.get(*path).is_some_and(|prev| prev != *sig))
        .map(|(path, _)| path)
        .collect();

    ChangeSummary {
        created_revision,
        previous_revision,
        file_count: latest.len(),
        new_count: new.len(),
        changed_count: changed.len(),
        deleted_count: deleted.len(),
        unchanged: new.is_empty() && changed.is_empty() && deleted.is_empty(),
        samples: ChangeSamples {
            new: sample(&new),
            changed: sample(&changed),
            deleted: sample(&deleted),
        },
    }
}

/// Listing calls the summary needs from the engine.
#[async_trait]
pub trait RevisionLister: Send + Sync {
    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, EngineError>;
    async fn list_files(&self, revision: u32) -> Result<Vec<FileEntry>, EngineError>;
}

/// Lists one repository's snapshots on one storage through the engine.
pub struct EngineLister {
    engine: EngineClient,
    working_dir: PathBuf,
    storage: String,
    env: BTreeMap<String, String>,
    password: Option<String>,
}

impl EngineLister {
    pub fn new(
        engine: EngineClient,
        working_dir: impl Into<PathBuf>,
        storage: impl Into<String>,
        env: BTreeMap<String, String>,
        password: Option<String>,
    ) -> Self {
        Self {
            engine,
            working_dir: working_dir.into(),
            storage: storage.into(),
            env,
            password,
        }
    }

    fn prepare(&self, invocation: commands::Invocation) -> commands::Invocation {
        invocation
            .with_env(self.env.clone())
            .with_password(&self.storage, self.password.as_deref())
    }
}

#[async_trait]
impl RevisionLister for EngineLister {
    async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, EngineError> {
        let inv = self.prepare(commands::list_snapshots(&self.working_dir, &self.storage));
        self.engine.list_snapshots(&inv).await
    }

    async fn list_files(&self, revision: u32) -> Result<Vec<FileEntry>, EngineError> {
        let inv = self.prepare(commands::list_files(&self.working_dir, &self.storage, revision));
        self.engine.list_files(&inv).await
    }
}

/// Latest revision recorded for `snapshot_id`, if the listing succeeds.
pub async fn latest_revision(lister: &dyn RevisionLister, snapshot_id: &str) -> Option<u32> {
    match lister.list_snapshots().await {
        Ok(snapshots) => parse::revisions_for(&snapshots, snapshot_id).last().copied(),
        Err(e) => {
            warn!("Could not read latest revision before backup: {}", e);
            None
        }
    }
}

/// Build the report for a backup that just succeeded.
///
/// `pre_latest` is the latest revision seen before the backup ran; when the
/// backup left it unchanged no file listing is requested at all.
pub async fn summarize_backup(
    lister: &dyn RevisionLister,
    snapshot_id: &str,
    pre_latest: Option<u32>,
) -> ChangeReport {
    let snapshots = match lister.list_snapshots().await {
        Ok(snapshots) => snapshots,
        Err(e) => {
            return ChangeReport::unavailable("Could not list snapshots after backup", error_detail(&e))
        }
    };

    let revisions = parse::revisions_for(&snapshots, snapshot_id);
    let Some(&latest) = revisions.last() else {
        return ChangeReport::unavailable("No revisions found for snapshot", "");
    };

    let previous = match pre_latest {
        Some(pre) if pre != latest && revisions.contains(&pre) => Some(pre),
        _ if revisions.len() >= 2 => Some(revisions[revisions.len() - 2]),
        _ => None,
    };

    if pre_latest == Some(latest) {
        debug!("Backup produced no new revision (latest #{})", latest);
        return ChangeReport::Available(ChangeSummary::no_new_revision(latest, previous));
    }

    let latest_files = match lister.list_files(latest).await {
        Ok(files) => files,
        Err(e) => {
            return ChangeReport::unavailable(
                format!("Could not list files of revision #{}", latest),
                error_detail(&e),
            )
        }
    };

    let previous_files = match previous {
        Some(revision) => match lister.list_files(revision).await {
            Ok(files) => Some(files),
            Err(e) => {
                warn!("Listing previous revision #{} failed, treating it as empty: {}", revision, e);
                None
            }
        },
        None => None,
    };

    ChangeReport::Available(diff_listings(latest, previous, &latest_files, previous_files.as_deref()))
}

fn error_detail(err: &EngineError) -> String {
    match err {
        EngineError::Exit { detail, .. } => detail.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(path: &str, hash: &str) -> FileEntry {
        FileEntry {
            size: 10,
            modified: "2026-05-01 10:00:00".to_string(),
            hash: Some(hash.to_string()),
            path: path.to_string(),
        }
    }

    fn snapshot(revision: u32) -> SnapshotInfo {
        SnapshotInfo {
            id: "laptop".to_string(),
            revision,
            created_at: "2026-05-01 23:00".to_string(),
        }
    }

    fn exit_error(detail: &str) -> EngineError {
        EngineError::Exit {
            command: "list".to_string(),
            code: 100,
            detail: detail.to_string(),
        }
    }

    struct FakeLister {
        revisions: Vec<u32>,
        files: BTreeMap<u32, Vec<FileEntry>>,
        snapshot_calls: AtomicUsize,
        file_calls: AtomicUsize,
    }

    impl FakeLister {
        fn new(revisions: Vec<u32>) -> Self {
            Self {
                revisions,
                files: BTreeMap::new(),
                snapshot_calls: AtomicUsize::new(0),
                file_calls: AtomicUsize::new(0),
            }
        }

        fn with_files(mut self, revision: u32, files: Vec<FileEntry>) -> Self {
            self.files.insert(revision, files);
            self
        }
    }

    #[async_trait]
    impl RevisionLister for FakeLister {
        async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>, EngineError> {
            self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.revisions.iter().copied().map(snapshot).collect())
        }

        async fn list_files(&self, revision: u32) -> Result<Vec<FileEntry>, EngineError> {
            self.file_calls.fetch_add(1, Ordering::SeqCst);
            self.files
                .get(&revision)
                .cloned()
                .ok_or_else(|| exit_error("revision not found"))
        }
    }

    #[test]
    fn test_diff_new_changed_deleted() {
        let latest = vec![entry("a", "h1"), entry("b", "h2"), entry("dir/", "")];
        let previous = vec![entry("a", "h1"), entry("c", "h3")];

        let summary = diff_listings(5, Some(4), &latest, Some(&previous));

        assert_eq!(summary.samples.new, vec!["b"]);
        assert_eq!(summary.samples.deleted, vec!["c"]);
        assert!(summary.samples.changed.is_empty());
        assert_eq!((summary.new_count, summary.changed_count, summary.deleted_count), (1, 0, 1));
        assert_eq!(summary.file_count, 2);
        assert!(!summary.unchanged);
    }

    #[test]
    fn test_diff_detects_changed_signature_and_caps_samples() {
        let latest: Vec<FileEntry> = (0..20).map(|i| entry(&format!("f{:02}", i), "new")).collect();
        let previous: Vec<FileEntry> = (0..20).map(|i| entry(&format!("f{:02}", i), "old")).collect();

        let summary = diff_listings(2, Some(1), &latest, Some(&previous));

        assert_eq!(summary.changed_count, 20);
        assert_eq!(summary.samples.changed.len(), SAMPLE_LIMIT);
        assert_eq!(summary.samples.changed[0], "f00");
        assert_eq!(summary.samples.changed[11], "f11");
    }

    #[test]
    fn test_missing_previous_makes_everything_new() {
        let summary = diff_listings(1, None, &[entry("a", "h1")], None);
        assert_eq!(summary.new_count, 1);
        assert_eq!(summary.previous_revision, None);
    }

    #[tokio::test]
    async fn test_unchanged_short_circuit_skips_file_listing() {
        let lister = FakeLister::new(vec![3, 4]);

        let report = summarize_backup(&lister, "laptop", Some(4)).await;

        let summary = report.summary().unwrap();
        assert!(summary.unchanged);
        assert_eq!(summary.created_revision, 4);
        assert_eq!((summary.new_count, summary.changed_count, summary.deleted_count), (0, 0, 0));
        assert_eq!(lister.file_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_compares_against_pre_backup_revision() {
        let lister = FakeLister::new(vec![1, 2, 5])
            .with_files(5, vec![entry("a", "h1"), entry("b", "h2")])
            .with_files(2, vec![entry("a", "h1"), entry("c", "h3")]);

        let report = summarize_backup(&lister, "laptop", Some(2)).await;

        let summary = report.summary().unwrap();
        assert_eq!(summary.created_revision, 5);
        assert_eq!(summary.previous_revision, Some(2));
        assert_eq!(summary.samples.new, vec!["b"]);
        assert_eq!(summary.samples.deleted, vec!["c"]);
        assert_eq!(lister.file_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_previous_listing_counts_all_as_new() {
        let lister = FakeLister::new(vec![1, 2]).with_files(2, vec![entry("a", "h1"), entry("b", "h2")]);

        let report = summarize_backup(&lister, "laptop", None).await;

        let summary = report.summary().unwrap();
        assert_eq!(summary.previous_revision, Some(1));
        assert_eq!(summary.new_count, 2);
    }

    #[tokio::test]
    async fn test_failed_latest_listing_is_unavailable() {
        let lister = FakeLister::new(vec![7]);

        let report = summarize_backup(&lister, "laptop", None).await;

        match report {
            ChangeReport::Unavailable { message, detail } => {
                assert!(message.contains("#7"));
                assert_eq!(detail, "revision not found");
            }
            other => panic!("unexpected report: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_revisions_is_unavailable() {
        let lister = FakeLister::new(vec![]);
        let report = summarize_backup(&lister, "laptop", None).await;
        assert!(report.summary().is_none());
        assert_eq!(lister.snapshot_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_report_roundtrips_through_json() {
        let unavailable = ChangeReport::unavailable("Could not list", "");
        let json = serde_json::to_value(&unavailable).unwrap();
        assert_eq!(json, serde_json::json!({"message": "Could not list"}));
        let back: ChangeReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, unavailable);

        let available = ChangeReport::Available(ChangeSummary::no_new_revision(3, Some(2)));
        let back: ChangeReport = serde_json::from_value(serde_json::to_value(&available).unwrap()).unwrap();
        assert_eq!(back, available);
    }
}
