pub mod filters;
pub mod manager;
pub mod runner;
pub mod summary;

pub use manager::BackupManager;
pub use summary::{ChangeReport, ChangeSummary};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::jobs::Trigger;
use crate::notify::RepoNotifications;
use crate::scheduler::{LastRunStatus, ScheduleConfig};

/// Number of output characters kept on the repository after a backup.
pub const OUTPUT_TAIL_CHARS: usize = 500;

/// A backend the engine can write revisions to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageTarget {
    /// Alias passed to `-storage`.
    pub name: String,
    pub label: String,
    pub url: String,
    pub is_default: bool,
    /// Extra environment for this backend (credentials, endpoints).
    pub env: BTreeMap<String, String>,
}

impl StorageTarget {
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.name
        } else {
            &self.label
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Replication {
    pub enabled: bool,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// A directory protected by the engine, with its storages and schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub snapshot_id: String,
    #[serde(default)]
    pub storages: Vec<StorageTarget>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub content_selection: Vec<String>,
    #[serde(default)]
    pub replication: Replication,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub notifications: RepoNotifications,
    #[serde(default)]
    pub last_backup: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_backup_status: Option<LastRunStatus>,
    #[serde(default)]
    pub last_backup_trigger: Option<Trigger>,
    #[serde(default)]
    pub last_backup_output: Option<String>,
    #[serde(default)]
    pub last_backup_summary: Option<ChangeReport>,
    pub created_at: DateTime<Utc>,
}

impl Repository {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, snapshot_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            path: path.into(),
            snapshot_id: snapshot_id.into(),
            storages: Vec::new(),
            password: None,
            encrypted: false,
            content_selection: Vec::new(),
            replication: Replication::default(),
            schedule: ScheduleConfig::default(),
            notifications: RepoNotifications::default(),
            last_backup: None,
            last_backup_status: None,
            last_backup_trigger: None,
            last_backup_output: None,
            last_backup_summary: None,
            created_at: Utc::now(),
        }
    }

    /// The storage flagged default, else the first one.
    pub fn primary_storage(&self) -> Option<&StorageTarget> {
        self.storages
            .iter()
            .find(|s| s.is_default)
            .or_else(|| self.storages.first())
    }

    pub fn storage(&self, name: &str) -> Option<&StorageTarget> {
        self.storages.iter().find(|s| s.name == name)
    }

    /// JSON for API responses: the password is replaced by `hasPassword`.
    pub fn to_public_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.remove("password");
            map.insert(
                "hasPassword".to_string(),
                serde_json::Value::Bool(self.password.as_deref().is_some_and(|p| !p.is_empty())),
            );
            for storage in map
                .get_mut("storages")
                .and_then(|s| s.as_array_mut())
                .into_iter()
                .flatten()
            {
                if let Some(env) = storage.get_mut("env").and_then(|e| e.as_object_mut()) {
                    for v in env.values_mut() {
                        *v = serde_json::Value::String("********".to_string());
                    }
                }
            }
        }
        value
    }
}

/// A storage registered on its own, so revisions can be restored from it on a
/// machine that never ran the backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl StorageRecord {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            url: url.into(),
            password: None,
            env: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn to_public_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "url": self.url,
            "hasPassword": self.password.as_deref().is_some_and(|p| !p.is_empty()),
            "envKeys": self.env.keys().collect::<Vec<_>>(),
            "createdAt": self.created_at,
        })
    }
}

/// Extra engine environment for one storage of a repository.
pub trait EnvResolver: Send + Sync {
    fn storage_env(&self, repo: &Repository, storage: &str) -> BTreeMap<String, String>;
}

/// Uses the environment stored on the matching storage record as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordEnvResolver;

impl EnvResolver for RecordEnvResolver {
    fn storage_env(&self, repo: &Repository, storage: &str) -> BTreeMap<String, String> {
        repo.storage(storage).map(|s| s.env.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str, is_default: bool) -> StorageTarget {
        StorageTarget {
            name: name.to_string(),
            url: format!("/mnt/{}", name),
            is_default,
            ..Default::default()
        }
    }

    #[test]
    fn test_primary_storage_prefers_default_flag() {
        let mut repo = Repository::new("Laptop", "/home/me", "laptop");
        assert!(repo.primary_storage().is_none());

        repo.storages = vec![target("usb", false), target("nas", true)];
        assert_eq!(repo.primary_storage().unwrap().name, "nas");

        repo.storages[1].is_default = false;
        assert_eq!(repo.primary_storage().unwrap().name, "usb");
    }

    #[test]
    fn test_public_json_hides_secrets() {
        let mut repo = Repository::new("Laptop", "/home/me", "laptop");
        repo.password = Some("hunter2".to_string());
        let mut s3 = target("s3", true);
        s3.env.insert("DUPLICACY_S3_SECRET".to_string(), "abc".to_string());
        repo.storages.push(s3);

        let json = repo.to_public_json();
        let text = json.to_string();
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("\"abc\""));
        assert_eq!(json["hasPassword"], true);
        assert_eq!(json["snapshotId"], "laptop");
    }

    #[test]
    fn test_storage_record_public_json_hides_secrets() {
        let mut record = StorageRecord::new("Offsite", "s3://eu/bucket");
        record.password = Some("hunter2".to_string());
        record.env.insert("DUPLICACY_S3_SECRET".to_string(), "abc".to_string());

        let json = record.to_public_json();
        let text = json.to_string();
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("\"abc\""));
        assert_eq!(json["hasPassword"], true);
        assert_eq!(json["envKeys"][0], "DUPLICACY_S3_SECRET");
    }

    #[test]
    fn test_record_env_resolver() {
        let mut repo = Repository::new("Laptop", "/home/me", "laptop");
        let mut nas = target("nas", true);
        nas.env.insert("SSH_KEY_FILE".to_string(), "/keys/nas".to_string());
        repo.storages.push(nas);

        let env = RecordEnvResolver.storage_env(&repo, "nas");
        assert_eq!(env.get("SSH_KEY_FILE").map(String::as_str), Some("/keys/nas"));
        assert!(RecordEnvResolver.storage_env(&repo, "missing").is_empty());
    }
}
