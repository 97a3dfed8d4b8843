use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static SNAPSHOT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Snapshot\s+(\S+)\s+revision\s+(\d+)\s+created\s+at\s+(.+)")
        .expect("snapshot pattern is valid")
});

// <size> <yyyy-mm-dd> <hh:mm:ss> [<hash>] <path>
static FILE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\d+)\s+(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2})\s+(?:([0-9a-fA-F]{16,})\s+)?(\S.*?)\s*$")
        .expect("file pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub id: String,
    pub revision: u32,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
    pub modified: String,
    pub hash: Option<String>,
    pub path: String,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.path.ends_with('/') || self.path.ends_with('\\')
    }

    /// Fingerprint used to detect content change between revisions.
    pub fn signature(&self) -> String {
        format!(
            "{}|{}|{}",
            self.size,
            self.modified,
            self.hash.as_deref().unwrap_or("")
        )
    }
}

pub fn parse_snapshot_list(output: &str) -> Vec<SnapshotInfo> {
    output
        .lines()
        .filter_map(|line| {
            let caps = SNAPSHOT_LINE.captures(line)?;
            let revision = caps[2].parse().ok()?;
            Some(SnapshotInfo {
                id: caps[1].to_string(),
                revision,
                created_at: caps[3].trim().to_string(),
            })
        })
        .collect()
}

pub fn parse_file_list(output: &str) -> Vec<FileEntry> {
    output
        .lines()
        .filter_map(|line| {
            let caps = FILE_LINE.captures(line)?;
            Some(FileEntry {
                size: caps[1].parse().ok()?,
                modified: caps[2].split_whitespace().collect::<Vec<_>>().join(" "),
                hash: caps.get(3).map(|m| m.as_str().to_lowercase()),
                path: caps[4].to_string(),
            })
        })
        .collect()
}

/// Sorted, de-duplicated revision numbers recorded for one snapshot id.
pub fn revisions_for(snapshots: &[SnapshotInfo], snapshot_id: &str) -> Vec<u32> {
    let mut revisions: Vec<u32> = snapshots
        .iter()
        .filter(|s| s.id == snapshot_id)
        .map(|s| s.revision)
        .collect();
    revisions.sort_unstable();
    revisions.dedup();
    revisions
}
