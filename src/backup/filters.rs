use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const GENERATED_MARKER: &str = "# Auto-generated by backup-orchestrator";

/// Clean a user-supplied content selection into relative paths.
///
/// Backslashes become slashes, leading slashes are dropped, `..` components
/// are rejected, a trailing slash marks a directory, and duplicates go away.
pub fn normalize_content_selection(selection: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();
    for raw in selection {
        let value = raw.trim().replace('\\', "/");
        let value = value.trim_start_matches('/');
        if value.is_empty() || value == "." || value == "./" {
            continue;
        }
        if value.split('/').any(|part| part == "..") {
            continue;
        }
        let is_dir = value.ends_with('/');
        let trimmed = value.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let entry = if is_dir {
            format!("{}/", trimmed)
        } else {
            trimmed.to_string()
        };
        if !normalized.contains(&entry) {
            normalized.push(entry);
        }
    }
    normalized
}

/// Engine filter lines including only `selection`: every parent directory,
/// each selected entry, then a final exclude-everything rule.
pub fn filter_lines(selection: &[String]) -> Vec<String> {
    if selection.is_empty() {
        return Vec::new();
    }

    let mut includes: Vec<String> = Vec::new();
    let mut add = |line: String| {
        if !includes.contains(&line) {
            includes.push(line);
        }
    };

    for entry in selection {
        let is_dir = entry.ends_with('/');
        let trimmed = entry.trim_end_matches('/');
        let parts: Vec<&str> = trimmed.split('/').filter(|p| !p.is_empty()).collect();
        for i in 1..parts.len() {
            add(format!("+{}/", parts[..i].join("/")));
        }
        if is_dir {
            add(format!("+{}/", trimmed));
            add(format!("+{}/*", trimmed));
        } else {
            add(format!("+{}", trimmed));
        }
    }

    let mut lines = vec![
        GENERATED_MARKER.to_string(),
        "# Clear the content selection to back up everything again".to_string(),
    ];
    lines.extend(includes);
    lines.push("-*".to_string());
    lines
}

pub fn filters_path(repo_path: &Path) -> PathBuf {
    repo_path.join(".duplicacy").join("filters")
}

/// Bring `<repo>/.duplicacy/filters` in line with the selection.
///
/// An empty selection removes a file we generated earlier; a hand-written
/// filters file is left untouched.
pub async fn sync_filters_file(repo_path: &Path, selection: &[String]) -> Result<()> {
    let path = filters_path(repo_path);
    let selection = normalize_content_selection(selection);

    if selection.is_empty() {
        if let Ok(text) = tokio::fs::read_to_string(&path).await {
            if text.contains(GENERATED_MARKER) {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                info!("Removed generated filters file {}", path.display());
            } else {
                debug!("Keeping hand-written filters file {}", path.display());
            }
        }
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut contents = filter_lines(&selection).join("\n");
    contents.push('\n');
    tokio::fs::write(&path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    debug!("Wrote filters file {} ({} entries)", path.display(), selection.len());
    Ok(())
}
