use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const PASSWORD_ENV: &str = "DUPLICACY_PASSWORD";

/// A single engine command: arguments, working directory and the extra
/// environment layered over the server's own.
#[derive(Clone)]
pub struct Invocation {
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env<I>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(env);
        self
    }

    /// Injects the storage password under the generic name and, for a named
    /// storage, under the per-storage name the engine looks up first.
    pub fn with_password(mut self, storage: &str, password: Option<&str>) -> Self {
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            self.env.insert(PASSWORD_ENV.to_string(), password.to_string());
            if storage != "default" {
                self.env
                    .insert(storage_password_env(storage), password.to_string());
            }
        }
        self
    }

    /// Argument list for logs. Environment values are never included.
    pub fn describe(&self) -> String {
        self.args.join(" ")
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("args", &self.args)
            .field("working_dir", &self.working_dir)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub fn storage_password_env(storage: &str) -> String {
    let alias: String = storage
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("DUPLICACY_{}_PASSWORD", alias)
}

pub fn init(
    working_dir: &Path,
    snapshot_id: &str,
    storage_url: &str,
    encrypt: bool,
) -> Invocation {
    let mut inv = Invocation::new(working_dir).arg("init");
    if encrypt {
        inv = inv.arg("-e");
    }
    inv.args([snapshot_id, storage_url])
}

pub fn backup(working_dir: &Path, storage: &str, threads: usize) -> Invocation {
    Invocation::new(working_dir)
        .args(["backup", "-stats"])
        .args(["-threads".to_string(), threads.to_string()])
        .args(["-storage", storage])
}

#[derive(Debug, Clone)]
pub struct RestoreOptions<'a> {
    pub revision: u32,
    pub overwrite: bool,
    pub threads: usize,
    pub storage: &'a str,
    pub patterns: &'a [String],
}

pub fn restore(working_dir: &Path, opts: &RestoreOptions<'_>) -> Invocation {
    let mut inv = Invocation::new(working_dir)
        .args(["restore".to_string(), "-r".to_string(), opts.revision.to_string()])
        .args(["-threads".to_string(), opts.threads.to_string()])
        .args(["-storage", opts.storage]);
    if opts.overwrite {
        inv = inv.arg("-overwrite");
    }
    let patterns: Vec<&String> = opts.patterns.iter().filter(|p| !p.trim().is_empty()).collect();
    if !patterns.is_empty() {
        inv = inv.arg("--").args(patterns.into_iter().cloned());
    }
    inv
}

pub fn list_snapshots(working_dir: &Path, storage: &str) -> Invocation {
    Invocation::new(working_dir).args(["list", "-storage", storage])
}

pub fn list_files(working_dir: &Path, storage: &str, revision: u32) -> Invocation {
    Invocation::new(working_dir)
        .args(["list", "-files"])
        .args(["-r".to_string(), revision.to_string()])
        .args(["-storage", storage])
}

pub fn copy(working_dir: &Path, from: &str, to: &str, threads: usize) -> Invocation {
    Invocation::new(working_dir)
        .args(["copy", "-from", from, "-to", to])
        .args(["-threads".to_string(), threads.to_string()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_arguments() {
        let inv = backup(Path::new("/data"), "offsite", 8);
        assert_eq!(
            inv.args,
            vec!["backup", "-stats", "-threads", "8", "-storage", "offsite"]
        );
        assert_eq!(inv.working_dir, PathBuf::from("/data"));
    }

    #[test]
    fn test_restore_patterns_follow_separator() {
        let patterns = vec!["+docs/*".to_string(), "  ".to_string()];
        let inv = restore(
            Path::new("/data"),
            &RestoreOptions {
                revision: 7,
                overwrite: true,
                threads: 4,
                storage: "default",
                patterns: &patterns,
            },
        );
        assert_eq!(
            inv.args,
            vec![
                "restore", "-r", "7", "-threads", "4", "-storage", "default", "-overwrite", "--",
                "+docs/*"
            ]
        );
    }

    #[test]
    fn test_password_env_for_named_storage() {
        let inv = list_snapshots(Path::new("/data"), "s-1a2b")
            .with_password("s-1a2b", Some("hunter2"));
        assert_eq!(inv.env.get("DUPLICACY_PASSWORD").map(String::as_str), Some("hunter2"));
        assert_eq!(
            inv.env.get("DUPLICACY_S_1A2B_PASSWORD").map(String::as_str),
            Some("hunter2")
        );
    }

    #[test]
    fn test_empty_password_is_ignored() {
        let inv = list_snapshots(Path::new("/data"), "default").with_password("default", Some(""));
        assert!(inv.env.is_empty());
    }

    #[test]
    fn test_debug_output_hides_env_values() {
        let inv = init(Path::new("/data"), "laptop", "/mnt/store", true)
            .with_password("default", Some("secret-value"));
        let rendered = format!("{:?}", inv);
        assert!(rendered.contains("DUPLICACY_PASSWORD"));
        assert!(!rendered.contains("secret-value"));
        assert_eq!(inv.describe(), "init -e laptop /mnt/store");
    }
}
