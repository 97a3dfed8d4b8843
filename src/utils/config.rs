use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::notify::NotificationSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// Address the HTTP server binds to
    pub bind_address: String,

    /// Database URL
    pub database_url: String,

    /// Path or name of the backup engine binary
    pub engine_path: PathBuf,

    /// Default `-threads` passed to backup, restore and copy
    pub engine_threads: usize,

    pub scheduler_enabled: bool,

    #[serde(with = "humantime_serde_compat")]
    pub scheduler_interval: Duration,

    /// How often a progress stream polls its job
    #[serde(with = "humantime_serde_compat")]
    pub progress_poll_interval: Duration,

    /// Directory holding the single-page frontend
    pub static_dir: PathBuf,

    /// Transport and defaults for post-backup notifications
    #[serde(default)]
    pub notifications: NotificationSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8500,
            bind_address: "127.0.0.1".to_string(),
            database_url: default_database_url(),
            engine_path: PathBuf::from("duplicacy"),
            engine_threads: 16,
            scheduler_enabled: true,
            scheduler_interval: Duration::from_secs(30),
            progress_poll_interval: Duration::from_secs(1),
            static_dir: PathBuf::from("web"),
            notifications: NotificationSettings::default(),
        }
    }
}

fn default_database_url() -> String {
    let dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("backup-orchestrator");
    format!("sqlite://{}", dir.join("orchestrator.db").display())
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", name, value))
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(value.trim())
        .with_context(|| format!("Invalid duration for {}: {:?}", name, value))?;
    if duration.is_zero() {
        anyhow::bail!("{} must be greater than zero", name);
    }
    Ok(duration)
}

impl Config {
    /// Load config from the process environment
    pub fn load() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup` on top of the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(port) = lookup("BACKUP_PORT") {
            config.port = parse_var("BACKUP_PORT", &port)?;
        }

        if let Some(bind) = lookup("BACKUP_BIND") {
            config.bind_address = bind;
        }

        if let Some(db_url) = lookup("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Some(path) = lookup("DUPLICACY_PATH") {
            config.engine_path = PathBuf::from(path);
        }

        if let Some(threads) = lookup("ENGINE_THREADS") {
            config.engine_threads = parse_var("ENGINE_THREADS", &threads)?;
            if config.engine_threads == 0 {
                anyhow::bail!("ENGINE_THREADS must be at least 1");
            }
        }

        if let Some(enabled) = lookup("SCHEDULER_ENABLED") {
            config.scheduler_enabled = parse_var("SCHEDULER_ENABLED", &enabled)?;
        }

        if let Some(interval) = lookup("SCHEDULER_INTERVAL") {
            config.scheduler_interval = parse_duration("SCHEDULER_INTERVAL", &interval)?;
        }

        if let Some(interval) = lookup("PROGRESS_POLL_INTERVAL") {
            config.progress_poll_interval = parse_duration("PROGRESS_POLL_INTERVAL", &interval)?;
        }

        if let Some(dir) = lookup("STATIC_DIR") {
            config.static_dir = PathBuf::from(dir);
        }

        let hc = &mut config.notifications.healthchecks;
        if let Some(url) = lookup("HEALTHCHECKS_URL") {
            hc.url = url.trim().to_string();
        }
        if let Some(keyword) = lookup("HEALTHCHECKS_SUCCESS_KEYWORD") {
            hc.success_keyword = keyword.trim().to_string();
        }
        if let Some(send_log) = lookup("HEALTHCHECKS_SEND_LOG") {
            hc.send_log = parse_var("HEALTHCHECKS_SEND_LOG", &send_log)?;
        }
        if let Some(timeout) = lookup("HEALTHCHECKS_TIMEOUT") {
            hc.timeout_secs = parse_duration("HEALTHCHECKS_TIMEOUT", &timeout)?.as_secs().max(1);
        }

        let mail = &mut config.notifications.email;
        if let Some(host) = lookup("SMTP_HOST") {
            mail.smtp_host = host.trim().to_string();
        }
        if let Some(port) = lookup("SMTP_PORT") {
            mail.smtp_port = parse_var("SMTP_PORT", &port)?;
        }
        if let Some(user) = lookup("SMTP_USERNAME") {
            mail.smtp_username = user;
        }
        if let Some(password) = lookup("SMTP_PASSWORD") {
            mail.smtp_password = password;
        }
        if let Some(starttls) = lookup("SMTP_STARTTLS") {
            mail.smtp_starttls = parse_var("SMTP_STARTTLS", &starttls)?;
        }
        if let Some(from) = lookup("SMTP_FROM") {
            mail.from = from.trim().to_string();
        }
        if let Some(to) = lookup("NOTIFY_EMAIL_TO") {
            mail.to = to.trim().to_string();
        }
        if let Some(prefix) = lookup("NOTIFY_SUBJECT_PREFIX") {
            mail.subject_prefix = prefix.trim().to_string();
        }

        Ok(config)
    }
}

pub fn load_config() -> Result<Config> {
    Config::load()
}

mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
