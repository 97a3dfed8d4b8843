//! Reports sent after a successful backup: a Healthchecks ping and an
//! email over SMTP.
//!
//! Global settings come from the server configuration and provide the
//! transport (ping URL, SMTP relay) and defaults. Whether a channel fires is
//! decided per repository only.

pub mod transport;

pub use transport::{NetworkTransport, NotificationTransport};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backup::ChangeReport;
use crate::jobs::{tail, Trigger};

pub const DEFAULT_SUCCESS_KEYWORD: &str = "success";
pub const DEFAULT_SUBJECT_PREFIX: &str = "[Backup]";

const PING_LOG_CHARS: usize = 32_000;
const EMAIL_LOG_CHARS: usize = 180_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthchecksSettings {
    pub enabled: bool,
    pub url: String,
    /// First line of the ping body; Healthchecks matches it to mark success.
    pub success_keyword: String,
    pub send_log: bool,
    pub timeout_secs: u64,
}

impl Default for HealthchecksSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            success_keyword: DEFAULT_SUCCESS_KEYWORD.to_string(),
            send_log: true,
            timeout_secs: 10,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmailSettings {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub smtp_starttls: bool,
    pub from: String,
    /// One address or a comma separated list.
    pub to: String,
    pub subject_prefix: String,
    pub send_log: bool,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            smtp_starttls: true,
            from: String::new(),
            to: String::new(),
            subject_prefix: DEFAULT_SUBJECT_PREFIX.to_string(),
            send_log: true,
        }
    }
}

impl std::fmt::Debug for EmailSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailSettings")
            .field("enabled", &self.enabled)
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("smtp_username", &self.smtp_username)
            .field("smtp_starttls", &self.smtp_starttls)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("subject_prefix", &self.subject_prefix)
            .field("send_log", &self.send_log)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub healthchecks: HealthchecksSettings,
    pub email: EmailSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthchecksOverride {
    pub enabled: bool,
    pub url: Option<String>,
    pub success_keyword: Option<String>,
    pub send_log: Option<bool>,
}

/// The SMTP relay always comes from the global settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmailOverride {
    pub enabled: bool,
    pub to: Option<String>,
    pub subject_prefix: Option<String>,
    pub send_log: Option<bool>,
}

/// Notification switches stored on a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoNotifications {
    pub healthchecks: HealthchecksOverride,
    pub email: EmailOverride,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl NotificationSettings {
    /// Settings for one repository. The global `enabled` flags are ignored.
    pub fn merged_with(&self, repo: &RepoNotifications) -> NotificationSettings {
        let mut merged = self.clone();

        let hc = &repo.healthchecks;
        merged.healthchecks.enabled = hc.enabled;
        if let Some(url) = non_empty(&hc.url) {
            merged.healthchecks.url = url;
        }
        if let Some(keyword) = non_empty(&hc.success_keyword) {
            merged.healthchecks.success_keyword = keyword;
        }
        if let Some(send_log) = hc.send_log {
            merged.healthchecks.send_log = send_log;
        }

        let mail = &repo.email;
        merged.email.enabled = mail.enabled;
        if let Some(to) = non_empty(&mail.to) {
            merged.email.to = to;
        }
        if let Some(prefix) = non_empty(&mail.subject_prefix) {
            merged.email.subject_prefix = prefix;
        }
        if let Some(send_log) = mail.send_log {
            merged.email.send_log = send_log;
        }

        merged
    }

    /// Reject enabled channels that can never deliver.
    pub fn validate(&self) -> Result<(), String> {
        if self.healthchecks.enabled && self.healthchecks.url.trim().is_empty() {
            return Err("Healthchecks notifications need a ping URL".to_string());
        }
        if self.email.enabled {
            if self.email.to.trim().is_empty() {
                return Err("Email notifications need a recipient".to_string());
            }
            if self.email.smtp_host.trim().is_empty() || self.email.from.trim().is_empty() {
                return Err("Email notifications need an SMTP host and sender configured on the server".to_string());
            }
        }
        Ok(())
    }

    pub fn keyword(&self) -> &str {
        match self.healthchecks.success_keyword.trim() {
            "" => DEFAULT_SUCCESS_KEYWORD,
            keyword => keyword,
        }
    }

    fn subject_prefix(&self) -> &str {
        match self.email.subject_prefix.trim() {
            "" => DEFAULT_SUBJECT_PREFIX,
            prefix => prefix,
        }
    }
}

/// What a notification says about one finished backup.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub repo_name: String,
    pub snapshot_id: String,
    pub trigger: Trigger,
    pub source_path: String,
    pub target: String,
    pub finished_at: DateTime<Utc>,
    pub duration_s: Option<f64>,
    pub summary: Option<ChangeReport>,
    pub log: String,
}

impl BackupReport {
    /// Plain text body. The first line is the keyword Healthchecks matches on.
    pub fn render(&self, keyword: &str, include_log: bool, max_log_chars: usize) -> String {
        let mut lines = vec![
            keyword.trim().to_string(),
            format!("Backup: {}", self.repo_name),
            format!("Snapshot ID: {}", self.snapshot_id),
            format!("Trigger: {}", self.trigger),
            format!("Source: {}", self.source_path),
            format!("Target: {}", self.target),
            format!("Finished: {}", self.finished_at.to_rfc3339()),
        ];
        if let Some(duration) = self.duration_s {
            lines.push(format!("Duration (s): {:.2}", duration));
        }

        match &self.summary {
            Some(ChangeReport::Available(summary)) => {
                lines.push(format!("Revision created: #{}", summary.created_revision));
                if let Some(previous) = summary.previous_revision {
                    lines.push(format!("Previous revision: #{}", previous));
                }
                lines.push(format!("Files in snapshot: {}", summary.file_count));
                lines.push(format!(
                    "Changes: new={} changed={} deleted={}",
                    summary.new_count, summary.changed_count, summary.deleted_count
                ));
            }
            Some(ChangeReport::Unavailable { message, .. }) => lines.push(format!("Summary: {}", message)),
            None => {}
        }

        let log = self.log.trim();
        if include_log && !log.is_empty() {
            let log = if log.chars().count() > max_log_chars {
                lines.push(format!("(Log truncated to the last {} characters)", max_log_chars));
                tail(log, max_log_chars)
            } else {
                log.to_string()
            };
            lines.push(String::new());
            lines.push("=== BACKUP LOG ===".to_string());
            lines.push(log);
        }

        lines.join("\n")
    }

    fn title(&self) -> &str {
        if !self.repo_name.is_empty() {
            &self.repo_name
        } else if !self.snapshot_id.is_empty() {
            &self.snapshot_id
        } else {
            "backup"
        }
    }
}

/// Keep stray "success" words from matching when another keyword is configured.
pub fn sanitize_for_keyword(text: &str, keyword: &str) -> String {
    if keyword.trim().eq_ignore_ascii_case(DEFAULT_SUCCESS_KEYWORD) {
        return text.to_string();
    }
    text.replace("success", "signal")
        .replace("Success", "Signal")
        .replace("SUCCESS", "SIGNAL")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Delivery {
    Sent,
    Skipped,
    Failed { error: String },
}

impl Delivery {
    fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Delivery::Sent,
            Err(e) => Delivery::Failed {
                error: format!("{:#}", e),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub healthchecks: Delivery,
    pub email: Delivery,
}

impl DeliveryReport {
    pub fn any_sent(&self) -> bool {
        self.healthchecks == Delivery::Sent || self.email == Delivery::Sent
    }

    pub fn any_failed(&self) -> bool {
        matches!(self.healthchecks, Delivery::Failed { .. }) || matches!(self.email, Delivery::Failed { .. })
    }
}

#[derive(Clone)]
pub struct Notifier {
    defaults: NotificationSettings,
    transport: Arc<dyn NotificationTransport>,
}

impl Notifier {
    pub fn new(defaults: NotificationSettings, transport: Arc<dyn NotificationTransport>) -> Self {
        Self { defaults, transport }
    }

    pub fn settings_for(&self, repo: &RepoNotifications) -> NotificationSettings {
        self.defaults.merged_with(repo)
    }

    /// Deliver `report` on every channel the repository enabled. Delivery
    /// problems are logged and returned, never raised.
    pub async fn deliver(&self, repo: &RepoNotifications, report: &BackupReport, subject_tag: &str) -> DeliveryReport {
        let settings = self.settings_for(repo);
        let keyword = settings.keyword();
        let hc = &settings.healthchecks;
        let mail = &settings.email;

        let ping = async {
            if !hc.enabled {
                return Delivery::Skipped;
            }
            if hc.url.trim().is_empty() {
                return Delivery::Failed {
                    error: "no Healthchecks ping URL configured".to_string(),
                };
            }
            let body = sanitize_for_keyword(&report.render(keyword, hc.send_log, PING_LOG_CHARS), keyword);
            Delivery::from_result(self.transport.ping(hc, body).await)
        };

        let email = async {
            if !mail.enabled {
                return Delivery::Skipped;
            }
            if mail.smtp_host.trim().is_empty() || mail.to.trim().is_empty() {
                return Delivery::Failed {
                    error: "no SMTP host or recipient configured".to_string(),
                };
            }
            let body = sanitize_for_keyword(&report.render(keyword, mail.send_log, EMAIL_LOG_CHARS), keyword);
            let subject = format!("{} {} - {} - {}", settings.subject_prefix(), keyword, subject_tag, report.title());
            Delivery::from_result(self.transport.send_email(mail, subject, body).await)
        };

        let (healthchecks, email) = tokio::join!(ping, email);
        let delivery = DeliveryReport { healthchecks, email };

        for (channel, outcome) in [("healthchecks", &delivery.healthchecks), ("email", &delivery.email)] {
            match outcome {
                Delivery::Sent => info!(channel, backup = %report.title(), "Notification sent"),
                Delivery::Failed { error } => {
                    warn!(channel, backup = %report.title(), "Notification failed: {}", error)
                }
                Delivery::Skipped => {}
            }
        }
        delivery
    }

    pub async fn backup_succeeded(&self, repo: &RepoNotifications, report: &BackupReport) -> DeliveryReport {
        self.deliver(repo, report, "Backup OK").await
    }

    /// Send a sample report through the same path a real backup uses.
    pub async fn send_test(&self, repo: &RepoNotifications, repo_name: &str, snapshot_id: &str) -> DeliveryReport {
        let report = BackupReport {
            repo_name: repo_name.to_string(),
            snapshot_id: snapshot_id.to_string(),
            trigger: Trigger::Manual,
            source_path: "-".to_string(),
            target: "-".to_string(),
            finished_at: Utc::now(),
            duration_s: Some(0.0),
            summary: Some(ChangeReport::unavailable("Test notification", "")),
            log: "Test notification from the backup orchestrator.".to_string(),
        };
        self.deliver(repo, &report, "Test notification").await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{RecordingTransport, Sent};
    use super::*;
    use crate::backup::ChangeSummary;

    fn globals() -> NotificationSettings {
        NotificationSettings {
            healthchecks: HealthchecksSettings {
                enabled: true,
                url: "https://hc.example/ping/global".to_string(),
                ..Default::default()
            },
            email: EmailSettings {
                enabled: true,
                smtp_host: "smtp.example".to_string(),
                from: "backup@example.com".to_string(),
                to: "ops@example.com".to_string(),
                subject_prefix: "[X]".to_string(),
                ..Default::default()
            },
        }
    }

    fn report() -> BackupReport {
        BackupReport {
            repo_name: "Laptop".to_string(),
            snapshot_id: "laptop".to_string(),
            trigger: Trigger::Scheduled,
            source_path: "/home/me".to_string(),
            target: "USB disk".to_string(),
            finished_at: Utc::now(),
            duration_s: Some(12.5),
            summary: Some(ChangeReport::Available(ChangeSummary {
                created_revision: 8,
                previous_revision: Some(7),
                file_count: 120,
                new_count: 3,
                changed_count: 1,
                deleted_count: 0,
                unchanged: false,
                samples: Default::default(),
            })),
            log: "Backup for /home/me at revision 8 completed successfully".to_string(),
        }
    }

    #[test]
    fn test_global_settings_do_not_enable_channels() {
        let merged = globals().merged_with(&RepoNotifications::default());
        assert!(!merged.healthchecks.enabled);
        assert!(!merged.email.enabled);
        assert_eq!(merged.healthchecks.url, "https://hc.example/ping/global");
        assert_eq!(merged.email.smtp_host, "smtp.example");
    }

    #[test]
    fn test_repository_overrides_apply_per_channel() {
        let repo = RepoNotifications {
            healthchecks: HealthchecksOverride {
                enabled: true,
                url: Some("https://hc.example/ping/laptop".to_string()),
                success_keyword: Some("ok".to_string()),
                send_log: Some(false),
            },
            email: EmailOverride {
                enabled: false,
                to: Some("me@example.com".to_string()),
                subject_prefix: Some("LAPTOP".to_string()),
                send_log: Some(false),
            },
        };
        let merged = globals().merged_with(&repo);

        assert!(merged.healthchecks.enabled);
        assert_eq!(merged.healthchecks.url, "https://hc.example/ping/laptop");
        assert_eq!(merged.keyword(), "ok");
        assert!(!merged.healthchecks.send_log);
        assert!(!merged.email.enabled);
        assert_eq!(merged.email.smtp_host, "smtp.example");
        assert_eq!(merged.email.to, "me@example.com");
        assert_eq!(merged.email.subject_prefix, "LAPTOP");

        let blank = RepoNotifications {
            healthchecks: HealthchecksOverride {
                enabled: true,
                success_keyword: Some("  ".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(globals().merged_with(&blank).keyword(), "success");
    }

    #[test]
    fn test_validate_rejects_undeliverable_channels() {
        let mut settings = NotificationSettings::default();
        assert!(settings.validate().is_ok());

        settings.healthchecks.enabled = true;
        assert!(settings.validate().unwrap_err().contains("ping URL"));
        settings.healthchecks.url = "https://hc.example/ping/x".to_string();
        assert!(settings.validate().is_ok());

        settings.email.enabled = true;
        assert!(settings.validate().unwrap_err().contains("recipient"));
        settings.email.to = "me@example.com".to_string();
        assert!(settings.validate().unwrap_err().contains("SMTP"));
        settings.email.smtp_host = "smtp.example".to_string();
        settings.email.from = "backup@example.com".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_report_starts_with_configured_keyword() {
        let text = report().render("error", true, 1000);
        assert!(text.starts_with("error\n"));
        assert!(text.contains("Revision created: #8"));
        assert!(text.contains("Previous revision: #7"));
        assert!(text.contains("Changes: new=3 changed=1 deleted=0"));
        assert!(text.contains("=== BACKUP LOG ==="));

        let without_log = report().render("success", false, 1000);
        assert!(!without_log.contains("BACKUP LOG"));
    }

    #[test]
    fn test_report_truncates_long_logs() {
        let mut long = report();
        long.log = format!("{}END", "x".repeat(500));
        let text = long.render("success", true, 10);
        assert!(text.contains("(Log truncated to the last 10 characters)"));
        assert!(text.ends_with("xxxxxxxEND"));
    }

    #[test]
    fn test_sanitize_only_for_other_keywords() {
        let raw = "error\nsuccess\nSubject Success\nSUCCESS";
        let cleaned = sanitize_for_keyword(raw, "error");
        assert!(!cleaned.to_lowercase().contains("success"));
        assert!(cleaned.starts_with("error\nsignal"));
        assert_eq!(sanitize_for_keyword("Backup success", "success"), "Backup success");
    }

    #[tokio::test]
    async fn test_backup_succeeded_uses_enabled_channels_only() {
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Notifier::new(globals(), transport.clone());
        let repo = RepoNotifications {
            healthchecks: HealthchecksOverride {
                enabled: true,
                success_keyword: Some("done".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let delivery = notifier.backup_succeeded(&repo, &report()).await;

        assert_eq!(delivery.healthchecks, Delivery::Sent);
        assert_eq!(delivery.email, Delivery::Skipped);
        let sent = transport.sent.lock().clone();
        let [Sent::Ping { url, body }] = sent.as_slice() else {
            panic!("expected a single ping, got {:?}", sent);
        };
        assert_eq!(url, "https://hc.example/ping/global");
        assert!(body.starts_with("done\n"));
        assert!(!body.contains("success"));
    }

    #[tokio::test]
    async fn test_failed_channel_does_not_block_the_other() {
        let transport = Arc::new(RecordingTransport {
            fail_pings: true,
            ..Default::default()
        });
        let notifier = Notifier::new(globals(), transport.clone());
        let repo = RepoNotifications {
            healthchecks: HealthchecksOverride {
                enabled: true,
                ..Default::default()
            },
            email: EmailOverride {
                enabled: true,
                ..Default::default()
            },
        };

        let delivery = notifier.backup_succeeded(&repo, &report()).await;

        assert!(matches!(&delivery.healthchecks, Delivery::Failed { error } if error.contains("503")));
        assert_eq!(delivery.email, Delivery::Sent);
        assert!(delivery.any_failed());
        let sent = transport.sent.lock().clone();
        let [Sent::Email { to, subject, .. }] = sent.as_slice() else {
            panic!("expected a single email, got {:?}", sent);
        };
        assert_eq!(to, "ops@example.com");
        assert_eq!(subject, "[X] success - Backup OK - Laptop");
    }

    #[tokio::test]
    async fn test_enabled_channel_without_transport_settings_fails() {
        let notifier = Notifier::new(NotificationSettings::default(), Arc::new(RecordingTransport::default()));
        let repo = RepoNotifications {
            email: EmailOverride {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };

        let delivery = notifier.send_test(&repo, "Laptop", "laptop").await;

        assert_eq!(delivery.healthchecks, Delivery::Skipped);
        assert!(matches!(delivery.email, Delivery::Failed { .. }));
        assert!(!delivery.any_sent());
    }
}
