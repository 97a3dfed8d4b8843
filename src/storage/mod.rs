use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backup::{Repository, StorageRecord};
use crate::scheduler::{ScheduleConfig, ScheduleStore, ScheduleUpdate, ScheduledResource};

/// Repository records, stored as JSON documents in SQLite.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    // Serializes read-modify-write cycles across API handlers, jobs and the scheduler.
    write_lock: Arc<Mutex<()>>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        if !database_url.contains(":memory:") {
            let path = database_url
                .strip_prefix("sqlite://")
                .or_else(|| database_url.strip_prefix("sqlite:"))
                .unwrap_or(database_url);
            let path = path.split('?').next().unwrap_or(path);
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL {}", database_url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", database_url))?;

        Ok(Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS storages (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let rows = sqlx::query("SELECT id, data FROM repositories ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let data: String = row.get("data");
                serde_json::from_str(&data).with_context(|| format!("Corrupt repository record {}", id))
            })
            .collect()
    }

    pub async fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        let row = sqlx::query("SELECT data FROM repositories WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let data: String = row.get("data");
                let repo = serde_json::from_str(&data).with_context(|| format!("Corrupt repository record {}", id))?;
                Ok(Some(repo))
            }
            None => Ok(None),
        }
    }

    pub async fn save_repository(&self, repo: &Repository) -> Result<()> {
        let data = serde_json::to_string(repo)?;
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            r#"
            INSERT INTO repositories (id, data, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&repo.id)
        .bind(&data)
        .execute(&self.pool)
        .await?;

        debug!("Saved repository {}", repo.id);
        Ok(())
    }

    /// Returns whether a record was removed.
    pub async fn delete_repository(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM repositories WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Read, modify and write one record atomically.
    ///
    /// Returns the updated record, or `None` if `id` does not exist.
    pub async fn update_repository<F>(&self, id: &str, update: F) -> Result<Option<Repository>>
    where
        F: FnOnce(&mut Repository) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT data FROM repositories WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let data: String = row.get("data");
        let mut repo: Repository =
            serde_json::from_str(&data).with_context(|| format!("Corrupt repository record {}", id))?;
        update(&mut repo);
        repo.id = id.to_string();

        sqlx::query("UPDATE repositories SET data = ?2, updated_at = CURRENT_TIMESTAMP WHERE id = ?1")
            .bind(id)
            .bind(serde_json::to_string(&repo)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(repo))
    }
}

// Standalone storages
impl Storage {
    pub async fn list_storages(&self) -> Result<Vec<StorageRecord>> {
        let rows = sqlx::query("SELECT id, data FROM storages ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let data: String = row.get("data");
                serde_json::from_str(&data).with_context(|| format!("Corrupt storage record {}", id))
            })
            .collect()
    }

    pub async fn get_storage(&self, id: &str) -> Result<Option<StorageRecord>> {
        let row = sqlx::query("SELECT data FROM storages WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let data: String = row.get("data");
            serde_json::from_str(&data).with_context(|| format!("Corrupt storage record {}", id))
        })
        .transpose()
    }

    /// Insert a record, or fold it into the one already registered for the
    /// same url. Returns the stored record.
    pub async fn upsert_storage(&self, record: StorageRecord) -> Result<StorageRecord> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT data FROM storages WHERE url = ?1")
            .bind(&record.url)
            .fetch_optional(&mut *tx)
            .await?;
        let stored = match existing {
            Some(row) => {
                let data: String = row.get("data");
                let mut current: StorageRecord =
                    serde_json::from_str(&data).with_context(|| format!("Corrupt storage record for {}", record.url))?;
                current.name = record.name;
                if record.password.is_some() {
                    current.password = record.password;
                }
                current.env.extend(record.env);
                current
            }
            None => record,
        };

        sqlx::query(
            r#"
            INSERT INTO storages (id, url, data, updated_at)
            VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&stored.id)
        .bind(&stored.url)
        .bind(serde_json::to_string(&stored)?)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("Saved storage {}", stored.id);
        Ok(stored)
    }

    /// Returns whether a record was removed.
    pub async fn delete_storage(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM storages WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ScheduleStore for Storage {
    async fn scheduled_resources(&self) -> Result<Vec<ScheduledResource>> {
        Ok(self
            .list_repositories()
            .await?
            .into_iter()
            .map(|repo| ScheduledResource {
                id: repo.id,
                name: repo.name,
                schedule: repo.schedule,
            })
            .collect())
    }

    async fn update_schedule(&self, id: &str, update: ScheduleUpdate) -> Result<Option<ScheduleConfig>> {
        let repo = self
            .update_repository(id, move |repo| update(&mut repo.schedule))
            .await?;
        Ok(repo.map(|r| r.schedule))
    }
}
