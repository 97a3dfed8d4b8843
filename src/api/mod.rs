use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::backup::manager::{NewRepository, NewStorage, RepositoryUpdate, RestoreRequest, StorageRestoreRequest};
use crate::backup::{BackupManager, Replication, StorageTarget};
use crate::error::{AppError, AppResult};
use crate::jobs::{ActiveStatus, JobKind, Trigger};
use crate::notify::RepoNotifications;
use crate::scheduler::ScheduleRequest;

pub fn routes() -> Router<BackupManager> {
    Router::new()
        .route("/health", get(health))
        .route("/repos", get(list_repos).post(create_repo))
        .route("/repos/:id", get(get_repo).put(update_repo).delete(delete_repo))
        .route("/repos/:id/notifications/test", post(test_repo_notifications))
        .route("/snapshots/:id", get(list_snapshots))
        .route("/snapshots/:id/files", get(list_snapshot_files))
        .route("/backup/start", post(start_backup))
        .route("/backup/cancel", post(cancel_backup))
        .route("/backup/status/:id", get(backup_status))
        .route("/restore", post(start_restore))
        .route("/restore/cancel", post(cancel_restore))
        .route("/restore/status/:id", get(restore_status))
        .route("/storages", get(list_storages).post(create_storage))
        .route("/storages/:id", delete(delete_storage))
        .route("/storages/:id/restore", post(start_storage_restore))
        .route("/storages/:id/restore/cancel", post(cancel_storage_restore))
        .route("/storages/:id/restore/status", get(storage_restore_status))
}

async fn health(State(manager): State<BackupManager>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "activeJobs": manager.registry().active_count(),
    }))
}

// Repositories

async fn list_repos(State(manager): State<BackupManager>) -> AppResult<Json<Value>> {
    let repos: Vec<Value> = manager
        .storage()
        .list_repositories()
        .await?
        .iter()
        .map(|r| r.to_public_json())
        .collect();
    Ok(Json(json!({ "ok": true, "repos": repos })))
}

async fn get_repo(State(manager): State<BackupManager>, Path(id): Path<String>) -> AppResult<Json<Value>> {
    let repo = manager.repository(&id).await?;
    Ok(Json(json!({ "ok": true, "repo": repo.to_public_json() })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRepoRequest {
    name: String,
    path: PathBuf,
    snapshot_id: String,
    #[serde(default)]
    storages: Vec<StorageTarget>,
    password: Option<String>,
    encrypt: Option<bool>,
    #[serde(default)]
    content_selection: Vec<String>,
    #[serde(default)]
    replication: Replication,
    schedule: Option<ScheduleRequest>,
    #[serde(default)]
    notifications: RepoNotifications,
}

async fn create_repo(
    State(manager): State<BackupManager>,
    Json(req): Json<CreateRepoRequest>,
) -> AppResult<Json<Value>> {
    let repo = manager
        .create_repository(NewRepository {
            name: req.name,
            path: req.path,
            snapshot_id: req.snapshot_id,
            storages: req.storages,
            password: req.password,
            encrypt: req.encrypt,
            content_selection: req.content_selection,
            replication: req.replication,
            schedule: req.schedule,
            notifications: req.notifications,
        })
        .await?;
    Ok(Json(json!({ "ok": true, "repo": repo.to_public_json() })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateRepoRequest {
    name: Option<String>,
    content_selection: Option<Vec<String>>,
    replication: Option<Replication>,
    schedule: Option<ScheduleRequest>,
    notifications: Option<RepoNotifications>,
}

async fn update_repo(
    State(manager): State<BackupManager>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRepoRequest>,
) -> AppResult<Json<Value>> {
    let repo = manager
        .update_repository(
            &id,
            RepositoryUpdate {
                name: req.name,
                content_selection: req.content_selection,
                replication: req.replication,
                schedule: req.schedule,
                notifications: req.notifications,
            },
        )
        .await?;
    Ok(Json(json!({ "ok": true, "repo": repo.to_public_json() })))
}

async fn delete_repo(State(manager): State<BackupManager>, Path(id): Path<String>) -> AppResult<Json<Value>> {
    manager.delete_repository(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn test_repo_notifications(
    State(manager): State<BackupManager>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    let delivery = manager.send_test_notification(&id).await?;
    let ok = delivery.any_sent() && !delivery.any_failed();
    Ok(Json(json!({ "ok": ok, "channels": delivery })))
}

// Snapshots

#[derive(Deserialize)]
struct SnapshotQuery {
    storage: Option<String>,
    revision: Option<u32>,
    password: Option<String>,
}

async fn list_snapshots(
    State(manager): State<BackupManager>,
    Path(id): Path<String>,
    Query(query): Query<SnapshotQuery>,
) -> AppResult<Json<Value>> {
    let snapshots = manager
        .list_snapshots(&id, query.storage.as_deref(), query.password)
        .await?;
    Ok(Json(json!({ "ok": true, "snapshots": snapshots })))
}

async fn list_snapshot_files(
    State(manager): State<BackupManager>,
    Path(id): Path<String>,
    Query(query): Query<SnapshotQuery>,
) -> AppResult<Json<Value>> {
    let revision = query
        .revision
        .ok_or_else(|| AppError::Validation("revision is required".to_string()))?;
    let files = manager
        .list_files(&id, revision, query.storage.as_deref(), query.password)
        .await?;
    Ok(Json(json!({ "ok": true, "revision": revision, "files": files })))
}

// Jobs

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBackupRequest {
    repo_id: String,
    password: Option<String>,
    trigger: Option<String>,
    threads: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    repo_id: String,
}

fn default_overwrite() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRestoreRequest {
    repo_id: String,
    revision: u32,
    #[serde(default = "default_overwrite")]
    overwrite: bool,
    storage: Option<String>,
    restore_path: Option<PathBuf>,
    #[serde(default)]
    patterns: Vec<String>,
    password: Option<String>,
    threads: Option<u32>,
}

async fn start_backup(
    State(manager): State<BackupManager>,
    Json(req): Json<StartBackupRequest>,
) -> AppResult<Json<Value>> {
    let trigger = Trigger::parse(req.trigger.as_deref());
    manager
        .start_backup(&req.repo_id, req.password, trigger, req.threads)
        .await?;
    Ok(Json(json!({ "ok": true, "started": true })))
}

async fn cancel_backup(
    State(manager): State<BackupManager>,
    Json(req): Json<CancelRequest>,
) -> AppResult<Json<Value>> {
    manager.cancel(&req.repo_id, JobKind::Backup)?;
    Ok(Json(json!({ "ok": true, "message": "Cancellation requested" })))
}

async fn backup_status(State(manager): State<BackupManager>, Path(id): Path<String>) -> Json<Value> {
    Json(status_body(manager.status(&id, JobKind::Backup)))
}

async fn start_restore(
    State(manager): State<BackupManager>,
    Json(req): Json<StartRestoreRequest>,
) -> AppResult<Json<Value>> {
    manager
        .start_restore(
            &req.repo_id,
            RestoreRequest {
                revision: req.revision,
                overwrite: req.overwrite,
                storage: req.storage,
                restore_path: req.restore_path,
                patterns: req.patterns,
                password: req.password,
                threads: req.threads,
            },
        )
        .await?;
    Ok(Json(json!({ "ok": true, "started": true })))
}

async fn cancel_restore(
    State(manager): State<BackupManager>,
    Json(req): Json<CancelRequest>,
) -> AppResult<Json<Value>> {
    manager.cancel(&req.repo_id, JobKind::Restore)?;
    Ok(Json(json!({ "ok": true, "message": "Cancellation requested" })))
}

async fn restore_status(State(manager): State<BackupManager>, Path(id): Path<String>) -> Json<Value> {
    Json(status_body(manager.status(&id, JobKind::Restore)))
}

// Standalone storages

async fn list_storages(State(manager): State<BackupManager>) -> AppResult<Json<Value>> {
    let storages: Vec<Value> = manager
        .list_storages()
        .await?
        .iter()
        .map(|s| s.to_public_json())
        .collect();
    Ok(Json(json!({ "ok": true, "storages": storages })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateStorageRequest {
    name: String,
    url: String,
    password: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

async fn create_storage(
    State(manager): State<BackupManager>,
    Json(req): Json<CreateStorageRequest>,
) -> AppResult<Json<Value>> {
    let storage = manager
        .create_storage(NewStorage {
            name: req.name,
            url: req.url,
            password: req.password,
            env: req.env,
        })
        .await?;
    Ok(Json(json!({ "ok": true, "storage": storage.to_public_json() })))
}

async fn delete_storage(State(manager): State<BackupManager>, Path(id): Path<String>) -> AppResult<Json<Value>> {
    manager.delete_storage(&id).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartStorageRestoreRequest {
    storage_id: Option<String>,
    snapshot_id: String,
    revision: u32,
    #[serde(default = "default_overwrite")]
    overwrite: bool,
    restore_path: Option<PathBuf>,
    #[serde(default)]
    patterns: Vec<String>,
    password: Option<String>,
    threads: Option<u32>,
}

async fn start_storage_restore(
    State(manager): State<BackupManager>,
    Path(id): Path<String>,
    Json(req): Json<StartStorageRestoreRequest>,
) -> AppResult<Json<Value>> {
    if req.storage_id.as_deref().is_some_and(|body_id| body_id != id) {
        return Err(AppError::Validation("storageId in the body does not match the url".to_string()));
    }
    manager
        .start_storage_restore(
            &id,
            StorageRestoreRequest {
                snapshot_id: req.snapshot_id,
                revision: req.revision,
                overwrite: req.overwrite,
                restore_path: req.restore_path,
                patterns: req.patterns,
                password: req.password,
                threads: req.threads,
            },
        )
        .await?;
    Ok(Json(json!({ "ok": true, "started": true })))
}

async fn cancel_storage_restore(
    State(manager): State<BackupManager>,
    Path(id): Path<String>,
) -> AppResult<Json<Value>> {
    manager.cancel(&id, JobKind::StorageRestore)?;
    Ok(Json(json!({ "ok": true, "message": "Cancellation requested" })))
}

async fn storage_restore_status(State(manager): State<BackupManager>, Path(id): Path<String>) -> Json<Value> {
    Json(status_body(manager.status(&id, JobKind::StorageRestore)))
}

fn status_body(status: Option<ActiveStatus>) -> Value {
    match status {
        None => json!({ "ok": true, "running": false }),
        Some(status) => {
            let mut body = serde_json::to_value(status).unwrap_or_else(|_| json!({}));
            if let Some(map) = body.as_object_mut() {
                map.insert("ok".to_string(), Value::Bool(true));
                map.insert("running".to_string(), Value::Bool(true));
            }
            body
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::backup::runner::JobRunner;
    use crate::backup::{RecordEnvResolver, Repository};
    use crate::engine::test_support::fake_engine;
    use crate::engine::EngineClient;
    use crate::jobs::registry::test_support::wait_for_result;
    use crate::jobs::{JobKey, JobRegistry};
    use crate::storage::Storage;
    use crate::utils::config::Config;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app(dir: &TempDir, script: &str) -> (Router, BackupManager) {
        let storage = Storage::new(&format!("sqlite://{}/db.sqlite", dir.path().display()))
            .await
            .unwrap();
        storage.run_migrations().await.unwrap();
        let runner = JobRunner::new(
            EngineClient::new(fake_engine(dir.path(), script)),
            Arc::new(RecordEnvResolver),
        );
        let manager = BackupManager::new(Config::default(), storage, JobRegistry::new(), runner);
        (routes().with_state(manager.clone()), manager)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let body = match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn seeded(manager: &BackupManager, dir: &TempDir) -> Repository {
        let mut repo = Repository::new("Laptop", dir.path(), "laptop");
        repo.password = Some("hunter2".to_string());
        repo.storages.push(StorageTarget {
            name: "default".to_string(),
            url: "/mnt/store".to_string(),
            is_default: true,
            ..Default::default()
        });
        manager.storage().save_repository(&repo).await.unwrap();
        repo
    }

    #[tokio::test]
    async fn test_repos_hide_password() {
        let dir = TempDir::new().unwrap();
        let (app, manager) = app(&dir, "exit 0").await;
        let repo = seeded(&manager, &dir).await;

        let (status, body) = call(&app, Method::GET, &format!("/repos/{}", repo.id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["repo"]["hasPassword"], true);
        assert!(body["repo"].get("password").is_none());

        let (status, body) = call(&app, Method::GET, "/repos/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_update_normalizes_schedule() {
        let dir = TempDir::new().unwrap();
        let (app, manager) = app(&dir, "exit 0").await;
        let repo = seeded(&manager, &dir).await;

        let (status, body) = call(
            &app,
            Method::PUT,
            &format!("/repos/{}", repo.id),
            Some(json!({"schedule": {"enabled": true, "type": "weekly", "time": "25:99", "days": ["Friday", "fri", "xyz"]}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let schedule = &body["repo"]["schedule"];
        assert_eq!(schedule["type"], "weekly");
        assert_eq!(schedule["time"], "23:00");
        assert_eq!(schedule["days"], json!(["fri"]));
        assert!(schedule["nextRunAt"].is_string());
    }

    #[tokio::test]
    async fn test_backup_lifecycle_over_http() {
        let dir = TempDir::new().unwrap();
        let (app, manager) = app(&dir, "[ \"$1\" = backup ] && exec sleep 30\nexit 0").await;
        let repo = seeded(&manager, &dir).await;

        let start = json!({"repoId": repo.id});
        let (status, body) = call(&app, Method::POST, "/backup/start", Some(start.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true, "started": true}));

        let (status, _) = call(&app, Method::POST, "/backup/start", Some(start)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, Method::DELETE, &format!("/repos/{}", repo.id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = call(&app, Method::GET, &format!("/backup/status/{}", repo.id), None).await;
        assert_eq!(body["running"], true);
        assert!(body["startedAt"].is_string());

        let cancel = json!({"repoId": repo.id});
        loop {
            let (status, _) = call(&app, Method::POST, "/backup/cancel", Some(cancel.clone())).await;
            if status == StatusCode::OK {
                break;
            }
            assert_eq!(status, StatusCode::CONFLICT);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let result = wait_for_result(manager.registry(), &JobKey::new(&repo.id, JobKind::Backup)).await;
        assert!(result.cancelled);

        let (_, body) = call(&app, Method::GET, &format!("/backup/status/{}", repo.id), None).await;
        assert_eq!(body, json!({"ok": true, "running": false}));

        let (status, _) = call(&app, Method::POST, "/backup/cancel", Some(cancel)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_restore_requires_absolute_path() {
        let dir = TempDir::new().unwrap();
        let (app, manager) = app(&dir, "exit 0").await;
        let repo = seeded(&manager, &dir).await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/restore",
            Some(json!({"repoId": repo.id, "revision": 3, "restorePath": "relative/dir"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);

        let (_, body) = call(&app, Method::GET, &format!("/restore/status/{}", repo.id), None).await;
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn test_storage_restore_over_http() {
        let dir = TempDir::new().unwrap();
        let (app, manager) = app(
            &dir,
            "case \"$1\" in init) mkdir -p .duplicacy ;; restore) exec sleep 30 ;; esac\nexit 0",
        )
        .await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/storages",
            Some(json!({ "name": "Offsite", "url": "/mnt/offsite", "password": "hunter2" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storage"]["hasPassword"], true);
        assert!(!body.to_string().contains("hunter2"));
        let id = body["storage"]["id"].as_str().unwrap().to_string();

        let target = dir.path().join("restored");
        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/storages/{}/restore", id),
            Some(json!({ "storageId": "other", "snapshotId": "laptop", "revision": 3, "restorePath": target })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/storages/{}/restore", id),
            Some(json!({ "snapshotId": "laptop", "revision": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/storages/{}/restore", id),
            Some(json!({ "storageId": id, "snapshotId": "laptop", "revision": 3, "restorePath": target })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, Method::GET, &format!("/storages/{}/restore/status", id), None).await;
        assert_eq!(body["running"], true);
        assert_eq!(body["kind"], "storage_restore");
        let (status, _) = call(&app, Method::DELETE, &format!("/storages/{}", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        loop {
            let (status, _) = call(&app, Method::POST, &format!("/storages/{}/restore/cancel", id), None).await;
            if status == StatusCode::OK {
                break;
            }
            assert_eq!(status, StatusCode::CONFLICT);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let result = wait_for_result(manager.registry(), &JobKey::new(&id, JobKind::StorageRestore)).await;
        assert!(result.cancelled);

        let (status, _) = call(&app, Method::DELETE, &format!("/storages/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, Method::GET, "/storages", None).await;
        assert_eq!(body["storages"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_repo_notification_settings_over_http() {
        let dir = TempDir::new().unwrap();
        let (app, manager) = app(&dir, "exit 0").await;
        let repo = seeded(&manager, &dir).await;
        let uri = format!("/repos/{}", repo.id);

        let (status, body) = call(
            &app,
            Method::PUT,
            &uri,
            Some(json!({ "notifications": { "healthchecks": { "enabled": true } } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("ping URL"));

        let (status, body) = call(
            &app,
            Method::PUT,
            &uri,
            Some(json!({ "notifications": { "email": { "enabled": false, "to": "me@example.com" } } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["repo"]["notifications"]["email"]["to"], "me@example.com");

        let (status, body) = call(&app, Method::POST, &format!("{}/notifications/test", uri), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], false);
        assert_eq!(body["channels"]["healthchecks"]["status"], "skipped");
        assert_eq!(body["channels"]["email"]["status"], "skipped");
    }
}
