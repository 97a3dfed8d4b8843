use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::time::Duration;
use tracing::{debug, error};

use crate::backup::BackupManager;
use crate::jobs::{JobKind, ProgressObserver};

pub fn routes() -> Router<BackupManager> {
    Router::new()
        .route("/backup/:id", get(backup_progress))
        .route("/restore/:id", get(restore_progress))
        .route("/storages/:id/restore", get(storage_restore_progress))
}

async fn backup_progress(
    ws: WebSocketUpgrade,
    Path(repo_id): Path<String>,
    State(manager): State<BackupManager>,
) -> Response {
    upgrade(ws, &manager, &repo_id, JobKind::Backup)
}

async fn restore_progress(
    ws: WebSocketUpgrade,
    Path(repo_id): Path<String>,
    State(manager): State<BackupManager>,
) -> Response {
    upgrade(ws, &manager, &repo_id, JobKind::Restore)
}

async fn storage_restore_progress(
    ws: WebSocketUpgrade,
    Path(storage_id): Path<String>,
    State(manager): State<BackupManager>,
) -> Response {
    upgrade(ws, &manager, &storage_id, JobKind::StorageRestore)
}

fn upgrade(ws: WebSocketUpgrade, manager: &BackupManager, resource: &str, kind: JobKind) -> Response {
    let observer = manager.observer(resource, kind);
    let interval = manager.config().progress_poll_interval;
    ws.on_upgrade(move |socket| handle_socket(socket, observer, interval))
}

/// Poll once and render the messages to send. The flag is true once the
/// stream has delivered its terminal message.
pub fn poll_messages(observer: &mut ProgressObserver) -> (Vec<String>, bool) {
    let events = observer.observe().into_events();
    let done = events.iter().any(|e| e.is_terminal());
    let messages = events
        .iter()
        .filter_map(|event| match serde_json::to_string(event) {
            Ok(text) => Some(text),
            Err(e) => {
                error!("Failed to encode progress event: {}", e);
                None
            }
        })
        .collect();
    (messages, done)
}

async fn handle_socket(socket: WebSocket, mut observer: ProgressObserver, poll_interval: Duration) {
    let (mut sender, mut receiver) = socket.split();
    debug!("Progress stream opened for {}", observer.key());

    let mut send_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            interval.tick().await;
            let (messages, done) = poll_messages(&mut observer);
            for text in messages {
                if sender.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            if done {
                let _ = sender.send(Message::Close(None)).await;
                return;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                debug!("Progress stream closed by client");
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    debug!("Progress stream closed");
}
