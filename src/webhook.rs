//! Inbound change notifications from the tracker.
//!
//! Every request is answered with success once it has been read; the
//! reconciliation it triggers runs on its own task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::reconciler::Reconciler;
use crate::tunnel::WEBHOOK_PATH;

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Pull { id: String, delay: Option<Duration> },
    Delete { id: String, data: Value },
    Ignored(String),
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Decide what a payload asks for. Comments resolve to their parent issue.
pub fn classify(payload: &Value, comment_grace: Duration) -> ChangeEvent {
    let kind = payload.get("type").and_then(Value::as_str).unwrap_or_default();
    let action = payload
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let Some(data) = payload.get("data") else {
        return ChangeEvent::Ignored("payload has no data".into());
    };

    let id = match kind {
        // Files are named by identifier; a uuid could never match one.
        "Issue" if action == "remove" => match str_at(data, "/identifier") {
            Some(id) => Some(id),
            None => return ChangeEvent::Ignored("Issue remove without an identifier".into()),
        },
        "Issue" => str_at(data, "/identifier").or_else(|| str_at(data, "/id")),
        "Comment" => str_at(data, "/issue/identifier").or_else(|| str_at(data, "/issueId")),
        other => return ChangeEvent::Ignored(format!("unsupported type {other:?}")),
    };
    let Some(id) = id.map(String::from) else {
        return ChangeEvent::Ignored(format!("{kind} {action} without an id"));
    };

    match (kind, action) {
        ("Issue", "create" | "update") => ChangeEvent::Pull { id, delay: None },
        ("Issue", "remove") => ChangeEvent::Delete {
            id,
            data: data.clone(),
        },
        // The comment may not be visible through the API straight away.
        ("Comment", "create") => ChangeEvent::Pull {
            id,
            delay: Some(comment_grace),
        },
        ("Comment", "update" | "remove") => ChangeEvent::Pull { id, delay: None },
        _ => ChangeEvent::Ignored(format!("unsupported action {action:?} on {kind}")),
    }
}

/// Background work started by webhooks, kept so shutdown can wait for it.
#[derive(Clone, Default)]
pub struct WebhookTasks(Arc<Mutex<JoinSet<()>>>);

impl WebhookTasks {
    fn set(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut set = self.set();
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    /// Wait for every task started so far.
    pub async fn drain(&self) {
        let mut pending = std::mem::take(&mut *self.set());
        if !pending.is_empty() {
            info!(count = pending.len(), "waiting for webhook work");
        }
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "webhook task panicked");
            }
        }
    }
}

/// Run the work for one event in the background. Returns whether anything
/// was started.
pub fn dispatch(reconciler: Arc<Reconciler>, tasks: &WebhookTasks, event: ChangeEvent) -> bool {
    match event {
        ChangeEvent::Pull { id, delay } => {
            tasks.spawn(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if let Err(e) = reconciler.pull(&id).await {
                    warn!(id, error = %e, "pull from webhook failed");
                }
            });
            true
        }
        ChangeEvent::Delete { id, data } => {
            tasks.spawn(async move {
                if let Err(e) = reconciler.handle_remote_delete(&id, Some(&data)).await {
                    warn!(id, error = %e, "remote delete failed");
                }
            });
            true
        }
        ChangeEvent::Ignored(reason) => {
            debug!(reason, "ignoring webhook");
            false
        }
    }
}

#[derive(Clone)]
pub struct IngestState {
    pub reconciler: Arc<Reconciler>,
    pub tunnel_url: watch::Receiver<Option<String>>,
    pub comment_grace: Duration,
    pub tasks: WebhookTasks,
}

pub fn router(state: IngestState) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(receive))
        .route("/health", get(health))
        .with_state(state)
}

async fn receive(State(state): State<IngestState>, body: Bytes) -> StatusCode {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "malformed webhook body");
            return StatusCode::OK;
        }
    };
    let event = classify(&payload, state.comment_grace);
    if let ChangeEvent::Pull { id, .. } | ChangeEvent::Delete { id, .. } = &event {
        info!(id, "webhook received");
    }
    dispatch(state.reconciler, &state.tasks, event);
    StatusCode::OK
}

async fn health(State(state): State<IngestState>) -> Json<Value> {
    let tunnel = state.tunnel_url.borrow().clone();
    Json(json!({ "status": "ok", "tunnel": tunnel }))
}
