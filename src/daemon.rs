//! Long-running sync process: webhook server, tunnel, local watcher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::FixedOffset;
use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::codec::FrontmatterCodec;
use crate::config::{self, AppConfig, NotifyConfig};
use crate::model::status::StatusMapping;
use crate::notifier::{ChatWebhookSink, MultiSink, NotificationSink, TracingSink};
use crate::pidfile::PidFile;
use crate::reconciler::{PushOutcome, Reconciler};
use crate::remote::linear::LinearClient;
use crate::remote::RemoteClient;
use crate::retry::RetryExecutor;
use crate::tunnel::{self, Registration, TunnelSessionManager};
use crate::watcher::debounce::{ChangeDebouncer, ChangeKind, RawChange};
use crate::watcher::LocalTreeWatcher;
use crate::webhook::{self, IngestState, WebhookTasks};

/// The collaborators every command needs.
pub struct Services {
    pub remote: Arc<dyn RemoteClient>,
    pub reconciler: Arc<Reconciler>,
}

impl Services {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let offset: FixedOffset = config
            .sync
            .utc_offset
            .parse()
            .map_err(|e| anyhow!("Invalid sync.utc_offset {:?}: {e}", config.sync.utc_offset))?;
        let statuses = StatusMapping::new(config.statuses.clone())?;
        let remote: Arc<dyn RemoteClient> = Arc::new(LinearClient::new(
            config.linear.api_key.clone(),
            config.linear.api_url.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            config.sync.root.clone(),
            config.linear.team_id.clone(),
            remote.clone(),
            Arc::new(FrontmatterCodec::new(offset)),
            statuses,
            RetryExecutor::from_config(&config.retry),
            notifier(config.notify.as_ref()),
        ));
        Ok(Self { remote, reconciler })
    }
}

fn notifier(notify: Option<&NotifyConfig>) -> Arc<dyn NotificationSink> {
    match notify {
        Some(n) => Arc::new(MultiSink(vec![
            Box::new(TracingSink),
            Box::new(ChatWebhookSink::new(n.webhook_url.clone())),
        ])),
        None => Arc::new(TracingSink),
    }
}

/// Run until SIGINT or SIGTERM. Startup failures are returned; a clean
/// shutdown returns `Ok`.
pub async fn run(config: AppConfig) -> Result<()> {
    let _pid = PidFile::acquire(&config::pid_path())?;
    let services = Services::from_config(&config)?;
    let reconciler = services.reconciler.clone();
    let root = reconciler.root().to_path_buf();
    reconciler.prepare_tree().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = TcpListener::bind((config.server.bind.as_str(), config.server.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.server.bind, config.server.port))?;
    let port = listener.local_addr()?.port();

    let mut tunnel = TunnelSessionManager::new(
        tunnel::provider_from_config(&config.tunnel)?,
        services.remote.clone(),
        RetryExecutor::from_config(&config.retry),
        Registration {
            scope: config.linear.team_id.clone(),
            label: config.linear.webhook_label.clone(),
        },
        port,
        Duration::from_secs(config.tunnel.rotation_margin_secs),
        Duration::from_secs(config.tunnel.failure_cooldown_secs),
    );

    let webhook_tasks = WebhookTasks::default();
    let app = webhook::router(IngestState {
        reconciler: reconciler.clone(),
        tunnel_url: tunnel.url(),
        comment_grace: Duration::from_millis(config.sync.comment_grace_ms),
        tasks: webhook_tasks.clone(),
    });
    let server = tokio::spawn(serve(listener, app, shutdown_rx.clone()));
    info!(port, "webhook server listening");

    if let Err(e) = tunnel.start().await {
        shutdown_tx.send_replace(true);
        let _ = server.await;
        webhook_tasks.drain().await;
        return Err(e).context("Failed to open tunnel");
    }
    let tunnel_task = tokio::spawn(tunnel.run(shutdown_rx.clone()));

    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let (settled_tx, settled_rx) = mpsc::unbounded_channel();
    let watcher = LocalTreeWatcher::start(&root, raw_tx)?;
    let debouncer = tokio::spawn(
        ChangeDebouncer::new(Duration::from_millis(config.sync.debounce_ms)).run(
            raw_rx,
            settled_tx,
            shutdown_rx.clone(),
        ),
    );
    let pusher = tokio::spawn(push_settled(reconciler, settled_rx));

    info!(root = %root.display(), "ticketsync running");
    wait_for_signal().await?;
    info!("shutting down");

    shutdown_tx.send_replace(true);
    drop(watcher);

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "webhook server failed"),
        Err(e) => error!(error = %e, "webhook server task panicked"),
    }
    // No new requests arrive past this point.
    webhook_tasks.drain().await;
    for result in join_all([tunnel_task, debouncer, pusher]).await {
        if let Err(e) = result {
            error!(error = %e, "task panicked during shutdown");
        }
    }
    info!("stopped");
    Ok(())
}

async fn serve(
    listener: TcpListener,
    app: axum::Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

/// Push each settled local change. Removals are not propagated. Returns once
/// the debouncer hangs up and every push it started has finished.
async fn push_settled(reconciler: Arc<Reconciler>, mut settled: mpsc::UnboundedReceiver<RawChange>) {
    let mut inflight = JoinSet::new();
    while let Some(change) = settled.recv().await {
        match change.kind {
            ChangeKind::Added => {
                let reconciler = reconciler.clone();
                inflight.spawn(async move {
                    match reconciler.push(&change.key).await {
                        Ok(PushOutcome::Updated(fields)) => {
                            debug!(id = %change.key, ?fields, "local change pushed")
                        }
                        Ok(PushOutcome::Unchanged) => debug!(id = %change.key, "nothing to push"),
                        Err(e) => warn!(id = %change.key, error = %e, "push failed"),
                    }
                });
            }
            ChangeKind::Removed => {
                debug!(id = %change.key, path = %change.path.display(), "local removal not propagated")
            }
        }
        while inflight.try_join_next().is_some() {}
    }
    while inflight.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TicketFileCodec;
    use crate::model::entity::{Entity, Priority};
    use crate::model::location::FileLocation;
    use crate::model::status::StatusEntry;
    use crate::remote::mock::MockRemote;
    use chrono::DateTime;
    use std::collections::BTreeSet;

    fn entity(id: &str) -> Entity {
        let at = DateTime::parse_from_rfc3339("2024-03-02T10:00:00Z").unwrap();
        Entity {
            id: id.into(),
            title: "Fix login".into(),
            status_name: "Todo".into(),
            priority: Priority::High,
            labels: BTreeSet::new(),
            assignee: None,
            due_date: None,
            parent: None,
            url: format!("https://linear.app/acme/issue/{id}"),
            created_at: at,
            updated_at: at,
            body: "Body".into(),
            comments: vec![],
        }
    }

    #[tokio::test]
    async fn settled_moves_are_pushed_and_removals_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let remote = Arc::new(
            MockRemote::new()
                .with_state("Todo", "s-todo")
                .with_state("Done", "s-done"),
        );
        remote.insert(entity("ENG-1"));
        let statuses = StatusMapping::new(vec![
            StatusEntry {
                name: "Todo".into(),
                state_id: "s-todo".into(),
                folder: "todo".into(),
            },
            StatusEntry {
                name: "Done".into(),
                state_id: "s-done".into(),
                folder: "done".into(),
            },
        ])
        .unwrap();
        let reconciler = Arc::new(Reconciler::new(
            root.clone(),
            "team-1".into(),
            remote.clone(),
            Arc::new(FrontmatterCodec::utc()),
            statuses,
            RetryExecutor::new(1, vec![]),
            Arc::new(TracingSink),
        ));

        // The file was moved from todo/ to done/ by hand.
        let path = FileLocation::for_entity(&entity("ENG-1"), "done").path(&root);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, FrontmatterCodec::utc().encode(&entity("ENG-1")).unwrap()).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(RawChange {
            key: "ENG-2".into(),
            kind: ChangeKind::Removed,
            path: root.join("todo/ENG-2_gone.md"),
        })
        .unwrap();
        tx.send(RawChange {
            key: "ENG-1".into(),
            kind: ChangeKind::Added,
            path: path.clone(),
        })
        .unwrap();
        drop(tx);

        push_settled(reconciler, rx).await;

        let updates = remote.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "ENG-1");
        assert_eq!(updates[0].1.state_id.as_deref(), Some("s-done"));
        assert!(!remote.calls().iter().any(|c| c.contains("ENG-2")));
    }

    #[test]
    fn services_reject_bad_offset() {
        let mut config = config::parse_config(
            r#"
[linear]
api_key = "k"
team_id = "team-1"

[sync]
root = "/tmp/tickets"
utc_offset = "nine hours"

[[statuses]]
name = "Todo"
state_id = "s-todo"
folder = "todo"
"#,
        )
        .unwrap();
        assert!(Services::from_config(&config).is_err());

        config.sync.utc_offset = "+09:00".into();
        let services = Services::from_config(&config).unwrap();
        assert_eq!(services.reconciler.root(), std::path::Path::new("/tmp/tickets"));
    }
}
