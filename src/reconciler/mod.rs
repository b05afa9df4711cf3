//! Per-entity reconciliation between the local tree and the remote tracker.
//!
//! Every operation for one id runs under that id's lock, so a pull and a push
//! for the same entity never interleave. Remote calls go through the retry
//! executor; local files are always replaced atomically and their mtime is
//! set to the `updated_at` written into them, which is what the push-all
//! timestamp gate compares against.

pub mod locks;
pub mod tree;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec::TicketFileCodec;
use crate::error::{ErrorClass, SyncError};
use crate::model::entity::Entity;
use crate::model::location::FileLocation;
use crate::model::status::{StatusEntry, StatusMapping};
use crate::notifier::{NotificationSink, SyncEvent};
use crate::remote::{EntityUpdate, NewEntity, RemoteClient};
use crate::retry::RetryExecutor;
use locks::EntityLocks;
use tree::LocalFile;

/// What we last synced for an entity. The file stays authoritative; this is
/// a cache of where it is and which remote revision it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub last_known_path: PathBuf,
    pub last_synced_updated_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOutcome {
    pub path: PathBuf,
    /// Previous path when the pull moved or renamed the file.
    pub moved_from: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Updated(Vec<&'static str>),
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Removed(PathBuf),
    NotFound,
}

/// Tally of a batch run. Consistency problems count as skipped, anything
/// else as failed.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub unchanged: usize,
    pub skipped: Vec<(String, String)>,
    pub failed: Vec<(String, String)>,
}

impl BatchSummary {
    fn record_error(&mut self, id: &str, err: &SyncError) {
        if err.class() == ErrorClass::Consistency {
            warn!(id, error = %err, "skipping entity");
            self.skipped.push((id.to_string(), err.to_string()));
        } else {
            warn!(id, error = %err, "entity failed");
            self.failed.push((id.to_string(), err.to_string()));
        }
    }

    pub fn render(&self, verb: &str) -> String {
        format!(
            "{verb} {}, unchanged {}, skipped {}, failed {}",
            self.succeeded,
            self.unchanged,
            self.skipped.len(),
            self.failed.len()
        )
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render("succeeded"))
    }
}

pub struct Reconciler {
    root: PathBuf,
    scope: String,
    remote: Arc<dyn RemoteClient>,
    codec: Arc<dyn TicketFileCodec>,
    statuses: StatusMapping,
    retry: RetryExecutor,
    notifier: Arc<dyn NotificationSink>,
    locks: EntityLocks,
    states: Mutex<HashMap<String, SyncState>>,
}

impl Reconciler {
    pub fn new(
        root: PathBuf,
        scope: String,
        remote: Arc<dyn RemoteClient>,
        codec: Arc<dyn TicketFileCodec>,
        statuses: StatusMapping,
        retry: RetryExecutor,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            root,
            scope,
            remote,
            codec,
            statuses,
            retry,
            notifier,
            locks: EntityLocks::new(),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and one folder per configured status.
    pub async fn prepare_tree(&self) -> Result<(), SyncError> {
        for folder in self.statuses.folders() {
            let dir = self.root.join(folder);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| SyncError::io(format!("create {}", dir.display()), e))?;
        }
        Ok(())
    }

    pub fn sync_state(&self, id: &str) -> Option<SyncState> {
        self.states_guard().get(id).cloned()
    }

    fn states_guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, SyncState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remember(&self, id: &str, path: PathBuf, updated_at: DateTime<FixedOffset>) {
        self.states_guard().insert(
            id.to_string(),
            SyncState {
                last_known_path: path,
                last_synced_updated_at: updated_at,
            },
        );
    }

    fn forget(&self, id: &str) {
        self.states_guard().remove(id);
    }

    /// Find the one file for `id`. Always scans, so a stray copy next to a
    /// cached path is still reported.
    async fn locate(&self, id: &str) -> Result<Option<LocalFile>, SyncError> {
        tree::single_for(tree::scan(&self.root).await?, id)
    }

    /// True when the file is exactly what our last sync wrote: same path, and
    /// not modified since. Renames and moves never preserve the path, and
    /// edits bump the mtime past the stamped `updated_at`.
    async fn is_own_write(&self, file: &LocalFile) -> Result<bool, SyncError> {
        let Some(state) = self.sync_state(&file.id) else {
            return Ok(false);
        };
        if state.last_known_path != file.path {
            return Ok(false);
        }
        let modified = tree::modified_at(&file.path).await?;
        Ok(modified <= state.last_synced_updated_at)
    }

    async fn fetch(&self, id: &str) -> Result<Entity, SyncError> {
        self.retry
            .run("get_entity", || self.remote.get_entity(id))
            .await
    }

    async fn read_file(&self, file: &LocalFile) -> Result<Entity, SyncError> {
        let bytes = tokio::fs::read(&file.path)
            .await
            .map_err(|e| SyncError::io(format!("read {}", file.path.display()), e))?;
        let entity = self
            .codec
            .decode(&bytes)
            .map_err(|e| SyncError::MalformedFile {
                path: file.path.clone(),
                reason: format!("{e:#}"),
            })?;
        if entity.id != file.id {
            return Err(SyncError::consistency(
                &file.id,
                format!("{} declares id {}", file.path.display(), entity.id),
            ));
        }
        Ok(entity)
    }

    async fn write_file(&self, path: &Path, entity: &Entity) -> Result<(), SyncError> {
        let bytes = self.codec.encode(entity)?;
        tree::write_atomic(path, &bytes).await?;
        tree::stamp_mtime(path, entity.updated_at).await
    }

    /// Overwrite the local file with the remote state, moving it when the
    /// remote status or title implies a different location.
    pub async fn pull(&self, id: &str) -> Result<PullOutcome, SyncError> {
        let _guard = self.locks.acquire(id).await;
        let entity = self.fetch(id).await?;
        // Callers may address an entity by an alias; serialize on the canonical id too.
        let _canonical = if entity.id != id {
            Some(self.locks.acquire(&entity.id).await)
        } else {
            None
        };

        let status = self.statuses.resolve(&entity.id, &entity.status_name)?;
        let target = FileLocation::for_entity(&entity, &status.folder).path(&self.root);

        let mut moved_from = None;
        if let Some(existing) = self.locate(&entity.id).await? {
            if existing.path != target {
                debug!(id = %entity.id, from = %existing.path.display(), to = %target.display(), "moving file");
                tree::remove(&existing.path).await?;
                moved_from = Some(existing.path);
            }
        }

        self.write_file(&target, &entity).await?;
        self.remember(&entity.id, target.clone(), entity.updated_at);
        info!(id = %entity.id, path = %target.display(), "pulled");

        self.notifier.notify(SyncEvent::Pulled {
            id: entity.id.clone(),
            title: entity.title.clone(),
            moved_from: moved_from.as_ref().map(|p| self.relative(p)),
        });
        Ok(PullOutcome {
            path: target,
            moved_from,
        })
    }

    /// Send local state, title and description changes for `id` upstream.
    pub async fn push(&self, id: &str) -> Result<PushOutcome, SyncError> {
        let _guard = self.locks.acquire(id).await;
        let file = self
            .locate(id)
            .await?
            .ok_or_else(|| SyncError::MissingFile(id.to_string()))?;
        let mut local = self.read_file(&file).await?;
        let local_status = self.statuses.by_folder(id, &file.folder)?.clone();

        let remote = self.fetch(id).await?;
        // The watcher reports our own writes too.
        if self.is_own_write(&file).await? {
            debug!(id, "file unchanged since last sync");
            return Ok(PushOutcome::Unchanged);
        }
        let remote_status = self.statuses.resolve(id, &remote.status_name)?;

        let update = diff(&local_status, remote_status, &local, &remote);
        if update.is_empty() {
            debug!(id, "nothing to push");
            return Ok(PushOutcome::Unchanged);
        }

        let fields = update.changed_fields();
        self.retry
            .run("update_entity", || self.remote.update_entity(id, &update))
            .await?;

        local.status_name = local_status.name;
        local.updated_at = sync_timestamp();
        self.write_file(&file.path, &local).await?;
        self.remember(id, file.path.clone(), local.updated_at);
        info!(id, fields = ?fields, "pushed");

        self.notifier.notify(SyncEvent::Pushed {
            id: id.to_string(),
            title: local.title.clone(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        Ok(PushOutcome::Updated(fields))
    }

    /// Create an entity remotely and pull it into the tree.
    pub async fn create(
        &self,
        title: &str,
        description: Option<&str>,
        status_name: Option<&str>,
    ) -> Result<(String, PullOutcome), SyncError> {
        let state_id = status_name
            .map(|name| self.statuses.resolve(title, name).map(|s| s.state_id.clone()))
            .transpose()?;
        let new = NewEntity {
            scope: self.scope.clone(),
            title: title.to_string(),
            description: description.map(String::from),
            state_id,
        };
        // Creation is not idempotent, so it gets a single attempt.
        let id = RetryExecutor::new(1, Vec::new())
            .run("create_entity", || self.remote.create_entity(&new))
            .await?;
        info!(id, "created");
        let outcome = self.pull(&id).await?;
        Ok((id, outcome))
    }

    /// Remove the local file of an entity deleted remotely. Missing files are
    /// not an error, so repeated notifications are harmless.
    pub async fn handle_remote_delete(
        &self,
        id: &str,
        last_known: Option<&Value>,
    ) -> Result<DeleteOutcome, SyncError> {
        let _guard = self.locks.acquire(id).await;
        let found = tree::single_for(tree::scan(&self.root).await?, id)?;
        self.forget(id);

        let Some(file) = found else {
            info!(id, "no local file to delete");
            return Ok(DeleteOutcome::NotFound);
        };
        tree::remove(&file.path).await?;
        info!(id, path = %file.path.display(), "deleted local file");

        let title = last_known
            .and_then(|data| data.get("title"))
            .and_then(Value::as_str)
            .map(String::from);
        self.notifier.notify(SyncEvent::Deleted {
            id: id.to_string(),
            title,
        });
        Ok(DeleteOutcome::Removed(file.path))
    }

    /// Pull every entity in scope, one at a time.
    pub async fn pull_all(&self) -> Result<BatchSummary, SyncError> {
        let ids = self
            .retry
            .run("list_entities", || self.remote.list_entities(&self.scope))
            .await?;
        info!(count = ids.len(), "pulling all entities");

        let mut summary = BatchSummary::default();
        for id in ids {
            match self.pull(&id).await {
                Ok(_) => summary.succeeded += 1,
                Err(e) => summary.record_error(&id, &e),
            }
        }
        Ok(summary)
    }

    /// Push every file edited since its last sync, one at a time.
    pub async fn push_all(&self) -> Result<BatchSummary, SyncError> {
        let files = tree::scan(&self.root).await?;
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for file in &files {
            *counts.entry(file.id.as_str()).or_default() += 1;
        }

        let mut summary = BatchSummary::default();
        let mut reported = Vec::new();
        for file in &files {
            if counts[file.id.as_str()] > 1 {
                if !reported.contains(&file.id) {
                    let err = SyncError::consistency(
                        &file.id,
                        format!("found {} files", counts[file.id.as_str()]),
                    );
                    summary.record_error(&file.id, &err);
                    reported.push(file.id.clone());
                }
                continue;
            }

            match self.is_push_worthy(file).await {
                Ok(false) => {
                    summary.unchanged += 1;
                    continue;
                }
                Ok(true) => {}
                Err(e) => {
                    summary.record_error(&file.id, &e);
                    continue;
                }
            }

            match self.push(&file.id).await {
                Ok(PushOutcome::Updated(_)) => summary.succeeded += 1,
                Ok(PushOutcome::Unchanged) => summary.unchanged += 1,
                Err(e) => summary.record_error(&file.id, &e),
            }
        }
        Ok(summary)
    }

    async fn is_push_worthy(&self, file: &LocalFile) -> Result<bool, SyncError> {
        let stored = self.read_file(file).await?.updated_at;
        let modified = tree::modified_at(&file.path).await?;
        Ok(modified > stored)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

fn sync_timestamp() -> DateTime<FixedOffset> {
    let now = Utc::now();
    now.with_nanosecond(0).unwrap_or(now).fixed_offset()
}

fn diff(
    local_status: &StatusEntry,
    remote_status: &StatusEntry,
    local: &Entity,
    remote: &Entity,
) -> EntityUpdate {
    let mut update = EntityUpdate::default();
    if local_status.state_id != remote_status.state_id {
        update.state_id = Some(local_status.state_id.clone());
    }
    if local.title.trim() != remote.title.trim() {
        update.title = Some(local.title.trim().to_string());
    }
    if local.body.trim_end() != remote.body.trim_end() {
        update.description = Some(local.body.trim_end().to_string());
    }
    update
}
