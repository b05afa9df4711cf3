pub mod debounce;

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::model::location::{is_ignored_name, parse_filename, EXTENSION};
use debounce::{ChangeKind, RawChange};

/// Recursive watch over the entity tree. Only changes after startup are
/// reported; dropping the watcher stops it.
pub struct LocalTreeWatcher {
    _watcher: RecommendedWatcher,
}

impl LocalTreeWatcher {
    pub fn start(root: &Path, tx: mpsc::UnboundedSender<RawChange>) -> Result<Self> {
        let handler_root = root.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in classify(&handler_root, &event) {
                    if tx.send(change).is_err() {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "file watcher error"),
        })
        .context("Failed to create file watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        debug!(root = %root.display(), "watching entity tree");
        Ok(Self { _watcher: watcher })
    }
}

/// Turn one notify event into entity changes.
pub fn classify(root: &Path, event: &Event) -> Vec<RawChange> {
    let kinds: Vec<(&PathBuf, ChangeKind)> = match &event.kind {
        EventKind::Create(_) => event.paths.iter().map(|p| (p, ChangeKind::Added)).collect(),
        EventKind::Remove(_) => event.paths.iter().map(|p| (p, ChangeKind::Removed)).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().map(|p| (p, ChangeKind::Removed)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().map(|p| (p, ChangeKind::Added)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => vec![
            (&event.paths[0], ChangeKind::Removed),
            (&event.paths[1], ChangeKind::Added),
        ],
        // Platforms that can't tell which side of a rename this is.
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let kind = if p.exists() {
                    ChangeKind::Added
                } else {
                    ChangeKind::Removed
                };
                (p, kind)
            })
            .collect(),
        other => {
            trace!(kind = ?other, "ignoring event");
            Vec::new()
        }
    };

    kinds
        .into_iter()
        .filter_map(|(path, kind)| change_for(root, path, kind))
        .collect()
}

fn change_for(root: &Path, path: &Path, kind: ChangeKind) -> Option<RawChange> {
    let relative = path.strip_prefix(root).ok()?;
    let hidden = relative.components().any(|c| match c {
        Component::Normal(part) => part.to_string_lossy().starts_with('.'),
        _ => false,
    });
    // Entities live exactly one folder below the root.
    if hidden
        || relative.components().count() != 2
        || path.extension().map_or(true, |ext| ext != EXTENSION)
    {
        return None;
    }
    let name = path.file_name()?.to_string_lossy();
    if is_ignored_name(&name) {
        return None;
    }
    match parse_filename(&name) {
        Some(parsed) => Some(RawChange {
            key: parsed.id,
            kind,
            path: path.to_path_buf(),
        }),
        None => {
            debug!(path = %path.display(), "ignoring file without an entity id");
            None
        }
    }
}
