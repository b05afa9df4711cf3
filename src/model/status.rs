use std::collections::HashSet;

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::error::SyncError;

/// One `[[statuses]]` row: a remote workflow state and the folder it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusEntry {
    pub name: String,
    pub state_id: String,
    pub folder: String,
}

#[derive(Debug, Clone)]
pub struct StatusMapping {
    entries: Vec<StatusEntry>,
}

impl StatusMapping {
    pub fn new(entries: Vec<StatusEntry>) -> Result<Self> {
        let mut names = HashSet::new();
        let mut states = HashSet::new();
        let mut folders = HashSet::new();
        for entry in &entries {
            if entry.folder.is_empty() || entry.folder.starts_with('.') || entry.folder.contains('/')
            {
                bail!("Status {:?} has an invalid folder {:?}", entry.name, entry.folder);
            }
            if !names.insert(entry.name.as_str()) {
                bail!("Status {:?} is mapped twice", entry.name);
            }
            if !states.insert(entry.state_id.as_str()) {
                bail!("State id {:?} is mapped twice", entry.state_id);
            }
            if !folders.insert(entry.folder.as_str()) {
                bail!("Folder {:?} is used by more than one status", entry.folder);
            }
        }
        Ok(Self { entries })
    }

    /// Look up the row for a remote status name.
    pub fn resolve(&self, id: &str, status_name: &str) -> Result<&StatusEntry, SyncError> {
        self.entries
            .iter()
            .find(|e| e.name == status_name)
            .ok_or_else(|| {
                SyncError::consistency(id, format!("status {status_name:?} has no folder mapping"))
            })
    }

    /// Look up the row a status folder stands for.
    pub fn by_folder(&self, id: &str, folder: &str) -> Result<&StatusEntry, SyncError> {
        self.entries.iter().find(|e| e.folder == folder).ok_or_else(|| {
            SyncError::consistency(id, format!("folder {folder:?} is not a status folder"))
        })
    }

    pub fn folders(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.folder.as_str())
    }
}
