use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::debug;

use crate::error::SyncError;
use crate::model::location::{is_ignored_name, parse_filename};

/// An entity file found under one of the status folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub folder: String,
    pub id: String,
}

fn io_err(action: &str, path: &Path) -> impl FnOnce(io::Error) -> SyncError {
    let context = format!("{action} {}", path.display());
    move |e| SyncError::io(context, e)
}

/// List every entity file one level below `root`. A missing root is empty.
pub async fn scan(root: &Path) -> Result<Vec<LocalFile>, SyncError> {
    let mut folders = match tokio::fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err("read", root)(e)),
    };

    let mut files = Vec::new();
    while let Some(folder) = folders.next_entry().await.map_err(io_err("read", root))? {
        let folder_name = folder.file_name().to_string_lossy().to_string();
        if folder_name.starts_with('.') || !folder.file_type().await.map_or(false, |t| t.is_dir()) {
            continue;
        }
        let folder_path = folder.path();
        let mut entries = tokio::fs::read_dir(&folder_path)
            .await
            .map_err(io_err("read", &folder_path))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err("read", &folder_path))? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_ignored_name(&name) {
                continue;
            }
            match parse_filename(&name) {
                Some(parsed) => files.push(LocalFile {
                    path: entry.path(),
                    folder: folder_name.clone(),
                    id: parsed.id,
                }),
                None => debug!(file = %entry.path().display(), "not an entity file"),
            }
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

/// The single file for `id` among `files`, or a consistency error if there
/// are several.
pub fn single_for(files: Vec<LocalFile>, id: &str) -> Result<Option<LocalFile>, SyncError> {
    let mut matching: Vec<LocalFile> = files.into_iter().filter(|f| f.id == id).collect();
    match matching.len() {
        0 => Ok(None),
        1 => Ok(matching.pop()),
        _ => {
            let paths: Vec<String> = matching.iter().map(|f| f.path.display().to_string()).collect();
            Err(SyncError::consistency(
                id,
                format!("found {} files: {}", paths.len(), paths.join(", ")),
            ))
        }
    }
}

/// Write through a hidden temp file so watchers and readers never see a
/// half-written entity.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SyncError> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::io("write", io::Error::from(io::ErrorKind::InvalidInput)))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(io_err("create", parent))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{name}.tmp"));
    tokio::fs::write(&tmp, bytes).await.map_err(io_err("write", &tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err("rename", path))?;
    Ok(())
}

pub async fn remove(path: &Path) -> Result<(), SyncError> {
    tokio::fs::remove_file(path).await.map_err(io_err("remove", path))
}

/// Set the file's mtime to the timestamp stored inside it.
pub async fn stamp_mtime(path: &Path, at: DateTime<FixedOffset>) -> Result<(), SyncError> {
    let owned = path.to_path_buf();
    let time = SystemTime::from(at);
    tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .write(true)
            .open(&owned)
            .and_then(|f| f.set_modified(time))
    })
    .await
    .map_err(|e| SyncError::Other(e.into()))?
    .map_err(io_err("stamp", path))
}

pub async fn modified_at(path: &Path) -> Result<DateTime<Utc>, SyncError> {
    let meta = tokio::fs::metadata(path).await.map_err(io_err("stat", path))?;
    let modified = meta.modified().map_err(io_err("stat", path))?;
    Ok(DateTime::<Utc>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[tokio::test]
    async fn scan_finds_entity_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("todo")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("todo/ENG-1_a.md"), "x").unwrap();
        std::fs::write(root.join("todo/README.md"), "x").unwrap();
        std::fs::write(root.join("todo/notes.txt"), "x").unwrap();
        std::fs::write(root.join(".git/ENG-9_x.md"), "x").unwrap();
        std::fs::write(root.join("ENG-2_top-level.md"), "x").unwrap();

        let files = scan(root).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, "ENG-1");
        assert_eq!(files[0].folder, "todo");
    }

    #[tokio::test]
    async fn scan_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan(&dir.path().join("nope")).await.unwrap().is_empty());
    }

    #[test]
    fn duplicates_are_a_consistency_error() {
        let file = |folder: &str| LocalFile {
            path: PathBuf::from(format!("/t/{folder}/ENG-1_a.md")),
            folder: folder.into(),
            id: "ENG-1".into(),
        };
        let err = single_for(vec![file("todo"), file("done")], "ENG-1").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Consistency);
        assert!(single_for(vec![file("todo")], "ENG-2").unwrap().is_none());
    }

    #[tokio::test]
    async fn atomic_write_creates_folders_and_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done/ENG-1_a.md");
        write_atomic(&path, b"hello").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert!(!dir.path().join("done/.ENG-1_a.md.tmp").exists());

        let at = DateTime::parse_from_rfc3339("2023-05-01T12:00:00+02:00").unwrap();
        stamp_mtime(&path, at).await.unwrap();
        assert_eq!(modified_at(&path).await.unwrap(), at);
    }
}
