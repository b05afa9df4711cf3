use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running(u32),
    /// Marker left behind by a process that is gone.
    Stale(u32),
    NotRunning,
}

/// Marker for the running daemon. Removed again on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write our pid, replacing a stale marker. Refuses to start while
    /// another live daemon holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let own = std::process::id();
        if let DaemonStatus::Running(pid) = status(path)? {
            if pid != own {
                bail!("ticketsync is already running (pid {pid})");
            }
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        fs::write(path, format!("{own}\n"))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(pid = own, path = %path.display(), "pid marker written");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove the marker if it is still ours.
        if matches!(read_pid(&self.path), Ok(Some(pid)) if pid == std::process::id()) {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove pid marker");
            }
        }
    }
}

fn as_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

/// Pid recorded in the marker. Missing or garbled markers read as `None`.
pub fn read_pid(path: &Path) -> Result<Option<u32>> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let pid = contents.trim().parse::<u32>().ok().filter(|p| as_pid(*p).is_some());
    if pid.is_none() {
        debug!(path = %path.display(), "ignoring unreadable pid marker");
    }
    Ok(pid)
}

pub fn is_process_alive(pid: u32) -> bool {
    match as_pid(pid) {
        Some(pid) => unsafe { libc::kill(pid, 0) == 0 },
        None => false,
    }
}

pub fn status(path: &Path) -> Result<DaemonStatus> {
    Ok(match read_pid(path)? {
        Some(pid) if is_process_alive(pid) => DaemonStatus::Running(pid),
        Some(pid) => DaemonStatus::Stale(pid),
        None => DaemonStatus::NotRunning,
    })
}

/// Ask the daemon to shut down gracefully.
pub fn terminate(pid: u32) -> Result<()> {
    let Some(target) = as_pid(pid) else {
        bail!("invalid pid {pid}");
    };
    if unsafe { libc::kill(target, libc::SIGTERM) } != 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("Failed to signal process {pid}"));
    }
    Ok(())
}
