//! Single-instance guard: at most one pass runs per node at a time.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

/// Exclusive `flock` on a lock file, released when dropped.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    // The lock lives as long as the descriptor.
    _file: File,
}

impl InstanceLock {
    /// Take the lock without blocking. Fails if another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open instance lock file {}", path.display()))?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            bail!(
                "another pve-autosnap pass is already running on this node (lock held: {})",
                path.display()
            );
        }
        debug!(path = %path.display(), "instance lock acquired");

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
