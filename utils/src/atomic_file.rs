//! A file that is only ever replaced whole.
//!
//! New content is written to a temp file next to the target and renamed over
//! it, so a reader (or the next process after a crash) sees either the
//! previous document or the new one, never a prefix. Where rename cannot
//! overwrite (Windows), the old file is parked at `<name>.bak` for the
//! duration of the swap; [`AtomicFile::read`] restores it if a crash left
//! only the backup behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// Permissions follow the process umask.
    #[default]
    Default,
    /// 0o600 on Unix, ignored elsewhere.
    OwnerOnly,
}

#[derive(Debug, Clone)]
pub struct AtomicFile {
    path: PathBuf,
    mode: PersistMode,
    fsync: bool,
}

impl AtomicFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mode: PersistMode::Default,
            fsync: true,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: PersistMode) -> Self {
        self.mode = mode;
        self
    }

    /// Skip `fsync` of the file and its directory. Only for tests and
    /// scratch data: a crash may then lose the latest write.
    #[must_use]
    pub fn without_fsync(mut self) -> Self {
        self.fsync = false;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    /// Current contents, or `None` if the file does not exist.
    pub fn read(&self) -> io::Result<Option<Vec<u8>>> {
        self.restore_backup();
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Replace the whole file with `bytes`.
    pub fn replace(&self, bytes: &[u8]) -> io::Result<()> {
        let dir = self.dir();
        let mut tmp = NamedTempFile::new_in(dir)?;
        #[cfg(unix)]
        if self.mode == PersistMode::OwnerOnly {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
        }

        tmp.write_all(bytes)?;
        if self.fsync {
            tmp.as_file().sync_all()?;
        }

        if let Err(first) = tmp.persist(&self.path) {
            if !self.path.exists() {
                return Err(first.error);
            }
            self.swap_via_backup(first.file)?;
        }

        if self.fsync {
            sync_dir(dir);
        }
        Ok(())
    }

    fn swap_via_backup(&self, tmp: NamedTempFile) -> io::Result<()> {
        let backup = self.backup_path();
        let _ = fs::remove_file(&backup);
        fs::rename(&self.path, &backup)?;

        if let Err(e) = tmp.persist(&self.path) {
            let _ = fs::rename(&backup, &self.path);
            return Err(e.error);
        }
        if let Err(e) = fs::remove_file(&backup) {
            tracing::warn!(path = %backup.display(), error = %e, "Stale backup left behind");
        }
        Ok(())
    }

    /// Undo a swap that was interrupted after the old file was moved aside.
    fn restore_backup(&self) {
        let backup = self.backup_path();
        if self.path.exists() || !backup.exists() {
            return;
        }
        match fs::rename(&backup, &self.path) {
            Ok(()) => {
                tracing::warn!(path = %self.path.display(), "Restored file from interrupted write");
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Could not restore backup");
            }
        }
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }
}

/// Persist the rename itself. Best-effort: some filesystems refuse to sync a
/// directory handle.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(path = %dir.display(), error = %e, "Directory sync failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
