use crate::error::ArchiveError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Exclusive hold on a backup directory. Released when dropped or when the
/// process exits, so a crash never leaves a stale lock behind.
#[derive(Debug)]
pub struct ArchiveLock {
    path: PathBuf,
    file: File,
}

impl ArchiveLock {
    pub fn acquire(path: &Path) -> Result<Self, ArchiveError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| ArchiveError::storage(parent, err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| ArchiveError::storage(path, err))?;
        if file.try_lock_exclusive().is_err() {
            return Err(ArchiveError::Locked {
                path: path.to_path_buf(),
            });
        }
        file.set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()))
            .and_then(|_| file.sync_data())
            .map_err(|err| ArchiveError::storage(path, err))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), error = %err, "failed to release archive lock");
        }
    }
}

/// Pid of the running archiver holding `path`, if any.
pub fn holder(path: &Path) -> io::Result<Option<u32>> {
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    if file.try_lock_exclusive().is_ok() {
        FileExt::unlock(&file)?;
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(raw.trim().parse::<u32>().ok().or(Some(0)))
}
