use crate::error::ArchiveError;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix epoch in seconds; a clock before the epoch reads as 0.
pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Replace `path` with pretty JSON via a synced temp file in the same directory.
/// Readers see either the old file or the new one, never a mix.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ArchiveError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| ArchiveError::storage(parent, err))?;

    let data = serde_json::to_string_pretty(value)
        .map_err(|err| ArchiveError::storage(path, io::Error::other(err)))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".state-")
        .tempfile_in(parent)
        .map_err(|err| ArchiveError::storage(parent, err))?;
    tmp.write_all(format!("{data}\n").as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| ArchiveError::storage(tmp.path(), err))?;
    tmp.persist(path)
        .map_err(|err| ArchiveError::storage(path, err.error))?;
    Ok(())
}

/// Shorten `input` to `max_chars`, dropping control characters and marking the cut with `…`.
pub fn truncate_with_ellipsis(input: &str, max_chars: usize) -> String {
    let clean: String = input.chars().filter(|c| !c.is_control()).collect();
    if clean.chars().count() > max_chars {
        let mut s: String = clean.chars().take(max_chars).collect();
        s.push('…');
        s
    } else {
        clean
    }
}
