//! Append-only chat history log.
//!
//! Each record is one JSON object terminated by `\n`. JSON string escaping keeps
//! newlines out of a record, so a line without its terminator can only be a write
//! that was interrupted; it is cut off the next time the log is opened. Complete
//! lines are never rewritten or reordered.

use crate::archive::record::MessageRecord;
use crate::error::ArchiveError;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Default)]
pub struct LogScan {
    /// Ids of every parseable record, in log order.
    pub ids: Vec<String>,
    /// Byte length up to and including the last newline.
    pub valid_len: u64,
    pub file_len: u64,
    /// 1-based line numbers of complete lines that failed to parse.
    pub bad_lines: Vec<usize>,
}

impl LogScan {
    pub fn torn_tail(&self) -> bool {
        self.valid_len < self.file_len
    }

    pub fn duplicate_ids(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut dups = Vec::new();
        for id in &self.ids {
            if !seen.insert(id.as_str()) && !dups.contains(id) {
                dups.push(id.clone());
            }
        }
        dups
    }
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

pub fn scan_bytes(bytes: &[u8]) -> LogScan {
    let valid_len = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);

    let mut out = LogScan {
        valid_len: valid_len as u64,
        file_len: bytes.len() as u64,
        ..LogScan::default()
    };

    for (idx, line) in bytes[..valid_len].split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<IdOnly>(line) {
            Ok(entry) if !entry.id.is_empty() => out.ids.push(entry.id),
            _ => out.bad_lines.push(idx + 1),
        }
    }
    out
}

pub async fn scan_log(path: &Path) -> Result<LogScan, ArchiveError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(scan_bytes(&bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(LogScan::default()),
        Err(err) => Err(ArchiveError::storage(path, err)),
    }
}

/// Blocking variant for the report commands.
pub fn scan_log_blocking(path: &Path) -> Result<LogScan, ArchiveError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(scan_bytes(&bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(LogScan::default()),
        Err(err) => Err(ArchiveError::storage(path, err)),
    }
}

/// Cut a torn trailing record. Returns the number of bytes removed.
pub fn repair_torn_tail_blocking(path: &Path) -> Result<u64, ArchiveError> {
    let scan = scan_log_blocking(path)?;
    if !scan.torn_tail() {
        return Ok(0);
    }
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|err| ArchiveError::storage(path, err))?;
    file.set_len(scan.valid_len)
        .and_then(|_| file.sync_data())
        .map_err(|err| ArchiveError::storage(path, err))?;
    Ok(scan.file_len - scan.valid_len)
}

pub fn read_records_blocking(path: &Path) -> Result<Vec<MessageRecord>, ArchiveError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(ArchiveError::storage(path, err)),
    };
    let valid_len = scan_bytes(&bytes).valid_len as usize;
    Ok(bytes[..valid_len]
        .split(|b| *b == b'\n')
        .filter_map(|line| serde_json::from_slice::<MessageRecord>(line).ok())
        .collect())
}

#[derive(Debug)]
pub struct LogWriter {
    path: PathBuf,
    file: File,
    len: u64,
}

impl LogWriter {
    /// Open for appending, creating parent directories and cutting any torn tail.
    /// Returns the scan of the existing content so callers can seed their index.
    pub async fn open(path: &Path) -> Result<(Self, LogScan), ArchiveError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| ArchiveError::storage(parent, err))?;
        }

        let scan = scan_log(path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|err| ArchiveError::storage(path, err))?;

        if scan.torn_tail() {
            tracing::warn!(
                log = %path.display(),
                dropped_bytes = scan.file_len - scan.valid_len,
                "truncating interrupted trailing record"
            );
            file.set_len(scan.valid_len)
                .await
                .map_err(|err| ArchiveError::storage(path, err))?;
            file.sync_data()
                .await
                .map_err(|err| ArchiveError::storage(path, err))?;
        }
        if !scan.bad_lines.is_empty() {
            tracing::warn!(
                log = %path.display(),
                lines = ?scan.bad_lines,
                "skipping unparseable log lines"
            );
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                len: scan.valid_len,
            },
            scan,
        ))
    }

    /// Append one record and sync it to disk before returning.
    pub async fn append(&mut self, record: &MessageRecord) -> Result<(), ArchiveError> {
        let mut line = serde_json::to_vec(record)
            .map_err(|err| ArchiveError::storage(&self.path, io::Error::other(err)))?;
        line.push(b'\n');

        let written = async {
            self.file.write_all(&line).await?;
            self.file.flush().await?;
            self.file.sync_data().await
        }
        .await;

        if let Err(err) = written {
            // Roll back so the next append does not land on a partial line.
            if let Err(rollback) = self.file.set_len(self.len).await {
                tracing::error!(
                    log = %self.path.display(),
                    error = %rollback,
                    "failed to roll back partial append"
                );
            }
            return Err(ArchiveError::storage(&self.path, err));
        }

        self.len += line.len() as u64;
        Ok(())
    }
}
