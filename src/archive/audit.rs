use crate::archive::paths::ArchivePaths;
use crate::archive::util::{now_epoch_secs, truncate_with_ellipsis};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;

const MAX_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at_epoch_secs: u64,
    pub phase: String,
    pub status: String,
    pub message: String,
}

pub fn append_event(paths: &ArchivePaths, phase: &str, status: &str, message: &str) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;
    let event = AuditEvent {
        at_epoch_secs: now_epoch_secs(),
        phase: phase.to_string(),
        status: status.to_string(),
        message: truncate_with_ellipsis(message, MAX_MESSAGE_CHARS),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = paths.audit_file();
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Audit failures never interrupt archival; they are logged and dropped.
pub fn record(paths: &ArchivePaths, phase: &str, status: &str, message: &str) {
    if let Err(err) = append_event(paths, phase, status, message) {
        tracing::warn!(phase, status, error = %format!("{err:#}"), "failed to write audit event");
    }
}

pub fn read_events(paths: &ArchivePaths) -> Result<Vec<AuditEvent>> {
    let path = paths.audit_file();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<AuditEvent>(line).ok())
        .collect())
}
