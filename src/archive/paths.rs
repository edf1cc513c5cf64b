use crate::archive::config::ArchiveConfig;
use crate::error::ArchiveError;
use anyhow::Result;
use chrono::{DateTime, NaiveDate};
use std::env;
use std::path::{Path, PathBuf};

/// Longest file or directory name most filesystems accept, in bytes.
pub const MAX_COMPONENT_BYTES: usize = 255;

const FALLBACK_KEY: &str = "chat";

#[derive(Debug, Clone)]
pub struct ArchivePaths {
    pub backup_dir: PathBuf,
    pub chats_dir: PathBuf,
    pub media_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl ArchivePaths {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        let backup_dir = backup_dir.into();
        Self {
            chats_dir: backup_dir.join("chats"),
            media_dir: backup_dir.join("media"),
            state_dir: backup_dir.join("state"),
            logs_dir: backup_dir.join("logs"),
            backup_dir,
        }
    }

    pub fn cursor_file(&self) -> PathBuf {
        self.state_dir.join("backfill-cursor.json")
    }

    pub fn chat_keys_file(&self) -> PathBuf {
        self.state_dir.join("chat-keys.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("archiver.lock")
    }

    pub fn audit_file(&self) -> PathBuf {
        self.logs_dir.join("audit.log")
    }

    /// Storage locations for one chat on one calendar date. Pure; touches no files.
    pub fn resolve(&self, chat_key: &str, date: NaiveDate) -> Result<ChatPaths, ArchiveError> {
        check_component(chat_key)?;
        Ok(ChatPaths {
            log_path: self.chats_dir.join(chat_key).join("history.log"),
            media_dir: self
                .media_dir
                .join(date.format("%Y-%m-%d").to_string())
                .join(chat_key),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPaths {
    pub log_path: PathBuf,
    pub media_dir: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

/// Backup root: CLI override, then config (`backup_dir` / `CHAT_ARCHIVE_BACKUP_DIR`),
/// then `~/chat-archive`.
pub fn resolve_paths(cfg: &ArchiveConfig, cli_override: Option<&Path>) -> Result<ArchivePaths> {
    if let Some(dir) = cli_override {
        return Ok(ArchivePaths::new(dir));
    }
    if let Some(dir) = &cfg.backup_dir {
        return Ok(ArchivePaths::new(dir));
    }
    match env::var("CHAT_ARCHIVE_BACKUP_DIR") {
        Ok(dir) if !dir.trim().is_empty() => return Ok(ArchivePaths::new(dir.trim())),
        _ => {}
    }
    Ok(ArchivePaths::new(required_home_dir()?.join("chat-archive")))
}

/// Keep ASCII letters, digits, `_`, `-` and space; everything else becomes `_`.
/// Surrounding spaces are trimmed.
pub fn sanitize_component(input: &str) -> String {
    let replaced: String = input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == ' ' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    replaced.trim().to_string()
}

/// Human-readable key for a chat: the sanitized display name, or the sanitized
/// stable id when the name has nothing left after sanitizing.
pub fn chat_key_for(chat_id: &str, display_name: &str) -> String {
    let from_name = sanitize_component(display_name);
    if !from_name.is_empty() {
        return from_name;
    }
    let from_id = sanitize_component(chat_id);
    if !from_id.is_empty() {
        return from_id;
    }
    FALLBACK_KEY.to_string()
}

pub fn check_component(component: &str) -> Result<(), ArchiveError> {
    if component.len() > MAX_COMPONENT_BYTES {
        return Err(ArchiveError::PathTooLong {
            component: component.to_string(),
        });
    }
    Ok(())
}

/// UTC calendar date of a unix timestamp; out-of-range values clamp to the epoch.
pub fn date_for_timestamp(timestamp: i64) -> NaiveDate {
    DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .date_naive()
}
