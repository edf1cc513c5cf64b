use crate::archive::util::{now_epoch_secs, write_json_atomic};
use crate::error::ArchiveError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatCursor {
    pub completed: bool,
    pub last_seen_id: Option<String>,
    pub last_timestamp: Option<i64>,
    pub messages_written: u64,
    pub last_error: Option<String>,
    pub updated_at_epoch_secs: u64,
}

/// Backfill progress, keyed by stable chat id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillCursor {
    pub schema_version: u32,
    pub sweep_completed: bool,
    pub completed_at_epoch_secs: Option<u64>,
    pub chats: BTreeMap<String, ChatCursor>,
}

impl Default for BackfillCursor {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            sweep_completed: false,
            completed_at_epoch_secs: None,
            chats: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncScope {
    /// Forget all progress; every chat is swept again.
    All,
    /// Keep completed chats; retry only those that failed or never finished.
    FailedOnly,
}

impl BackfillCursor {
    pub fn is_chat_complete(&self, chat_id: &str) -> bool {
        self.chats.get(chat_id).is_some_and(|c| c.completed)
    }

    pub fn mark_chat_complete(
        &mut self,
        chat_id: &str,
        last_seen_id: Option<String>,
        last_timestamp: Option<i64>,
        written: u64,
    ) {
        let entry = self.chats.entry(chat_id.to_string()).or_default();
        entry.completed = true;
        if last_seen_id.is_some() {
            entry.last_seen_id = last_seen_id;
            entry.last_timestamp = last_timestamp;
        }
        entry.messages_written += written;
        entry.last_error = None;
        entry.updated_at_epoch_secs = now_epoch_secs();
    }

    pub fn mark_chat_failed(&mut self, chat_id: &str, error: &str) {
        let entry = self.chats.entry(chat_id.to_string()).or_default();
        entry.completed = false;
        entry.last_error = Some(error.to_string());
        entry.updated_at_epoch_secs = now_epoch_secs();
    }

    pub fn mark_sweep_complete(&mut self) {
        self.sweep_completed = true;
        self.completed_at_epoch_secs = Some(now_epoch_secs());
    }

    pub fn failed_chats(&self) -> Vec<&str> {
        self.chats
            .iter()
            .filter(|(_, c)| !c.completed)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn reset(&mut self, scope: ResyncScope) {
        self.sweep_completed = false;
        self.completed_at_epoch_secs = None;
        if scope == ResyncScope::All {
            self.chats.clear();
        }
    }
}

pub fn load(path: &Path) -> Result<BackfillCursor, ArchiveError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BackfillCursor::default()),
        Err(err) => return Err(ArchiveError::storage(path, err)),
    };
    if raw.trim().is_empty() {
        return Ok(BackfillCursor::default());
    }
    serde_json::from_str(&raw).map_err(|err| ArchiveError::State {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

pub fn save(path: &Path, cursor: &BackfillCursor) -> Result<(), ArchiveError> {
    write_json_atomic(path, cursor)
}
