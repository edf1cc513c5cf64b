use crate::archive::paths::{check_component, chat_key_for};
use crate::archive::record::ChatIdentity;
use crate::archive::util::{now_epoch_secs, write_json_atomic};
use crate::error::ArchiveError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatKeyRecord {
    pub key: String,
    pub display_name: String,
    pub is_group: bool,
    pub pinned_at_epoch_secs: u64,
}

/// Pins each chat id to the folder key it was first archived under, so renames
/// keep writing to the same folder and two chats never share one.
#[derive(Debug)]
pub struct ChatKeyMap {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, ChatKeyRecord>>,
}

pub fn id_suffix(chat_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chat_id.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..8].to_string()
}

pub fn load_entries(path: &Path) -> Result<BTreeMap<String, ChatKeyRecord>, ArchiveError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(ArchiveError::storage(path, err)),
    };
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&raw).map_err(|err| ArchiveError::State {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

impl ChatKeyMap {
    pub fn load(path: &Path) -> Result<Self, ArchiveError> {
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(load_entries(path)?),
        })
    }

    /// Folder key for a chat, pinning a new one on first sight. Pins are
    /// serialized so two new chats never claim the same key.
    pub async fn key_for(&self, chat: &ChatIdentity) -> Result<String, ArchiveError> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(&chat.id) {
            return Ok(existing.key.clone());
        }

        let base = chat_key_for(&chat.id, &chat.name);
        let taken = entries.values().any(|r| r.key == base);
        let key = if taken {
            format!("{base}_{}", id_suffix(&chat.id))
        } else {
            base
        };
        check_component(&key)?;

        let mut next = entries.clone();
        next.insert(
            chat.id.clone(),
            ChatKeyRecord {
                key: key.clone(),
                display_name: chat.name.clone(),
                is_group: chat.is_group,
                pinned_at_epoch_secs: now_epoch_secs(),
            },
        );
        let path = self.path.clone();
        *entries = tokio::task::spawn_blocking(move || write_json_atomic(&path, &next).map(|_| next))
            .await
            .map_err(|err| ArchiveError::storage(&self.path, io::Error::other(err)))??;

        tracing::info!(chat = %chat.id, key = %key, "pinned archive folder for chat");
        Ok(key)
    }
}
