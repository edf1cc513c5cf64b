//! Per-chat membership index over the persisted logs.
//!
//! The log file is the source of truth; the in-memory set is a cache seeded from
//! it on first touch and only ever grows. Each chat's set and log writer sit
//! behind one async mutex, so check-then-append is a single critical section
//! for live intake and backfill alike.

use crate::archive::log::LogWriter;
use crate::archive::record::MessageRecord;
use crate::error::ArchiveError;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    Duplicate,
}

#[derive(Debug, Default)]
pub struct ChatSlot {
    log_path: PathBuf,
    seen: HashSet<String>,
    writer: Option<LogWriter>,
}

impl ChatSlot {
    async fn ensure_loaded(&mut self) -> Result<&mut LogWriter, ArchiveError> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                let (writer, scan) = LogWriter::open(&self.log_path).await?;
                self.seen.extend(scan.ids);
                tracing::debug!(
                    log = %self.log_path.display(),
                    known = self.seen.len(),
                    "loaded dedup index from log"
                );
                writer
            }
        };
        Ok(self.writer.insert(writer))
    }

    pub async fn has(&mut self, message_id: &str) -> Result<bool, ArchiveError> {
        self.ensure_loaded().await?;
        Ok(self.seen.contains(message_id))
    }

    /// Mark an id as persisted. Only called after its append succeeded.
    fn record(&mut self, message_id: &str) {
        self.seen.insert(message_id.to_string());
    }

    /// Append unless the id is already in the log.
    pub async fn append_if_new(
        &mut self,
        record: &MessageRecord,
    ) -> Result<AppendOutcome, ArchiveError> {
        if self.has(&record.id).await? {
            return Ok(AppendOutcome::Duplicate);
        }
        self.ensure_loaded().await?.append(record).await?;
        self.record(&record.id);
        Ok(AppendOutcome::Appended)
    }
}

pub type ChatGuard = OwnedMutexGuard<ChatSlot>;

#[derive(Debug, Default)]
pub struct DedupIndex {
    chats: Mutex<HashMap<String, Arc<AsyncMutex<ChatSlot>>>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, chat_id: &str, log_path: &Path) -> Arc<AsyncMutex<ChatSlot>> {
        let mut chats = self
            .chats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        chats
            .entry(chat_id.to_string())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(ChatSlot {
                    log_path: log_path.to_path_buf(),
                    ..ChatSlot::default()
                }))
            })
            .clone()
    }

    /// Exclusive access to one chat's index and log. Callers for the same chat
    /// queue here in arrival order; different chats never contend.
    pub async fn lock(&self, chat_id: &str, log_path: &Path) -> ChatGuard {
        self.slot(chat_id, log_path).lock_owned().await
    }
}
