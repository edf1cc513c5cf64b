//! Live message intake.
//!
//! Messages fan out to a fixed set of workers by chat id, so one chat's
//! messages are always written by the same worker in arrival order while
//! different chats proceed in parallel. Queues are bounded; a full queue makes
//! the event loop wait rather than drop.

use crate::archive::pipeline::ArchivePipeline;
use crate::archive::record::{ChatIdentity, DecodeError, MessageRecord, RawMessage};
use chrono_tz::Tz;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct IntakeItem {
    chat: ChatIdentity,
    record: MessageRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    Queued,
    Excluded,
    Malformed(DecodeError),
    Closed,
}

pub struct EventIntake {
    shards: Vec<mpsc::Sender<IntakeItem>>,
    workers: Vec<JoinHandle<()>>,
    pipeline: Arc<ArchivePipeline>,
    tz: Tz,
}

fn shard_for(chat_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    chat_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

async fn worker_loop(shard: usize, pipeline: Arc<ArchivePipeline>, mut rx: mpsc::Receiver<IntakeItem>) {
    while let Some(item) = rx.recv().await {
        let id = item.record.id.clone();
        match pipeline.write_batch(&item.chat, vec![item.record]).await {
            Ok(outcome) if outcome.duplicates > 0 => {
                tracing::debug!(shard, chat = %item.chat.id, message = %id, "duplicate live message");
            }
            Ok(_) => {}
            Err(err) if err.is_systemic() => pipeline.report_systemic(err),
            Err(err) => {
                tracing::warn!(shard, chat = %item.chat.id, message = %id, error = %err, "live message not archived");
            }
        }
    }
    tracing::debug!(shard, "intake worker stopped");
}

impl EventIntake {
    pub fn start(pipeline: Arc<ArchivePipeline>, workers: usize, queue_capacity: usize, tz: Tz) -> Self {
        let workers = workers.max(1);
        let per_shard = (queue_capacity / workers).max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, rx) = mpsc::channel(per_shard);
            shards.push(tx);
            handles.push(tokio::spawn(worker_loop(shard, pipeline.clone(), rx)));
        }
        Self {
            shards,
            workers: handles,
            pipeline,
            tz,
        }
    }

    /// Validate a live message and queue it for its chat's worker.
    pub async fn submit(&self, raw: RawMessage) -> IntakeOutcome {
        let Some(chat) = raw.chat_identity() else {
            self.pipeline.note_malformed();
            tracing::warn!(message = %raw.id, "dropping live message without a chat");
            return IntakeOutcome::Malformed(DecodeError::MissingChat);
        };
        if !self.pipeline.includes(&chat) {
            self.pipeline.note_excluded();
            return IntakeOutcome::Excluded;
        }
        let record = match raw.into_record(None, self.tz) {
            Ok(record) => record,
            Err(err) => {
                self.pipeline.note_malformed();
                tracing::warn!(chat = %chat.id, error = %err, "dropping malformed live message");
                return IntakeOutcome::Malformed(err);
            }
        };

        let shard = shard_for(&chat.id, self.shards.len());
        match self.shards[shard].send(IntakeItem { chat, record }).await {
            Ok(()) => IntakeOutcome::Queued,
            Err(_) => IntakeOutcome::Closed,
        }
    }

    /// Stop accepting messages and wait for queued ones to be written.
    pub async fn close(self) {
        drop(self.shards);
        for handle in self.workers {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "intake worker panicked");
            }
        }
    }
}
