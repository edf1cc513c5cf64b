//! Shared write path for live and historical messages.
//!
//! Every record goes through `write_batch`: resolve the chat's folder, take the
//! chat's lock, append what is new, release the lock, then hand any attachments
//! to background media tasks. Media never holds the chat lock, and a media
//! failure never undoes the text record.

use crate::archive::chat_keys::ChatKeyMap;
use crate::archive::config::ArchiveConfig;
use crate::archive::dedup::{AppendOutcome, DedupIndex};
use crate::archive::media::{MediaOutcome, MediaStore};
use crate::archive::paths::{ArchivePaths, date_for_timestamp};
use crate::archive::record::{ChatIdentity, MessageRecord};
use crate::error::{ArchiveError, SourceError};
use crate::source::MessageSource;
use crate::source::retry::{RetryPolicy, with_timeout};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub save_groups: bool,
    pub save_media: bool,
    pub media_timeout: Duration,
    pub media_concurrency: usize,
    pub retry: RetryPolicy,
}

impl From<&ArchiveConfig> for PipelineSettings {
    fn from(cfg: &ArchiveConfig) -> Self {
        Self {
            save_groups: cfg.save_groups,
            save_media: cfg.save_media,
            media_timeout: cfg.media_timeout(),
            media_concurrency: cfg.media_concurrency.max(1),
            retry: RetryPolicy::from(&cfg.retry),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub appended: u64,
    pub duplicates: u64,
    pub media_queued: u64,
    /// Id and timestamp of the last record this batch appended.
    pub last_appended: Option<(String, i64)>,
}

#[derive(Debug, Default)]
struct Counters {
    appended: AtomicU64,
    duplicates: AtomicU64,
    excluded: AtomicU64,
    malformed: AtomicU64,
    media_stored: AtomicU64,
    media_skipped: AtomicU64,
    media_unavailable: AtomicU64,
    media_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub appended: u64,
    pub duplicates: u64,
    pub excluded: u64,
    pub malformed: u64,
    pub media_stored: u64,
    pub media_skipped: u64,
    pub media_unavailable: u64,
    pub media_failed: u64,
}

pub struct ArchivePipeline {
    paths: ArchivePaths,
    chat_keys: ChatKeyMap,
    index: DedupIndex,
    media: MediaStore,
    source: Arc<dyn MessageSource>,
    settings: PipelineSettings,
    media_permits: Arc<Semaphore>,
    media_tasks: Mutex<JoinSet<()>>,
    counters: Counters,
    fatal: mpsc::UnboundedSender<ArchiveError>,
}

impl ArchivePipeline {
    /// `fatal` receives systemic errors raised off the caller's task, such as a
    /// media write hitting a full disk.
    pub fn new(
        paths: ArchivePaths,
        source: Arc<dyn MessageSource>,
        settings: PipelineSettings,
        fatal: mpsc::UnboundedSender<ArchiveError>,
    ) -> Result<Self, ArchiveError> {
        let chat_keys = ChatKeyMap::load(&paths.chat_keys_file())?;
        Ok(Self {
            media_permits: Arc::new(Semaphore::new(settings.media_concurrency)),
            media_tasks: Mutex::new(JoinSet::new()),
            paths,
            chat_keys,
            index: DedupIndex::new(),
            media: MediaStore::new(),
            source,
            settings,
            counters: Counters::default(),
            fatal,
        })
    }

    pub fn paths(&self) -> &ArchivePaths {
        &self.paths
    }

    /// Group chats are skipped entirely when group saving is off.
    pub fn includes(&self, chat: &ChatIdentity) -> bool {
        !chat.is_group || self.settings.save_groups
    }

    pub fn note_excluded(&self) {
        self.counters.excluded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_malformed(&self) {
        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_systemic(&self, err: ArchiveError) {
        tracing::error!(error = %err, "systemic archive failure");
        if self.fatal.send(err).is_err() {
            tracing::debug!("no listener for systemic failures");
        }
    }

    /// Append the records that are new for `chat`, in the order given. Returns
    /// after the text is durable; attachments are fetched in the background.
    pub async fn write_batch(
        self: &Arc<Self>,
        chat: &ChatIdentity,
        records: Vec<MessageRecord>,
    ) -> Result<BatchOutcome, ArchiveError> {
        let mut outcome = BatchOutcome::default();
        if records.is_empty() {
            return Ok(outcome);
        }
        if !self.includes(chat) {
            self.counters
                .excluded
                .fetch_add(records.len() as u64, Ordering::Relaxed);
            return Ok(outcome);
        }

        let key = self.chat_keys.key_for(chat).await?;
        let log_path = self
            .paths
            .resolve(&key, date_for_timestamp(records[0].timestamp))?
            .log_path;

        let mut wants_media = Vec::new();
        {
            let mut slot = self.index.lock(&chat.id, &log_path).await;
            for (pos, record) in records.iter().enumerate() {
                match slot.append_if_new(record).await? {
                    AppendOutcome::Appended => {
                        outcome.appended += 1;
                        outcome.last_appended = Some((record.id.clone(), record.timestamp));
                        wants_media.push(pos);
                    }
                    AppendOutcome::Duplicate => {
                        outcome.duplicates += 1;
                        wants_media.push(pos);
                    }
                }
            }
        }
        self.counters
            .appended
            .fetch_add(outcome.appended, Ordering::Relaxed);
        self.counters
            .duplicates
            .fetch_add(outcome.duplicates, Ordering::Relaxed);

        if !self.settings.save_media {
            return Ok(outcome);
        }
        for pos in wants_media {
            let record = &records[pos];
            if !record.has_media || self.media_on_disk(&key, record) {
                continue;
            }
            outcome.media_queued += 1;
            self.spawn_media(&key, record.clone());
        }
        Ok(outcome)
    }

    /// True when the attachment for `record` was already stored. A duplicate
    /// whose blob is missing (killed between append and rename) is fetched
    /// again. Lookup errors count as missing; the media task reports them.
    fn media_on_disk(&self, chat_key: &str, record: &MessageRecord) -> bool {
        let Ok(paths) = self
            .paths
            .resolve(chat_key, date_for_timestamp(record.timestamp))
        else {
            return false;
        };
        matches!(self.media.existing(&paths.media_dir, &record.id), Ok(Some(_)))
    }

    /// Queue a download without waiting for a permit, so slow attachments never
    /// hold up the caller's next text write.
    fn spawn_media(self: &Arc<Self>, chat_key: &str, record: MessageRecord) {
        let pipeline = Arc::clone(self);
        let permits = Arc::clone(&self.media_permits);
        let key = chat_key.to_string();
        let mut tasks = self
            .media_tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::warn!(message = %record.id, "media queue closed; attachment not fetched");
                return;
            };
            pipeline.archive_media(&key, &record).await;
        });
    }

    async fn archive_media(&self, chat_key: &str, record: &MessageRecord) {
        match self.fetch_and_store(chat_key, record).await {
            Ok(MediaOutcome::Stored(path)) => {
                self.counters.media_stored.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(message = %record.id, path = %path.display(), "stored attachment");
            }
            Ok(MediaOutcome::Skipped(path)) => {
                self.counters.media_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(message = %record.id, path = %path.display(), "attachment already stored");
            }
            Err(ArchiveError::Source(SourceError::NotAvailable(reason))) => {
                self.counters
                    .media_unavailable
                    .fetch_add(1, Ordering::Relaxed);
                tracing::info!(message = %record.id, reason = %reason, "attachment no longer available");
            }
            Err(err) if err.is_systemic() => {
                self.counters.media_failed.fetch_add(1, Ordering::Relaxed);
                self.report_systemic(err);
            }
            Err(err) => {
                self.counters.media_failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(message = %record.id, error = %err, "attachment download failed");
            }
        }
    }

    async fn fetch_and_store(
        &self,
        chat_key: &str,
        record: &MessageRecord,
    ) -> Result<MediaOutcome, ArchiveError> {
        let dir = self
            .paths
            .resolve(chat_key, date_for_timestamp(record.timestamp))?
            .media_dir;
        if let Some(path) = self.media.existing(&dir, &record.id)? {
            return Ok(MediaOutcome::Skipped(path));
        }

        let source = &self.source;
        let id = record.id.as_str();
        let limit = self.settings.media_timeout;
        let blob = self
            .settings
            .retry
            .run("download_media", || {
                with_timeout(limit, source.download_media(id))
            })
            .await?;

        let media = self.media.clone();
        let message_id = record.id.clone();
        let task_dir = dir.clone();
        tokio::task::spawn_blocking(move || {
            media.store(&task_dir, &message_id, &blob.mime_type, &blob.bytes)
        })
        .await
        .map_err(|err| ArchiveError::storage(&dir, std::io::Error::other(err)))?
    }

    /// Wait for every in-flight attachment task to finish.
    pub async fn drain_media(&self) {
        loop {
            let mut batch = std::mem::take(
                &mut *self
                    .media_tasks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            );
            if batch.is_empty() {
                break;
            }
            while let Some(joined) = batch.join_next().await {
                if let Err(err) = joined {
                    tracing::warn!(error = %err, "attachment task ended abnormally");
                }
            }
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            appended: c.appended.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            excluded: c.excluded.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            media_stored: c.media_stored.load(Ordering::Relaxed),
            media_skipped: c.media_skipped.load(Ordering::Relaxed),
            media_unavailable: c.media_unavailable.load(Ordering::Relaxed),
            media_failed: c.media_failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::testing::{ScriptedSource, message, pipeline_for};
    use std::fs;
    use tempfile::tempdir;

    fn alice() -> ChatIdentity {
        ChatIdentity::new("alice@c.us", "Alice", false)
    }

    #[tokio::test]
    async fn text_and_media_land_under_resolved_paths() {
        let tmp = tempdir().expect("tempdir");
        let source = ScriptedSource::new().with_media("m2", "image/jpeg", b"jpeg");
        let (pipeline, _fatal) = pipeline_for(tmp.path(), Arc::new(source), true, true);

        let records = vec![
            message("m1", "alice@c.us", 1_700_000_000, false),
            message("m2", "alice@c.us", 1_700_000_060, true),
        ];
        let out = pipeline.write_batch(&alice(), records).await.expect("write");
        assert_eq!(out.appended, 2);
        assert_eq!(out.media_queued, 1);
        pipeline.drain_media().await;

        let log = fs::read_to_string(tmp.path().join("chats/Alice/history.log")).expect("log");
        assert_eq!(log.lines().count(), 2);
        let media_dir = tmp.path().join("media/2023-11-14/Alice");
        assert!(media_dir.join("m2.jpg").exists());
        assert_eq!(fs::read_dir(&media_dir).expect("media").count(), 1);
        assert_eq!(pipeline.stats().media_stored, 1);
    }

    #[tokio::test]
    async fn expired_media_keeps_text_record() {
        let tmp = tempdir().expect("tempdir");
        let (pipeline, _fatal) =
            pipeline_for(tmp.path(), Arc::new(ScriptedSource::new()), true, true);

        let record = message("m3", "alice@c.us", 1_700_000_000, true);
        pipeline
            .write_batch(&alice(), vec![record])
            .await
            .expect("write");
        pipeline.drain_media().await;

        let log = fs::read_to_string(tmp.path().join("chats/Alice/history.log")).expect("log");
        assert!(log.contains("\"id\":\"m3\""));
        assert!(log.contains("\"media\":true"));
        assert!(!tmp.path().join("media/2023-11-14/Alice").exists());
        assert_eq!(pipeline.stats().media_unavailable, 1);
    }

    #[tokio::test]
    async fn stored_media_is_not_refetched_for_duplicates() {
        let tmp = tempdir().expect("tempdir");
        let source = Arc::new(ScriptedSource::new().with_media("m2", "image/png", b"png"));
        let (pipeline, _fatal) = pipeline_for(tmp.path(), source.clone(), true, true);

        let record = message("m2", "alice@c.us", 1_700_000_000, true);
        pipeline
            .write_batch(&alice(), vec![record.clone()])
            .await
            .expect("first");
        pipeline.drain_media().await;
        let again = pipeline
            .write_batch(&alice(), vec![record])
            .await
            .expect("second");
        pipeline.drain_media().await;

        assert_eq!(again.duplicates, 1);
        assert_eq!(again.media_queued, 0);
        assert_eq!(source.media_calls(), 1);
    }

    #[tokio::test]
    async fn duplicate_with_missing_media_fetches_it_again() {
        let tmp = tempdir().expect("tempdir");
        let log = tmp.path().join("chats/Alice/history.log");
        fs::create_dir_all(log.parent().expect("parent")).expect("mkdir");
        let seeded = message("m9", "alice@c.us", 1_700_000_000, true);
        fs::write(
            &log,
            format!("{}\n", serde_json::to_string(&seeded).expect("json")),
        )
        .expect("seed log");

        let source = Arc::new(ScriptedSource::new().with_media("m9", "image/png", b"png"));
        let (pipeline, _fatal) = pipeline_for(tmp.path(), source.clone(), true, true);
        let out = pipeline
            .write_batch(&alice(), vec![seeded])
            .await
            .expect("redeliver");
        pipeline.drain_media().await;

        assert_eq!(out.duplicates, 1);
        assert_eq!(out.media_queued, 1);
        assert_eq!(source.media_calls(), 1);
        assert!(tmp.path().join("media/2023-11-14/Alice/m9.png").exists());
        assert_eq!(fs::read_to_string(&log).expect("log").lines().count(), 1);
    }

    #[tokio::test]
    async fn slow_media_does_not_hold_up_text_writes() {
        let tmp = tempdir().expect("tempdir");
        let source = Arc::new(
            ScriptedSource::new()
                .with_media("s1", "image/png", b"png")
                .with_media("s2", "image/png", b"png")
                .with_slow_media(Duration::from_secs(600)),
        );
        let (pipeline, _fatal) = pipeline_for(tmp.path(), source, true, true);

        // Both media permits end up held by downloads that never finish in time.
        pipeline
            .write_batch(
                &alice(),
                vec![
                    message("s1", "alice@c.us", 1_700_000_000, true),
                    message("s2", "alice@c.us", 1_700_000_001, true),
                ],
            )
            .await
            .expect("first");

        let next = tokio::time::timeout(
            Duration::from_secs(2),
            pipeline.write_batch(
                &alice(),
                vec![
                    message("s3", "alice@c.us", 1_700_000_002, true),
                    message("s4", "alice@c.us", 1_700_000_003, false),
                ],
            ),
        )
        .await
        .expect("text write waited on media")
        .expect("write");
        assert_eq!(next.appended, 2);
        assert_eq!(next.media_queued, 1);

        let log = fs::read_to_string(tmp.path().join("chats/Alice/history.log")).expect("log");
        assert_eq!(log.lines().count(), 4);
    }

    #[tokio::test]
    async fn media_disabled_writes_text_only() {
        let tmp = tempdir().expect("tempdir");
        let source = Arc::new(ScriptedSource::new().with_media("m2", "image/png", b"png"));
        let (pipeline, _fatal) = pipeline_for(tmp.path(), source.clone(), true, false);

        let record = message("m2", "alice@c.us", 1_700_000_000, true);
        let out = pipeline
            .write_batch(&alice(), vec![record])
            .await
            .expect("write");
        assert_eq!(out.media_queued, 0);
        assert_eq!(source.media_calls(), 0);
        assert!(!tmp.path().join("media").exists());
    }

    #[tokio::test]
    async fn excluded_groups_touch_nothing_on_disk() {
        let tmp = tempdir().expect("tempdir");
        let (pipeline, _fatal) =
            pipeline_for(tmp.path(), Arc::new(ScriptedSource::new()), false, true);

        let team = ChatIdentity::new("team@g.us", "Team", true);
        let out = pipeline
            .write_batch(
                &team,
                vec![
                    message("g1", "team@g.us", 1_700_000_000, false),
                    message("g2", "team@g.us", 1_700_000_010, true),
                ],
            )
            .await
            .expect("write");
        pipeline.drain_media().await;
        assert_eq!(out.appended, 0);
        assert_eq!(out.media_queued, 0);
        assert!(!tmp.path().join("chats").exists());
        assert!(!tmp.path().join("media").exists());
        assert!(!tmp.path().join("state/chat-keys.json").exists());
        assert_eq!(pipeline.stats().excluded, 2);
    }

    #[tokio::test]
    async fn text_only_message_creates_no_media_folder() {
        let tmp = tempdir().expect("tempdir");
        let (pipeline, _fatal) =
            pipeline_for(tmp.path(), Arc::new(ScriptedSource::new()), true, true);

        pipeline
            .write_batch(&alice(), vec![message("m1", "alice@c.us", 1_700_000_000, false)])
            .await
            .expect("write");
        pipeline.drain_media().await;

        assert!(tmp.path().join("chats/Alice/history.log").exists());
        assert!(!tmp.path().join("media/2023-11-14/Alice").exists());
        assert!(!tmp.path().join("media").exists());
    }

    #[tokio::test]
    async fn renamed_chat_keeps_its_folder() {
        let tmp = tempdir().expect("tempdir");
        let (pipeline, _fatal) =
            pipeline_for(tmp.path(), Arc::new(ScriptedSource::new()), true, true);

        pipeline
            .write_batch(&alice(), vec![message("m1", "alice@c.us", 1_700_000_000, false)])
            .await
            .expect("first");
        let renamed = ChatIdentity::new("alice@c.us", "Alice Smith", false);
        pipeline
            .write_batch(&renamed, vec![message("m2", "alice@c.us", 1_700_000_100, false)])
            .await
            .expect("second");

        let log = fs::read_to_string(tmp.path().join("chats/Alice/history.log")).expect("log");
        assert_eq!(log.lines().count(), 2);
        assert!(!tmp.path().join("chats/Alice Smith").exists());
    }
}
