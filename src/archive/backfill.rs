//! One-time historical sweep over every chat the source knows about.
//!
//! Chats are visited one at a time with a fixed pause between them. Progress is
//! checkpointed per chat in the cursor file, so an interrupted sweep resumes at
//! the first unfinished chat and a finished sweep is not repeated.

use crate::archive::audit;
use crate::archive::config::{ArchiveConfig, HistoryOrder};
use crate::archive::cursor::{self, BackfillCursor};
use crate::archive::pipeline::ArchivePipeline;
use crate::archive::record::{ChatIdentity, MessageRecord, RawMessage};
use crate::error::ArchiveError;
use crate::source::retry::{RetryPolicy, with_timeout};
use crate::source::{HistoryRequest, MessageSource};
use chrono_tz::Tz;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct BackfillSettings {
    /// `None` fetches the whole history.
    pub limit: Option<usize>,
    pub page_size: usize,
    pub order: HistoryOrder,
    pub pacing: Duration,
    pub page_pacing: Duration,
    pub fetch_timeout: Duration,
    pub retry: RetryPolicy,
    pub tz: Tz,
}

impl BackfillSettings {
    pub fn from_config(cfg: &ArchiveConfig, tz: Tz) -> Self {
        Self {
            limit: cfg.backfill_limit,
            page_size: cfg.page_size.max(1),
            order: cfg.history_order,
            pacing: cfg.pacing_interval(),
            page_pacing: cfg.page_pacing(),
            fetch_timeout: cfg.fetch_timeout(),
            retry: RetryPolicy::from(&cfg.retry),
            tz,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub already_complete: bool,
    pub chats_listed: usize,
    pub chats_excluded: usize,
    pub chats_skipped: usize,
    pub chats_completed: usize,
    pub chats_failed: usize,
    pub messages_appended: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub interrupted: bool,
}

#[derive(Debug, Default)]
struct ChatSweep {
    appended: u64,
    duplicates: u64,
    last: Option<(String, i64)>,
    interrupted: bool,
}

pub struct BackfillCoordinator {
    source: Arc<dyn MessageSource>,
    pipeline: Arc<ArchivePipeline>,
    cursor_path: PathBuf,
    settings: BackfillSettings,
}

fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Sleep for `delay` unless a stop is requested first. Returns false when stopped.
async fn pause(delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if delay.is_zero() {
        return !stop_requested(stop);
    }
    let stopped = async {
        if stop.wait_for(|stopped| *stopped).await.is_err() {
            // Sender gone; no stop can arrive any more.
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = stopped => false,
    }
}

/// Put fetched history in write order: oldest first, then keep the newest `limit`.
/// Ties on timestamp keep the order the source delivered them in.
fn order_for_write(mut records: Vec<MessageRecord>, order: HistoryOrder, limit: Option<usize>) -> Vec<MessageRecord> {
    if order == HistoryOrder::NewestFirst {
        records.reverse();
    }
    records.sort_by_key(|r| r.timestamp);
    if let Some(limit) = limit {
        let excess = records.len().saturating_sub(limit);
        records.drain(..excess);
    }
    records
}

impl BackfillCoordinator {
    pub fn new(
        source: Arc<dyn MessageSource>,
        pipeline: Arc<ArchivePipeline>,
        settings: BackfillSettings,
    ) -> Self {
        let cursor_path = pipeline.paths().cursor_file();
        Self {
            source,
            pipeline,
            cursor_path,
            settings,
        }
    }

    /// Run the sweep. Per-chat failures are recorded and skipped; storage
    /// failures and a failed chat listing end the sweep with an error.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<BackfillReport, ArchiveError> {
        let mut report = BackfillReport::default();
        let mut cursor = cursor::load(&self.cursor_path)?;
        if cursor.sweep_completed {
            tracing::info!("backfill already completed; skipping");
            report.already_complete = true;
            return Ok(report);
        }

        let source = &self.source;
        let chats = self
            .settings
            .retry
            .run("list_chats", || {
                with_timeout(self.settings.fetch_timeout, source.list_chats())
            })
            .await?;
        report.chats_listed = chats.len();
        tracing::info!(chats = chats.len(), "backfill started");
        audit::record(
            self.pipeline.paths(),
            "backfill",
            "started",
            &format!("{} chats listed", chats.len()),
        );

        let mut first = true;
        for chat in &chats {
            if stop_requested(&stop) {
                report.interrupted = true;
                break;
            }
            if !self.pipeline.includes(chat) {
                report.chats_excluded += 1;
                continue;
            }
            if cursor.is_chat_complete(&chat.id) {
                report.chats_skipped += 1;
                continue;
            }
            if !first && !pause(self.settings.pacing, &mut stop).await {
                report.interrupted = true;
                break;
            }
            first = false;

            match self.sweep_chat(chat, &mut stop, &mut report).await {
                Ok(sweep) if sweep.interrupted => {
                    report.messages_appended += sweep.appended;
                    report.duplicates += sweep.duplicates;
                    report.interrupted = true;
                    break;
                }
                Ok(sweep) => {
                    report.messages_appended += sweep.appended;
                    report.duplicates += sweep.duplicates;
                    report.chats_completed += 1;
                    let (last_id, last_ts) = sweep.last.unzip();
                    cursor.mark_chat_complete(&chat.id, last_id, last_ts, sweep.appended);
                    tracing::info!(
                        chat = %chat.id,
                        appended = sweep.appended,
                        duplicates = sweep.duplicates,
                        "chat backfilled"
                    );
                }
                Err(err) if err.is_systemic() => {
                    cursor::save(&self.cursor_path, &cursor)?;
                    return Err(err);
                }
                Err(err) => {
                    report.chats_failed += 1;
                    cursor.mark_chat_failed(&chat.id, &err.to_string());
                    tracing::warn!(chat = %chat.id, error = %err, "chat backfill failed; continuing");
                    audit::record(
                        self.pipeline.paths(),
                        "backfill",
                        "chat_failed",
                        &format!("{}: {err}", chat.id),
                    );
                }
            }
            cursor::save(&self.cursor_path, &cursor)?;
        }

        if report.interrupted {
            tracing::info!("backfill interrupted; progress saved");
            audit::record(self.pipeline.paths(), "backfill", "interrupted", &summary(&report));
            return Ok(report);
        }

        cursor.mark_sweep_complete();
        cursor::save(&self.cursor_path, &cursor)?;
        log_completion(&cursor, &report);
        audit::record(self.pipeline.paths(), "backfill", "completed", &summary(&report));
        Ok(report)
    }

    async fn sweep_chat(
        &self,
        chat: &ChatIdentity,
        stop: &mut watch::Receiver<bool>,
        report: &mut BackfillReport,
    ) -> Result<ChatSweep, ArchiveError> {
        let mut sweep = ChatSweep::default();
        let fetched = match self.fetch_all(chat, stop).await? {
            Some(fetched) => fetched,
            None => {
                sweep.interrupted = true;
                return Ok(sweep);
            }
        };

        let mut records = Vec::with_capacity(fetched.len());
        for raw in fetched {
            let id = raw.id.clone();
            match raw.into_record(Some(&chat.id), self.settings.tz) {
                Ok(record) => records.push(record),
                Err(err) => {
                    report.malformed += 1;
                    self.pipeline.note_malformed();
                    tracing::warn!(chat = %chat.id, message = %id, error = %err, "skipping malformed history message");
                }
            }
        }
        let records = order_for_write(records, self.settings.order, self.settings.limit);

        for chunk in records.chunks(self.settings.page_size) {
            if stop_requested(stop) {
                sweep.interrupted = true;
                break;
            }
            let outcome = self.pipeline.write_batch(chat, chunk.to_vec()).await?;
            sweep.appended += outcome.appended;
            sweep.duplicates += outcome.duplicates;
            if outcome.last_appended.is_some() {
                sweep.last = outcome.last_appended;
            }
        }
        Ok(sweep)
    }

    /// Page through a chat's history up to the limit. `None` when stopped mid-way.
    async fn fetch_all(
        &self,
        chat: &ChatIdentity,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Option<Vec<RawMessage>>, ArchiveError> {
        let source = &self.source;
        let mut collected: Vec<RawMessage> = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let want = match self.settings.limit {
                Some(limit) => limit.saturating_sub(collected.len()).min(self.settings.page_size),
                None => self.settings.page_size,
            };
            if want == 0 {
                break;
            }
            let request = HistoryRequest {
                limit: want,
                page_token: page_token.take(),
            };
            let page = self
                .settings
                .retry
                .run("fetch_history", || {
                    with_timeout(
                        self.settings.fetch_timeout,
                        source.fetch_history(&chat.id, &request),
                    )
                })
                .await?;
            let received = page.messages.len();
            collected.extend(page.messages);
            tracing::debug!(chat = %chat.id, received, total = collected.len(), "history page");

            match page.next_token {
                Some(token) if page.has_more && received > 0 => page_token = Some(token),
                _ => break,
            }
            if !pause(self.settings.page_pacing, stop).await {
                return Ok(None);
            }
        }
        Ok(Some(collected))
    }
}

fn summary(report: &BackfillReport) -> String {
    format!(
        "completed={} failed={} skipped={} excluded={} appended={} duplicates={}",
        report.chats_completed,
        report.chats_failed,
        report.chats_skipped,
        report.chats_excluded,
        report.messages_appended,
        report.duplicates
    )
}

fn log_completion(cursor: &BackfillCursor, report: &BackfillReport) {
    let failed = cursor.failed_chats();
    if failed.is_empty() {
        tracing::info!(summary = %summary(report), "backfill completed");
    } else {
        tracing::warn!(
            summary = %summary(report),
            failed = %failed.join(","),
            "backfill completed with failed chats; run `resync --failed-only` to retry them"
        );
    }
}
