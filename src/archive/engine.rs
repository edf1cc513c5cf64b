//! Top-level archiver run: owns the lock, the source session, live intake and
//! the one-time backfill, and shuts them down in order.

use crate::archive::audit;
use crate::archive::backfill::{BackfillCoordinator, BackfillReport, BackfillSettings};
use crate::archive::config::ArchiveConfig;
use crate::archive::cursor::{self, ResyncScope};
use crate::archive::intake::{EventIntake, IntakeOutcome};
use crate::archive::lock::ArchiveLock;
use crate::archive::media::MediaStore;
use crate::archive::paths::ArchivePaths;
use crate::archive::pipeline::{ArchivePipeline, PipelineSettings, PipelineStats};
use crate::error::ArchiveError;
use crate::source::retry::{RetryPolicy, with_timeout};
use crate::source::{MessageSource, SourceEvent};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub backfill: bool,
    pub resync: Option<ResyncScope>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum StopReason {
    Shutdown,
    Disconnected(String),
    StreamClosed,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stopped_by: StopReason,
    pub auth_challenges: u64,
    pub live_messages: u64,
    pub partials_removed: usize,
    pub backfill: Option<BackfillReport>,
    pub backfill_error: Option<String>,
    pub stats: PipelineStats,
}

type BackfillTask = JoinHandle<Result<BackfillReport, String>>;

pub struct Engine {
    cfg: ArchiveConfig,
    tz: Tz,
    paths: ArchivePaths,
    source: Arc<dyn MessageSource>,
}

impl Engine {
    pub fn new(cfg: ArchiveConfig, tz: Tz, paths: ArchivePaths, source: Arc<dyn MessageSource>) -> Self {
        Self {
            cfg,
            tz,
            paths,
            source,
        }
    }

    /// Archive until the source disconnects, its stream ends, `shutdown` flips
    /// to true, or a storage failure makes further writes pointless.
    pub async fn run(
        &self,
        options: RunOptions,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunReport, ArchiveError> {
        let lock = ArchiveLock::acquire(&self.paths.lock_file())?;
        tracing::info!(backup_dir = %self.paths.backup_dir.display(), "archiver starting");

        if let Some(scope) = options.resync {
            let path = self.paths.cursor_file();
            let mut state = cursor::load(&path)?;
            state.reset(scope);
            cursor::save(&path, &state)?;
            tracing::info!(?scope, "backfill cursor reset");
            audit::record(&self.paths, "resync", "ok", &format!("{scope:?}"));
        }

        let partials_removed = MediaStore::new().sweep_partials(&self.paths.media_dir)?;
        if partials_removed > 0 {
            tracing::info!(removed = partials_removed, "removed interrupted media writes");
        }

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(ArchivePipeline::new(
            self.paths.clone(),
            self.source.clone(),
            PipelineSettings::from(&self.cfg),
            fatal_tx,
        )?);

        let retry = RetryPolicy::from(&self.cfg.retry);
        let source = &self.source;
        let limit = self.cfg.fetch_timeout();
        let mut events = match retry
            .run("initialize", || with_timeout(limit, source.initialize()))
            .await
        {
            Ok(events) => events,
            Err(err) => {
                audit::record(&self.paths, "session", "failed", &err.to_string());
                return Err(err.into());
            }
        };
        audit::record(&self.paths, "session", "started", "source initialized");

        let intake = EventIntake::start(
            pipeline.clone(),
            self.cfg.workers,
            self.cfg.queue_capacity,
            self.tz,
        );
        let (backfill_stop, backfill_stop_rx) = watch::channel(false);
        let mut backfill_task: Option<BackfillTask> = None;
        let mut failure: Option<ArchiveError> = None;
        let mut auth_challenges = 0u64;
        let mut live_messages = 0u64;

        let stopped_by = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("shutdown requested");
                        break StopReason::Shutdown;
                    }
                }
                Some(err) = fatal_rx.recv() => {
                    failure = Some(err);
                    break StopReason::Failure;
                }
                event = events.recv() => match event {
                    None => {
                        tracing::warn!("source event stream closed");
                        break StopReason::StreamClosed;
                    }
                    Some(SourceEvent::AuthenticationChallenge(code)) => {
                        auth_challenges += 1;
                        tracing::warn!(code = %code, "authentication required; complete login on the messaging client");
                        audit::record(&self.paths, "session", "auth_challenge", "login code issued");
                    }
                    Some(SourceEvent::Ready) => {
                        tracing::info!("source ready");
                        audit::record(&self.paths, "session", "ready", "");
                        if options.backfill && backfill_task.is_none() {
                            backfill_task = Some(self.spawn_backfill(&pipeline, backfill_stop_rx.clone()));
                        }
                    }
                    Some(SourceEvent::Disconnected(reason)) => {
                        tracing::warn!(reason = %reason, "source disconnected");
                        audit::record(&self.paths, "session", "disconnected", &reason);
                        break StopReason::Disconnected(reason);
                    }
                    Some(SourceEvent::Message(raw)) => {
                        if intake.submit(raw).await == IntakeOutcome::Queued {
                            live_messages += 1;
                        }
                    }
                }
            }
        };

        if backfill_stop.send(true).is_err() {
            tracing::debug!("backfill already finished");
        }
        let (backfill, backfill_error) = match backfill_task {
            None => (None, None),
            Some(task) => match task.await {
                Ok(Ok(report)) => (Some(report), None),
                Ok(Err(message)) => (None, Some(message)),
                Err(err) => (None, Some(format!("backfill task failed: {err}"))),
            },
        };
        intake.close().await;
        pipeline.drain_media().await;
        while let Ok(err) = fatal_rx.try_recv() {
            failure.get_or_insert(err);
        }
        self.source.shutdown().await;

        let report = RunReport {
            stopped_by,
            auth_challenges,
            live_messages,
            partials_removed,
            backfill,
            backfill_error,
            stats: pipeline.stats(),
        };
        drop(lock);

        if let Some(err) = failure {
            audit::record(&self.paths, "run", "failed", &err.to_string());
            return Err(err);
        }
        audit::record(
            &self.paths,
            "run",
            "stopped",
            &format!("{:?} appended={}", report.stopped_by, report.stats.appended),
        );
        tracing::info!(
            appended = report.stats.appended,
            duplicates = report.stats.duplicates,
            media_stored = report.stats.media_stored,
            "archiver stopped"
        );
        Ok(report)
    }

    fn spawn_backfill(
        &self,
        pipeline: &Arc<ArchivePipeline>,
        stop: watch::Receiver<bool>,
    ) -> BackfillTask {
        let coordinator = BackfillCoordinator::new(
            self.source.clone(),
            pipeline.clone(),
            BackfillSettings::from_config(&self.cfg, self.tz),
        );
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            match coordinator.run(stop).await {
                Ok(report) => Ok(report),
                Err(err) => {
                    let message = err.to_string();
                    if err.is_systemic() {
                        pipeline.report_systemic(err);
                    } else {
                        tracing::error!(error = %message, "backfill aborted");
                        audit::record(pipeline.paths(), "backfill", "failed", &message);
                    }
                    Err(message)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::record::{ChatIdentity, MessageRecord};
    use crate::archive::testing::{ScriptedSource, raw};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config() -> ArchiveConfig {
        let mut cfg = ArchiveConfig::default();
        cfg.pacing_interval_ms = 0;
        cfg.retry.max_attempts = 1;
        cfg.retry.base_delay_ms = 0;
        cfg.retry.max_delay_ms = 0;
        cfg
    }

    fn engine(root: &Path, source: Arc<ScriptedSource>) -> Engine {
        Engine::new(test_config(), Tz::UTC, ArchivePaths::new(root), source)
    }

    fn alice() -> ChatIdentity {
        ChatIdentity::new("alice@c.us", "Alice", false)
    }

    fn log_records(root: &Path, key: &str) -> Vec<MessageRecord> {
        fs::read_to_string(root.join("chats").join(key).join("history.log"))
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).expect("record"))
            .collect()
    }

    #[tokio::test]
    async fn mixed_live_messages_store_text_and_available_media() {
        let tmp = tempdir().expect("tempdir");
        let chat = alice();
        let source = Arc::new(
            ScriptedSource::new()
                .with_media("m2", "image/jpeg", b"jpeg")
                .with_events(vec![
                    SourceEvent::Message(raw("m1", &chat, 1_700_000_000, false)),
                    SourceEvent::Message(raw("m2", &chat, 1_700_000_010, true)),
                    SourceEvent::Message(raw("m3", &chat, 1_700_000_020, true)),
                    SourceEvent::Disconnected("logout".to_string()),
                ]),
        );
        let (_tx, rx) = watch::channel(false);
        let report = engine(tmp.path(), source.clone())
            .run(RunOptions::default(), rx)
            .await
            .expect("run");

        assert_eq!(report.stopped_by, StopReason::Disconnected("logout".to_string()));
        let records = log_records(tmp.path(), "Alice");
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert!(records[2].has_media);

        let media_dir = tmp.path().join("media/2023-11-14/Alice");
        assert!(media_dir.join("m2.jpg").exists());
        assert_eq!(fs::read_dir(&media_dir).expect("media").count(), 1);
        assert_eq!(report.stats.media_unavailable, 1);
        assert_eq!(source.shutdowns(), 1);
    }

    #[tokio::test]
    async fn backfill_runs_after_ready_without_duplicating_live_messages() {
        let tmp = tempdir().expect("tempdir");
        let chat = alice();
        let history = (0..3)
            .map(|n| raw(&format!("h{n}"), &chat, 1_700_000_000 + n, false))
            .collect();
        let source = Arc::new(
            ScriptedSource::new()
                .with_chat(chat.clone(), history)
                .with_events(vec![
                    SourceEvent::Message(raw("h2", &chat, 1_700_000_002, false)),
                    SourceEvent::Ready,
                ])
                .keep_open(),
        );
        let (tx, rx) = watch::channel(false);
        let engine = engine(tmp.path(), source.clone());
        let cursor_path = tmp.path().join("state/backfill-cursor.json");

        let run = tokio::spawn(async move {
            engine
                .run(
                    RunOptions {
                        backfill: true,
                        resync: None,
                    },
                    rx,
                )
                .await
        });
        for _ in 0..500 {
            if cursor::load(&cursor_path).is_ok_and(|c| c.sweep_completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).expect("signal");
        let report = run.await.expect("join").expect("run");

        assert_eq!(report.stopped_by, StopReason::Shutdown);
        let backfill = report.backfill.expect("backfill report");
        assert_eq!(backfill.chats_completed, 1);
        let records = log_records(tmp.path(), "Alice");
        assert_eq!(records.len(), 3);
        let mut ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["h0", "h1", "h2"]);
    }

    #[tokio::test]
    async fn second_archiver_on_same_directory_is_refused() {
        let tmp = tempdir().expect("tempdir");
        let _held = ArchiveLock::acquire(&tmp.path().join("state/archiver.lock")).expect("lock");
        let (_tx, rx) = watch::channel(false);
        let err = engine(tmp.path(), Arc::new(ScriptedSource::new()))
            .run(RunOptions::default(), rx)
            .await
            .expect_err("locked");
        assert!(matches!(err, ArchiveError::Locked { .. }));
    }

    #[tokio::test]
    async fn storage_failure_ends_the_run_with_an_error() {
        let tmp = tempdir().expect("tempdir");
        fs::write(tmp.path().join("chats"), b"not a directory").expect("block chats dir");
        let source = Arc::new(ScriptedSource::new().with_events(vec![SourceEvent::Message(
            raw("m1", &alice(), 1_700_000_000, false),
        )]));
        let (_tx, rx) = watch::channel(false);
        let err = engine(tmp.path(), source)
            .run(RunOptions::default(), rx)
            .await
            .expect_err("storage failure");
        assert!(err.is_systemic());
    }

    #[tokio::test]
    async fn resync_reopens_a_completed_sweep() {
        let tmp = tempdir().expect("tempdir");
        let cursor_path = tmp.path().join("state/backfill-cursor.json");
        let mut done = cursor::BackfillCursor::default();
        done.mark_sweep_complete();
        cursor::save(&cursor_path, &done).expect("seed");

        let source = Arc::new(
            ScriptedSource::new().with_events(vec![SourceEvent::Disconnected("bye".to_string())]),
        );
        let (_tx, rx) = watch::channel(false);
        engine(tmp.path(), source)
            .run(
                RunOptions {
                    backfill: false,
                    resync: Some(ResyncScope::All),
                },
                rx,
            )
            .await
            .expect("run");
        assert!(!cursor::load(&cursor_path).expect("cursor").sweep_completed);
    }

    #[tokio::test]
    async fn leftover_partial_media_is_swept_on_start() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("media/2023-11-14/Alice");
        fs::create_dir_all(&dir).expect("dir");
        fs::write(dir.join(".partial-abc"), b"half").expect("partial");
        let source = Arc::new(
            ScriptedSource::new().with_events(vec![SourceEvent::Disconnected("bye".to_string())]),
        );
        let (_tx, rx) = watch::channel(false);
        let report = engine(tmp.path(), source)
            .run(RunOptions::default(), rx)
            .await
            .expect("run");
        assert_eq!(report.partials_removed, 1);
        assert!(!dir.join(".partial-abc").exists());
    }
}
