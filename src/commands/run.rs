use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use crate::archive::config::load_config;
use crate::archive::cursor::ResyncScope;
use crate::archive::engine::{Engine, RunOptions, RunReport, StopReason};
use crate::archive::paths::resolve_paths;
use crate::commands::CommandReport;
use crate::error::ArchiveErrorCode;
use crate::source::bridge::BridgeSource;
use crate::source::retry::RetryPolicy;

#[derive(Debug, Clone, Default)]
pub struct RunCommandOptions {
    pub backup_dir: Option<PathBuf>,
    pub no_backfill: bool,
    pub resync: bool,
    pub resync_failed: bool,
}

impl RunCommandOptions {
    fn engine_options(&self) -> RunOptions {
        let resync = if self.resync {
            Some(ResyncScope::All)
        } else if self.resync_failed {
            Some(ResyncScope::FailedOnly)
        } else {
            None
        };
        RunOptions {
            backfill: !self.no_backfill,
            resync,
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix. A handler that cannot be installed
/// simply never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn describe(report: &mut CommandReport, run: &RunReport) {
    let stopped = match &run.stopped_by {
        StopReason::Shutdown => "shutdown".to_string(),
        StopReason::Disconnected(reason) => format!("disconnected ({reason})"),
        StopReason::StreamClosed => "event stream closed".to_string(),
        StopReason::Failure => "failure".to_string(),
    };
    report.detail(format!("stopped_by={stopped}"));
    report.detail(format!("live_messages={}", run.live_messages));
    report.detail(format!("appended={}", run.stats.appended));
    report.detail(format!("duplicates={}", run.stats.duplicates));
    report.detail(format!("excluded={}", run.stats.excluded));
    report.detail(format!("malformed={}", run.stats.malformed));
    report.detail(format!(
        "media stored={} skipped={} unavailable={} failed={}",
        run.stats.media_stored,
        run.stats.media_skipped,
        run.stats.media_unavailable,
        run.stats.media_failed
    ));
    if run.auth_challenges > 0 {
        report.detail(format!("auth_challenges={}", run.auth_challenges));
    }
    if run.partials_removed > 0 {
        report.detail(format!("partial_media_removed={}", run.partials_removed));
    }
    match &run.backfill {
        Some(bf) if bf.already_complete => report.detail("backfill=already complete"),
        Some(bf) => {
            report.detail(format!(
                "backfill chats completed={} failed={} skipped={} excluded={} interrupted={}",
                bf.chats_completed, bf.chats_failed, bf.chats_skipped, bf.chats_excluded, bf.interrupted
            ));
            if bf.chats_failed > 0 {
                report.detail("hint: run `chat-archive resync --failed-only` to retry failed chats");
            }
        }
        None => {}
    }
    if let Some(err) = &run.backfill_error {
        report.coded_issue(ArchiveErrorCode::E002SourceUnavailable, format!("backfill aborted: {err}"));
    }
}

pub fn run(opts: &RunCommandOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("run");

    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            report.coded_issue(ArchiveErrorCode::E004ConfigInvalid, format!("{err:#}"));
            return Ok(report);
        }
    };
    let tz = cfg.tz()?;
    let paths = resolve_paths(&cfg, opts.backup_dir.as_deref())?;
    report.detail(format!("backup_dir={}", paths.backup_dir.display()));

    let source = BridgeSource::new(&cfg.bridge, cfg.headless, RetryPolicy::from(&cfg.retry))?;
    let engine = Engine::new(cfg, tz, paths, Arc::new(source));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let outcome = runtime.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            shutdown_signal().await;
            if shutdown_tx.send(true).is_err() {
                tracing::debug!("archiver already stopped");
            }
        });
        engine.run(opts.engine_options(), shutdown_rx).await
    });

    match outcome {
        Ok(run) => describe(&mut report, &run),
        Err(err) => report.archive_error(&err),
    }
    Ok(report)
}
