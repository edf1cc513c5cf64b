use anyhow::Result;
use std::path::PathBuf;

use crate::archive::audit;
use crate::archive::config::load_config;
use crate::archive::cursor::{self, ResyncScope};
use crate::archive::lock::ArchiveLock;
use crate::archive::paths::resolve_paths;
use crate::commands::CommandReport;
use crate::error::ArchiveErrorCode;

#[derive(Debug, Clone, Default)]
pub struct ResyncOptions {
    pub backup_dir: Option<PathBuf>,
    pub failed_only: bool,
}

/// Reopen the backfill so the next `run` sweeps again. Text already archived
/// is never rewritten; the sweep only fills gaps.
pub fn run(opts: &ResyncOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("resync");
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            report.coded_issue(ArchiveErrorCode::E004ConfigInvalid, format!("{err:#}"));
            return Ok(report);
        }
    };
    let paths = resolve_paths(&cfg, opts.backup_dir.as_deref())?;

    let _lock = match ArchiveLock::acquire(&paths.lock_file()) {
        Ok(lock) => lock,
        Err(err) => {
            report.archive_error(&err);
            return Ok(report);
        }
    };

    let path = paths.cursor_file();
    let mut state = match cursor::load(&path) {
        Ok(state) => state,
        Err(err) => {
            report.archive_error(&err);
            report.detail(format!("remove {} to start the backfill over", path.display()));
            return Ok(report);
        }
    };

    let scope = if opts.failed_only {
        ResyncScope::FailedOnly
    } else {
        ResyncScope::All
    };
    let pending = state.failed_chats().len();
    state.reset(scope);
    if let Err(err) = cursor::save(&path, &state) {
        report.archive_error(&err);
        return Ok(report);
    }

    match scope {
        ResyncScope::All => report.detail("backfill reset; every chat will be swept on the next run"),
        ResyncScope::FailedOnly => report.detail(format!(
            "backfill reopened; {pending} unfinished chat(s) will be retried on the next run"
        )),
    }
    audit::record(&paths, "resync", "ok", &format!("{scope:?}"));
    Ok(report)
}
