use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::audit;
use crate::archive::chat_keys;
use crate::archive::config::load_config;
use crate::archive::cursor;
use crate::archive::lock;
use crate::archive::log::read_records_blocking;
use crate::archive::paths::{ArchivePaths, resolve_paths};
use crate::commands::CommandReport;
use crate::error::ArchiveErrorCode;

#[derive(Debug, Clone, Default)]
pub struct StatusOptions {
    pub backup_dir: Option<PathBuf>,
}

fn chat_logs(paths: &ArchivePaths) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    if !paths.chats_dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(&paths.chats_dir)? {
        let dir = entry?.path();
        let log = dir.join("history.log");
        if dir.is_dir() && log.is_file() {
            let key = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            out.push((key, log));
        }
    }
    out.sort();
    Ok(out)
}

fn count_media(root: &Path) -> usize {
    let Ok(entries) = fs::read_dir(root) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .map(|path| {
            if path.is_dir() {
                count_media(&path)
            } else {
                1
            }
        })
        .sum()
}

pub fn run(opts: &StatusOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("status");
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            report.coded_issue(ArchiveErrorCode::E004ConfigInvalid, format!("{err:#}"));
            return Ok(report);
        }
    };
    let paths = resolve_paths(&cfg, opts.backup_dir.as_deref())?;
    report.detail(format!("backup_dir={}", paths.backup_dir.display()));
    report.detail(format!(
        "save_groups={} save_media={} backfill_limit={}",
        cfg.save_groups,
        cfg.save_media,
        cfg.backfill_limit
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unbounded".to_string())
    ));

    match lock::holder(&paths.lock_file()) {
        Ok(Some(pid)) => report.detail(format!("archiver=running pid={pid}")),
        Ok(None) => report.detail("archiver=idle"),
        Err(err) => report.issue(format!("lock file unreadable: {err}")),
    }

    match chat_keys::load_entries(&paths.chat_keys_file()) {
        Ok(entries) => report.detail(format!("chats_pinned={}", entries.len())),
        Err(err) => report.archive_error(&err),
    }

    let logs = chat_logs(&paths)?;
    let mut total = 0usize;
    for (key, log) in &logs {
        match read_records_blocking(log) {
            Ok(records) => {
                total += records.len();
                let last = records.last().map(|r| r.time.as_str()).unwrap_or("-");
                report.detail(format!("chat {key}: messages={} last={last}", records.len()));
            }
            Err(err) => report.archive_error(&err),
        }
    }
    report.detail(format!("chat_logs={} messages={total}", logs.len()));
    report.detail(format!("media_files={}", count_media(&paths.media_dir)));

    match cursor::load(&paths.cursor_file()) {
        Ok(state) => {
            let completed = state.chats.values().filter(|c| c.completed).count();
            report.detail(format!(
                "backfill sweep_completed={} chats_completed={completed}",
                state.sweep_completed
            ));
            let failed = state.failed_chats();
            if !failed.is_empty() {
                report.detail(format!("backfill chats_pending={}", failed.join(",")));
                if state.sweep_completed {
                    report.issue(format!(
                        "{} chat(s) failed during backfill; run `chat-archive resync --failed-only`",
                        failed.len()
                    ));
                }
            }
        }
        Err(err) => report.archive_error(&err),
    }

    match audit::read_events(&paths) {
        Ok(events) => {
            if let Some(last) = events.last() {
                report.detail(format!(
                    "last_event={} {} at={}",
                    last.phase, last.status, last.at_epoch_secs
                ));
            }
        }
        Err(err) => report.issue(format!("audit log unreadable: {err:#}")),
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn media_count_walks_date_folders() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("2023-11-14/Alice");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("m1.jpg"), b"x").expect("write");
        fs::write(dir.join("m2.ogg"), b"y").expect("write");
        assert_eq!(count_media(tmp.path()), 2);
        assert_eq!(count_media(&tmp.path().join("absent")), 0);
    }

    #[test]
    fn chat_logs_lists_only_folders_with_history() {
        let tmp = tempdir().expect("tempdir");
        let paths = ArchivePaths::new(tmp.path());
        fs::create_dir_all(paths.chats_dir.join("Bob")).expect("mkdir");
        fs::create_dir_all(paths.chats_dir.join("Alice")).expect("mkdir");
        fs::write(paths.chats_dir.join("Alice/history.log"), "").expect("write");
        let logs = chat_logs(&paths).expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].0, "Alice");
    }
}
