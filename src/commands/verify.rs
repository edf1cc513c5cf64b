use anyhow::Result;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::archive::chat_keys;
use crate::archive::config::load_config;
use crate::archive::cursor;
use crate::archive::lock::ArchiveLock;
use crate::archive::log::{repair_torn_tail_blocking, scan_log_blocking};
use crate::archive::media::MediaStore;
use crate::archive::paths::{ArchivePaths, resolve_paths};
use crate::commands::CommandReport;
use crate::error::ArchiveErrorCode;

include!(concat!(env!("OUT_DIR"), "/env_allowlist.rs"));

const ENV_PREFIX: &str = "CHAT_ARCHIVE_";

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    pub backup_dir: Option<PathBuf>,
    pub repair: bool,
}

fn unknown_env_keys<I>(vars: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut unknown: Vec<String> = vars
        .into_iter()
        .filter(|key| key.starts_with(ENV_PREFIX))
        .filter(|key| !GENERATED_ENV_ALLOWLIST.contains(&key.as_str()))
        .collect();
    unknown.sort();
    unknown
}

fn verify_logs(paths: &ArchivePaths, repair: bool, report: &mut CommandReport) -> Result<()> {
    if !paths.chats_dir.exists() {
        report.detail("chat_logs=0");
        return Ok(());
    }
    let mut checked = 0usize;
    let mut entries: Vec<PathBuf> = fs::read_dir(&paths.chats_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path().join("history.log")))
        .filter(|log| log.is_file())
        .collect();
    entries.sort();

    for log in entries {
        checked += 1;
        let scan = match scan_log_blocking(&log) {
            Ok(scan) => scan,
            Err(err) => {
                report.archive_error(&err);
                continue;
            }
        };
        if scan.torn_tail() {
            if repair {
                match repair_torn_tail_blocking(&log) {
                    Ok(bytes) => report.detail(format!(
                        "repaired torn tail in {} ({bytes} bytes removed)",
                        log.display()
                    )),
                    Err(err) => report.archive_error(&err),
                }
            } else {
                report.coded_issue(
                    ArchiveErrorCode::E005StateCorrupt,
                    format!(
                        "torn trailing record in {} (run `verify --repair`)",
                        log.display()
                    ),
                );
            }
        }
        if !scan.bad_lines.is_empty() {
            report.coded_issue(
                ArchiveErrorCode::E005StateCorrupt,
                format!(
                    "unparseable records in {} at lines {:?}",
                    log.display(),
                    scan.bad_lines
                ),
            );
        }
        let dups = scan.duplicate_ids();
        if !dups.is_empty() {
            report.coded_issue(
                ArchiveErrorCode::E005StateCorrupt,
                format!("duplicate message ids in {}: {}", log.display(), dups.join(",")),
            );
        }
    }
    report.detail(format!("chat_logs={checked}"));
    Ok(())
}

fn verify_chat_keys(paths: &ArchivePaths, report: &mut CommandReport) {
    let entries = match chat_keys::load_entries(&paths.chat_keys_file()) {
        Ok(entries) => entries,
        Err(err) => {
            report.archive_error(&err);
            return;
        }
    };
    let mut owners: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (chat_id, record) in &entries {
        owners.entry(record.key.as_str()).or_default().push(chat_id);
    }
    for (key, ids) in owners.iter().filter(|(_, ids)| ids.len() > 1) {
        report.coded_issue(
            ArchiveErrorCode::E005StateCorrupt,
            format!("folder {key} is pinned to several chats: {}", ids.join(",")),
        );
    }
    report.detail(format!("chats_pinned={}", entries.len()));
}

pub fn run(opts: &VerifyOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("verify");

    let unknown = unknown_env_keys(env::vars_os().filter_map(|(key, _)| key.into_string().ok()));
    for key in &unknown {
        report.coded_issue(
            ArchiveErrorCode::E004ConfigInvalid,
            format!("unknown environment variable {key}"),
        );
    }

    let cfg = match load_config() {
        Ok(cfg) => {
            report.detail("config=ok");
            cfg
        }
        Err(err) => {
            report.coded_issue(ArchiveErrorCode::E004ConfigInvalid, format!("{err:#}"));
            return Ok(report);
        }
    };
    let paths = resolve_paths(&cfg, opts.backup_dir.as_deref())?;
    report.detail(format!("backup_dir={}", paths.backup_dir.display()));

    // Repairs must not race a running archiver.
    let _lock = if opts.repair {
        match ArchiveLock::acquire(&paths.lock_file()) {
            Ok(lock) => Some(lock),
            Err(err) => {
                report.archive_error(&err);
                return Ok(report);
            }
        }
    } else {
        None
    };

    match cursor::load(&paths.cursor_file()) {
        Ok(state) => report.detail(format!(
            "cursor=ok sweep_completed={} chats={}",
            state.sweep_completed,
            state.chats.len()
        )),
        Err(err) => report.archive_error(&err),
    }
    verify_chat_keys(&paths, &mut report);
    verify_logs(&paths, opts.repair, &mut report)?;

    if opts.repair {
        match MediaStore::new().sweep_partials(&paths.media_dir) {
            Ok(removed) => report.detail(format!("partial_media_removed={removed}")),
            Err(err) => report.archive_error(&err),
        }
    }

    Ok(report)
}
