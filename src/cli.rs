use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::CommandReport;
use crate::commands::{resync, run, status, verify};

/// Exit status when a command completed but reported issues.
const EXIT_ISSUES: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "chat-archive",
    version,
    about = "Incremental chat-history archiver: live capture, paced backfill, append-only logs"
)]
struct Cli {
    /// Print the command report as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct BackupDirArg {
    /// Backup root; overrides config and CHAT_ARCHIVE_BACKUP_DIR.
    #[arg(long, value_name = "PATH")]
    backup_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to the messaging bridge and archive until disconnected or interrupted.
    Run {
        #[command(flatten)]
        dir: BackupDirArg,
        /// Only capture live messages; skip the historical sweep.
        #[arg(long)]
        no_backfill: bool,
        /// Forget backfill progress and sweep every chat again.
        #[arg(long, conflicts_with = "resync_failed")]
        resync: bool,
        /// Retry only chats whose backfill failed.
        #[arg(long)]
        resync_failed: bool,
    },
    /// Summarize the archive, backfill progress and lock state.
    Status {
        #[command(flatten)]
        dir: BackupDirArg,
    },
    /// Reopen the backfill so the next run sweeps again.
    Resync {
        #[command(flatten)]
        dir: BackupDirArg,
        /// Keep completed chats; retry only the unfinished ones.
        #[arg(long)]
        failed_only: bool,
    },
    /// Check logs, state files and environment for problems.
    Verify {
        #[command(flatten)]
        dir: BackupDirArg,
        /// Cut torn trailing records and remove interrupted media writes.
        #[arg(long)]
        repair: bool,
    },
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    let state = if report.ok { "ok" } else { "issues" };
    println!("{}: {state}", report.command);
    for detail in &report.details {
        println!("  {detail}");
    }
    if !report.issues.is_empty() {
        println!("issues:");
        for issue in &report.issues {
            println!("  - {issue}");
        }
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let report = match cli.command {
        Command::Run {
            dir,
            no_backfill,
            resync,
            resync_failed,
        } => run::run(&run::RunCommandOptions {
            backup_dir: dir.backup_dir,
            no_backfill,
            resync,
            resync_failed,
        })?,
        Command::Status { dir } => status::run(&status::StatusOptions {
            backup_dir: dir.backup_dir,
        })?,
        Command::Resync { dir, failed_only } => resync::run(&resync::ResyncOptions {
            backup_dir: dir.backup_dir,
            failed_only,
        })?,
        Command::Verify { dir, repair } => verify::run(&verify::VerifyOptions {
            backup_dir: dir.backup_dir,
            repair,
        })?,
    };

    print_report(&report, cli.json)?;
    if !report.ok {
        std::process::exit(EXIT_ISSUES);
    }
    Ok(())
}
