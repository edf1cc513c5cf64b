use std::env;
use tracing_subscriber::EnvFilter;

const DEFAULT_LEVEL: &str = "info";

fn filter_directive(archive_level: Option<String>, rust_log: Option<String>) -> String {
    let non_blank = |v: String| {
        let trimmed = v.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    };
    archive_level
        .and_then(non_blank)
        .or_else(|| rust_log.and_then(non_blank))
        .unwrap_or_else(|| DEFAULT_LEVEL.to_string())
}

/// Install the global subscriber. Logs go to stderr; stdout carries command reports.
pub fn init() {
    let directive = filter_directive(
        env::var("CHAT_ARCHIVE_LOG").ok(),
        env::var("RUST_LOG").ok(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
