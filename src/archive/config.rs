use anyhow::{Result, anyhow};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryOrder {
    NewestFirst,
    OldestFirst,
}

impl HistoryOrder {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "newest_first" | "newest-first" => Some(Self::NewestFirst),
            "oldest_first" | "oldest-first" => Some(Self::OldestFirst),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub url: String,
    pub command: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3210".to_string(),
            command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub backup_dir: Option<PathBuf>,
    pub save_groups: bool,
    pub save_media: bool,
    /// `None` means the whole history.
    #[serde(deserialize_with = "deserialize_limit")]
    pub backfill_limit: Option<usize>,
    pub headless: bool,
    pub pacing_interval_ms: u64,
    pub page_pacing_ms: u64,
    pub page_size: usize,
    pub history_order: HistoryOrder,
    pub fetch_timeout_secs: u64,
    pub media_timeout_secs: u64,
    pub workers: usize,
    pub queue_capacity: usize,
    pub media_concurrency: usize,
    pub timezone: String,
    pub bridge: BridgeConfig,
    pub retry: RetryConfig,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            backup_dir: None,
            save_groups: true,
            save_media: true,
            backfill_limit: Some(1000),
            headless: true,
            pacing_interval_ms: 2000,
            page_pacing_ms: 0,
            page_size: 100,
            history_order: HistoryOrder::NewestFirst,
            fetch_timeout_secs: 60,
            media_timeout_secs: 120,
            workers: 4,
            queue_capacity: 256,
            media_concurrency: 4,
            timezone: "UTC".to_string(),
            bridge: BridgeConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ArchiveConfig {
    pub fn pacing_interval(&self) -> Duration {
        Duration::from_millis(self.pacing_interval_ms)
    }

    pub fn page_pacing(&self) -> Duration {
        Duration::from_millis(self.page_pacing_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn media_timeout(&self) -> Duration {
        Duration::from_secs(self.media_timeout_secs)
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .trim()
            .parse::<Tz>()
            .map_err(|_| anyhow!("invalid timezone `{}`", self.timezone))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLimit {
    Count(u64),
    Word(String),
}

fn parse_limit(raw: &str) -> Option<Option<usize>> {
    let trimmed = raw.trim();
    match trimmed {
        "unbounded" | "all" | "infinity" | "Infinity" => Some(None),
        _ => trimmed
            .parse::<usize>()
            .ok()
            .map(|n| if n == 0 { None } else { Some(n) }),
    }
}

fn deserialize_limit<'de, D>(deserializer: D) -> std::result::Result<Option<usize>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match RawLimit::deserialize(deserializer)? {
        RawLimit::Count(0) => Ok(None),
        RawLimit::Count(n) => Ok(Some(n as usize)),
        RawLimit::Word(word) => parse_limit(&word)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid backfill_limit `{word}`"))),
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_usize(var: &str, fallback: usize) -> usize {
    match env::var(var) {
        Ok(v) => v.trim().parse::<usize>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => {
            let trimmed = v.trim();
            match trimmed {
                "1" | "true" | "TRUE" | "yes" | "on" => true,
                "0" | "false" | "FALSE" | "no" | "off" => false,
                _ => fallback,
            }
        }
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_optional_string(var: &str) -> Option<String> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

pub fn validate(cfg: &ArchiveConfig) -> Result<()> {
    if cfg.page_size == 0 {
        return Err(anyhow!("invalid page size: must be >= 1"));
    }
    if cfg.workers == 0 {
        return Err(anyhow!("invalid worker count: must be >= 1"));
    }
    if cfg.queue_capacity == 0 {
        return Err(anyhow!("invalid queue capacity: must be >= 1"));
    }
    if cfg.media_concurrency == 0 {
        return Err(anyhow!("invalid media concurrency: must be >= 1"));
    }
    if cfg.fetch_timeout_secs == 0 || cfg.media_timeout_secs == 0 {
        return Err(anyhow!("invalid timeouts: must be >= 1 second"));
    }
    if cfg.retry.max_attempts == 0 {
        return Err(anyhow!("invalid retry attempts: must be >= 1"));
    }
    if cfg.retry.base_delay_ms > cfg.retry.max_delay_ms {
        return Err(anyhow!(
            "invalid retry delays: require base_delay_ms <= max_delay_ms"
        ));
    }
    if cfg.bridge.url.trim().is_empty() {
        return Err(anyhow!("invalid bridge url: cannot be empty"));
    }
    cfg.tz()?;
    Ok(())
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("CHAT_ARCHIVE_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let home = dirs::home_dir()?;
    Some(home.join(".chat-archive").join("config.toml"))
}

fn load_file_config() -> Result<ArchiveConfig> {
    let Some(path) = resolve_config_path() else {
        return Ok(ArchiveConfig::default());
    };
    if !path.exists() {
        return Ok(ArchiveConfig::default());
    }

    let raw = fs::read_to_string(&path)?;
    toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse archive config {}: {err}", path.display()))
}

fn apply_env_overrides(cfg: &mut ArchiveConfig) -> Result<()> {
    if let Some(dir) = env_optional_string("CHAT_ARCHIVE_BACKUP_DIR") {
        cfg.backup_dir = Some(PathBuf::from(dir));
    }
    cfg.save_groups = env_or_bool("CHAT_ARCHIVE_SAVE_GROUPS", cfg.save_groups);
    cfg.save_media = env_or_bool("CHAT_ARCHIVE_SAVE_MEDIA", cfg.save_media);
    if let Some(raw) = env_optional_string("CHAT_ARCHIVE_BACKFILL_LIMIT") {
        cfg.backfill_limit =
            parse_limit(&raw).ok_or_else(|| anyhow!("invalid backfill limit `{raw}`"))?;
    }
    cfg.headless = env_or_bool("CHAT_ARCHIVE_HEADLESS", cfg.headless);
    cfg.pacing_interval_ms =
        env_or_u64("CHAT_ARCHIVE_PACING_INTERVAL_MS", cfg.pacing_interval_ms);
    cfg.page_pacing_ms = env_or_u64("CHAT_ARCHIVE_PAGE_PACING_MS", cfg.page_pacing_ms);
    cfg.page_size = env_or_usize("CHAT_ARCHIVE_PAGE_SIZE", cfg.page_size);
    if let Some(raw) = env_optional_string("CHAT_ARCHIVE_HISTORY_ORDER") {
        cfg.history_order = HistoryOrder::parse(&raw)
            .ok_or_else(|| anyhow!("invalid history order `{raw}`: use newest_first or oldest_first"))?;
    }
    cfg.fetch_timeout_secs = env_or_u64("CHAT_ARCHIVE_FETCH_TIMEOUT_SECS", cfg.fetch_timeout_secs);
    cfg.media_timeout_secs = env_or_u64("CHAT_ARCHIVE_MEDIA_TIMEOUT_SECS", cfg.media_timeout_secs);
    cfg.workers = env_or_usize("CHAT_ARCHIVE_WORKERS", cfg.workers);
    cfg.queue_capacity = env_or_usize("CHAT_ARCHIVE_QUEUE_CAPACITY", cfg.queue_capacity);
    cfg.media_concurrency =
        env_or_usize("CHAT_ARCHIVE_MEDIA_CONCURRENCY", cfg.media_concurrency);
    cfg.timezone = env_or_string("CHAT_ARCHIVE_TIMEZONE", &cfg.timezone);
    cfg.bridge.url = env_or_string("CHAT_ARCHIVE_BRIDGE_URL", &cfg.bridge.url);
    if let Some(command) = env_optional_string("CHAT_ARCHIVE_BRIDGE_COMMAND") {
        cfg.bridge.command = Some(command);
    }
    cfg.retry.max_attempts = env_or_u64(
        "CHAT_ARCHIVE_RETRY_MAX_ATTEMPTS",
        u64::from(cfg.retry.max_attempts),
    )
    .min(u64::from(u32::MAX)) as u32;
    cfg.retry.base_delay_ms =
        env_or_u64("CHAT_ARCHIVE_RETRY_BASE_DELAY_MS", cfg.retry.base_delay_ms);
    cfg.retry.max_delay_ms = env_or_u64("CHAT_ARCHIVE_RETRY_MAX_DELAY_MS", cfg.retry.max_delay_ms);
    Ok(())
}

pub fn load_config() -> Result<ArchiveConfig> {
    let mut cfg = load_file_config()?;
    apply_env_overrides(&mut cfg)?;
    validate(&cfg)?;
    Ok(cfg)
}
