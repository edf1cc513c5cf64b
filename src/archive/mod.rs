pub mod audit;
pub mod backfill;
pub mod chat_keys;
pub mod config;
pub mod cursor;
pub mod dedup;
pub mod engine;
pub mod intake;
pub mod lock;
pub mod log;
pub mod media;
pub mod paths;
pub mod pipeline;
pub mod record;
pub mod util;

#[cfg(test)]
pub mod testing;
