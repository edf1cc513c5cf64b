//! In-process message source and fixtures for engine tests.

use crate::archive::paths::ArchivePaths;
use crate::archive::pipeline::{ArchivePipeline, PipelineSettings};
use crate::archive::record::{ChatIdentity, MessageRecord, RawMessage, render_time};
use crate::error::{ArchiveError, SourceError};
use crate::source::retry::RetryPolicy;
use crate::source::{HistoryPage, HistoryRequest, MediaBlob, MessageSource, SourceEvent};
use async_trait::async_trait;
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub fn message(id: &str, chat_id: &str, timestamp: i64, has_media: bool) -> MessageRecord {
    MessageRecord {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        sender: chat_id.to_string(),
        timestamp,
        time: render_time(timestamp, Tz::UTC),
        body: format!("body of {id}"),
        has_media,
        from_me: false,
    }
}

pub fn raw(id: &str, chat: &ChatIdentity, timestamp: i64, has_media: bool) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        chat: Some(chat.clone()),
        from: chat.id.clone(),
        timestamp,
        body: Some(format!("body of {id}")),
        has_media,
        ..RawMessage::default()
    }
}

pub fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}

pub fn pipeline_for(
    root: &Path,
    source: Arc<dyn MessageSource>,
    save_groups: bool,
    save_media: bool,
) -> (Arc<ArchivePipeline>, mpsc::UnboundedReceiver<ArchiveError>) {
    let settings = PipelineSettings {
        save_groups,
        save_media,
        media_timeout: Duration::from_secs(5),
        media_concurrency: 2,
        retry: quick_retry(),
    };
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    let pipeline = ArchivePipeline::new(ArchivePaths::new(root), source, settings, fatal_tx)
        .expect("pipeline");
    (Arc::new(pipeline), fatal_rx)
}

/// Scripted source. History is held newest-first and paged by offset tokens.
#[derive(Default)]
pub struct ScriptedSource {
    chats: Vec<ChatIdentity>,
    history: HashMap<String, Vec<RawMessage>>,
    failing: HashSet<String>,
    media: HashMap<String, MediaBlob>,
    events: Mutex<Vec<SourceEvent>>,
    keep_open: bool,
    media_delay: Option<Duration>,
    live: Mutex<Option<mpsc::Sender<SourceEvent>>>,
    first_fetches: Mutex<Vec<(String, Instant)>>,
    page_calls: AtomicUsize,
    media_calls: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// `history` is given oldest-first, the way a reader would write it.
    pub fn with_chat(mut self, chat: ChatIdentity, mut history: Vec<RawMessage>) -> Self {
        history.reverse();
        self.history.insert(chat.id.clone(), history);
        self.chats.push(chat);
        self
    }

    pub fn failing(mut self, chat: ChatIdentity) -> Self {
        self.failing.insert(chat.id.clone());
        self.chats.push(chat);
        self
    }

    pub fn with_media(mut self, message_id: &str, mime_type: &str, bytes: &[u8]) -> Self {
        self.media.insert(
            message_id.to_string(),
            MediaBlob {
                mime_type: mime_type.to_string(),
                bytes: bytes.to_vec(),
            },
        );
        self
    }

    pub fn with_events(self, events: Vec<SourceEvent>) -> Self {
        *self.events.lock().expect("events") = events;
        self
    }

    /// Every download sleeps for `delay` before answering.
    pub fn with_slow_media(mut self, delay: Duration) -> Self {
        self.media_delay = Some(delay);
        self
    }

    /// Keep the event stream open after the scripted events are delivered.
    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }

    pub async fn push(&self, event: SourceEvent) {
        let sender = self.live.lock().expect("live").clone();
        if let Some(sender) = sender {
            sender.send(event).await.expect("push event");
        }
    }

    pub fn first_fetches(&self) -> Vec<(String, Instant)> {
        self.first_fetches.lock().expect("fetches").clone()
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn media_calls(&self) -> usize {
        self.media_calls.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn initialize(&self) -> Result<mpsc::Receiver<SourceEvent>, SourceError> {
        let (tx, rx) = mpsc::channel(64);
        for event in self.events.lock().expect("events").drain(..) {
            tx.try_send(event).expect("scripted event fits");
        }
        if self.keep_open {
            *self.live.lock().expect("live") = Some(tx);
        }
        Ok(rx)
    }

    async fn list_chats(&self) -> Result<Vec<ChatIdentity>, SourceError> {
        Ok(self.chats.clone())
    }

    async fn fetch_history(
        &self,
        chat_id: &str,
        request: &HistoryRequest,
    ) -> Result<HistoryPage, SourceError> {
        if request.page_token.is_none() {
            self.first_fetches
                .lock()
                .expect("fetches")
                .push((chat_id.to_string(), Instant::now()));
        }
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(chat_id) {
            return Err(SourceError::Protocol(format!("history for {chat_id} rejected")));
        }
        let all = self.history.get(chat_id).cloned().unwrap_or_default();
        let offset = request
            .page_token
            .as_deref()
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(0);
        let end = (offset + request.limit.max(1)).min(all.len());
        let messages = all.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let has_more = end < all.len();
        Ok(HistoryPage {
            messages,
            has_more,
            next_token: has_more.then(|| end.to_string()),
        })
    }

    async fn download_media(&self, message_id: &str) -> Result<MediaBlob, SourceError> {
        self.media_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.media_delay {
            tokio::time::sleep(delay).await;
        }
        self.media
            .get(message_id)
            .cloned()
            .ok_or_else(|| SourceError::NotAvailable(format!("{message_id} expired")))
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.live.lock().expect("live").take();
    }
}
