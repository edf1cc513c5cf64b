//! HTTP client for a browser-automation bridge process.
//!
//! The bridge owns the web session and exposes a small JSON API; this adapter
//! maps it onto `MessageSource`. Live events arrive through a long-poll loop
//! that forwards them into a bounded channel.

use crate::archive::config::BridgeConfig;
use crate::archive::record::{ChatIdentity, RawMessage};
use crate::error::SourceError;
use crate::source::retry::RetryPolicy;
use crate::source::{HistoryPage, HistoryRequest, MediaBlob, MessageSource, SourceEvent};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, watch};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const LONG_POLL_WAIT_SECS: u64 = 25;
const DEFAULT_MIME: &str = "application/octet-stream";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Qr {
        #[serde(default)]
        payload: String,
    },
    Ready,
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    Message {
        message: RawMessage,
    },
}

impl From<WireEvent> for SourceEvent {
    fn from(event: WireEvent) -> Self {
        match event {
            WireEvent::Qr { payload } => SourceEvent::AuthenticationChallenge(payload),
            WireEvent::Ready => SourceEvent::Ready,
            WireEvent::Disconnected { reason } => SourceEvent::Disconnected(reason),
            WireEvent::Message { message } => SourceEvent::Message(message),
        }
    }
}

/// Decode a batch of wire events, dropping (and logging) entries that do not parse.
fn decode_events(values: Vec<Value>) -> Vec<SourceEvent> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<WireEvent>(value) {
            Ok(event) => Some(event.into()),
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed bridge event");
                None
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct WirePage {
    #[serde(default)]
    messages: Vec<Value>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_token: Option<String>,
}

fn decode_page(page: WirePage) -> HistoryPage {
    let messages = page
        .messages
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<RawMessage>(value) {
            Ok(message) => Some(message),
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed history entry");
                None
            }
        })
        .collect();
    HistoryPage {
        messages,
        has_more: page.has_more,
        next_token: page.next_token,
    }
}

fn classify_status(status: StatusCode, context: &str) -> SourceError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        SourceError::Transient(format!("{context}: http {status}"))
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        SourceError::NotAvailable(format!("{context}: http {status}"))
    } else {
        SourceError::Protocol(format!("{context}: http {status}"))
    }
}

fn classify_reqwest(err: reqwest::Error, context: &str) -> SourceError {
    if err.is_decode() {
        SourceError::Protocol(format!("{context}: {err}"))
    } else {
        SourceError::Transient(format!("{context}: {err}"))
    }
}

pub struct BridgeSource {
    client: Client,
    base: Url,
    headless: bool,
    command: Option<String>,
    retry: RetryPolicy,
    child: Mutex<Option<Child>>,
    stop: watch::Sender<bool>,
}

impl BridgeSource {
    pub fn new(cfg: &BridgeConfig, headless: bool, retry: RetryPolicy) -> anyhow::Result<Self> {
        let base = Url::parse(cfg.url.trim())
            .map_err(|err| anyhow::anyhow!("invalid bridge url `{}`: {err}", cfg.url))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let (stop, _) = watch::channel(false);
        Ok(Self {
            client,
            base,
            headless,
            command: cfg.command.clone(),
            retry,
            child: Mutex::new(None),
            stop,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Protocol(format!("bridge url {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn spawn_bridge(&self) -> Result<(), SourceError> {
        let Some(command) = self.command.as_deref() else {
            return Ok(());
        };
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let program = which::which(command)
            .map_err(|err| SourceError::Protocol(format!("bridge command `{command}`: {err}")))?;
        let port = self.base.port_or_known_default().unwrap_or(80);
        let child = Command::new(&program)
            .env("BRIDGE_HEADLESS", if self.headless { "1" } else { "0" })
            .env("BRIDGE_PORT", port.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                SourceError::Protocol(format!("failed to spawn {}: {err}", program.display()))
            })?;
        tracing::info!(program = %program.display(), pid = ?child.id(), "spawned bridge process");
        *guard = Some(child);
        Ok(())
    }

    async fn poll_events(client: &Client, url: &Url) -> Result<Vec<SourceEvent>, SourceError> {
        let response = client
            .get(url.clone())
            .query(&[("wait", LONG_POLL_WAIT_SECS)])
            .timeout(Duration::from_secs(LONG_POLL_WAIT_SECS + 10))
            .send()
            .await
            .map_err(|err| classify_reqwest(err, "poll events"))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "poll events"));
        }
        let values: Vec<Value> = response
            .json()
            .await
            .map_err(|err| classify_reqwest(err, "poll events"))?;
        Ok(decode_events(values))
    }

    async fn pump(
        client: Client,
        url: Url,
        retry: RetryPolicy,
        tx: mpsc::Sender<SourceEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut failures = 0u32;
        loop {
            let polled = tokio::select! {
                _ = stop.changed() => return,
                polled = Self::poll_events(&client, &url) => polled,
            };
            match polled {
                Ok(events) => {
                    failures = 0;
                    for event in events {
                        let disconnected = matches!(event, SourceEvent::Disconnected(_));
                        if tx.send(event).await.is_err() || disconnected {
                            return;
                        }
                    }
                }
                Err(err) if err.is_retryable() && failures + 1 < retry.max_attempts => {
                    failures += 1;
                    let delay = retry.delay_for(failures);
                    tracing::warn!(error = %err, attempt = failures, "event poll failed; backing off");
                    tokio::select! {
                        _ = stop.changed() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    let lost = SourceEvent::Disconnected(format!("bridge unreachable: {err}"));
                    if tx.send(lost).await.is_err() {
                        tracing::debug!(error = %err, "event receiver gone before disconnect was delivered");
                    }
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl MessageSource for BridgeSource {
    async fn initialize(&self) -> Result<mpsc::Receiver<SourceEvent>, SourceError> {
        self.spawn_bridge().await?;

        let url = self.endpoint(&["initialize"])?;
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({ "headless": self.headless }))
            .send()
            .await
            .map_err(|err| classify_reqwest(err, "initialize"))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "initialize"));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let events_url = self.endpoint(&["events"])?;
        tokio::spawn(Self::pump(
            self.client.clone(),
            events_url,
            self.retry,
            tx,
            self.stop.subscribe(),
        ));
        Ok(rx)
    }

    async fn list_chats(&self) -> Result<Vec<ChatIdentity>, SourceError> {
        let response = self
            .client
            .get(self.endpoint(&["chats"])?)
            .send()
            .await
            .map_err(|err| classify_reqwest(err, "list chats"))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "list chats"));
        }
        let values: Vec<Value> = response
            .json()
            .await
            .map_err(|err| classify_reqwest(err, "list chats"))?;
        Ok(values
            .into_iter()
            .filter_map(|value| serde_json::from_value::<ChatIdentity>(value).ok())
            .filter(|chat| !chat.id.trim().is_empty())
            .collect())
    }

    async fn fetch_history(
        &self,
        chat_id: &str,
        request: &HistoryRequest,
    ) -> Result<HistoryPage, SourceError> {
        let mut query = vec![("limit", request.limit.to_string())];
        if let Some(token) = &request.page_token {
            query.push(("before", token.clone()));
        }
        let response = self
            .client
            .get(self.endpoint(&["chats", chat_id, "messages"])?)
            .query(&query)
            .send()
            .await
            .map_err(|err| classify_reqwest(err, "fetch history"))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "fetch history"));
        }
        let page: WirePage = response
            .json()
            .await
            .map_err(|err| classify_reqwest(err, "fetch history"))?;
        Ok(decode_page(page))
    }

    async fn download_media(&self, message_id: &str) -> Result<MediaBlob, SourceError> {
        let response = self
            .client
            .get(self.endpoint(&["media", message_id])?)
            .send()
            .await
            .map_err(|err| classify_reqwest(err, "download media"))?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), "download media"));
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_MIME)
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| classify_reqwest(err, "download media"))?;
        Ok(MediaBlob {
            mime_type,
            bytes: bytes.to_vec(),
        })
    }

    async fn shutdown(&self) {
        if self.stop.send(true).is_err() {
            tracing::debug!("event pump already stopped");
        }
        if let Ok(url) = self.endpoint(&["shutdown"]) {
            if let Err(err) = self
                .client
                .post(url)
                .timeout(Duration::from_secs(5))
                .send()
                .await
            {
                tracing::debug!(error = %err, "bridge shutdown request failed");
            }
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                tracing::warn!(error = %err, "failed to stop bridge process");
            }
        }
    }
}
