//! Boundary to the external messaging client. The archiver only consumes this
//! capability; session handling and browser automation live on the other side.

pub mod bridge;
pub mod retry;

use crate::archive::record::{ChatIdentity, RawMessage};
use crate::error::SourceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// Login code for the operator to scan; presentation is the source's concern.
    AuthenticationChallenge(String),
    Ready,
    Disconnected(String),
    Message(RawMessage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryRequest {
    pub limit: usize,
    /// Opaque continuation from the previous page; `None` asks for the first page.
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub messages: Vec<RawMessage>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBlob {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Start the client and return its event stream. The stream ends when the
    /// source shuts down; a `Disconnected` event precedes it when the session drops.
    async fn initialize(&self) -> Result<mpsc::Receiver<SourceEvent>, SourceError>;

    async fn list_chats(&self) -> Result<Vec<ChatIdentity>, SourceError>;

    async fn fetch_history(
        &self,
        chat_id: &str,
        request: &HistoryRequest,
    ) -> Result<HistoryPage, SourceError>;

    /// `SourceError::NotAvailable` when the attachment has expired or was never downloadable.
    async fn download_media(&self, message_id: &str) -> Result<MediaBlob, SourceError>;

    async fn shutdown(&self) {}
}
