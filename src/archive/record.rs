use chrono::DateTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable conversation identity. `name` is mutable and only feeds folder naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatIdentity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_group: bool,
}

impl ChatIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, is_group: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_group,
        }
    }
}

/// One persisted log line. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub chat_id: String,
    pub sender: String,
    pub timestamp: i64,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "media")]
    pub has_media: bool,
    #[serde(default)]
    pub from_me: bool,
}

/// Message as delivered by the source, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub chat: Option<ChatIdentity>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default)]
    pub from_me: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message id missing")]
    MissingId,
    #[error("chat id missing")]
    MissingChat,
    #[error("timestamp {0} is not a valid unix time")]
    BadTimestamp(i64),
}

pub fn render_time(timestamp: i64, tz: Tz) -> String {
    match DateTime::from_timestamp(timestamp, 0) {
        Some(utc) => utc.with_timezone(&tz).format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::new(),
    }
}

impl RawMessage {
    pub fn chat_id(&self) -> Option<&str> {
        let non_blank = |id: &&str| !id.trim().is_empty();
        self.chat
            .as_ref()
            .map(|c| c.id.as_str())
            .filter(non_blank)
            .or_else(|| self.chat_id.as_deref().filter(non_blank))
    }

    /// Chat identity carried by the event; falls back to a bare id with no name.
    pub fn chat_identity(&self) -> Option<ChatIdentity> {
        if let Some(chat) = &self.chat {
            if !chat.id.trim().is_empty() {
                return Some(chat.clone());
            }
        }
        self.chat_id()
            .map(|id| ChatIdentity::new(id, "", id.ends_with("@g.us")))
    }

    /// Validate and normalize into a log record. `chat_id` overrides the event's
    /// own chat for history pages, where the chat is known from the request.
    pub fn into_record(self, chat_id: Option<&str>, tz: Tz) -> Result<MessageRecord, DecodeError> {
        if self.id.trim().is_empty() {
            return Err(DecodeError::MissingId);
        }
        let chat_id = match chat_id {
            Some(id) => id.to_string(),
            None => self
                .chat_id()
                .map(ToOwned::to_owned)
                .ok_or(DecodeError::MissingChat)?,
        };
        if self.timestamp <= 0 || DateTime::from_timestamp(self.timestamp, 0).is_none() {
            return Err(DecodeError::BadTimestamp(self.timestamp));
        }
        let sender = self
            .author
            .filter(|a| !a.trim().is_empty())
            .unwrap_or(self.from);
        Ok(MessageRecord {
            time: render_time(self.timestamp, tz),
            id: self.id,
            chat_id,
            sender,
            timestamp: self.timestamp,
            body: self.body.unwrap_or_default(),
            has_media: self.has_media,
            from_me: self.from_me,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str) -> RawMessage {
        RawMessage {
            id: id.to_string(),
            chat: Some(ChatIdentity::new("alice@c.us", "Alice", false)),
            from: "alice@c.us".to_string(),
            timestamp: 1_700_000_000,
            body: Some("hi".to_string()),
            ..RawMessage::default()
        }
    }

    #[test]
    fn record_serializes_media_flag_under_short_name() {
        let record = raw("m1").into_record(None, Tz::UTC).expect("record");
        let line = serde_json::to_string(&record).expect("json");
        assert!(line.contains("\"id\":\"m1\""));
        assert!(line.contains("\"body\":\"hi\""));
        assert!(line.contains("\"media\":false"));
        assert!(line.contains("\"time\":\"2023-11-14 22:13:20\""));
    }

    #[test]
    fn group_author_wins_over_origin() {
        let mut msg = raw("m2");
        msg.from = "team@g.us".to_string();
        msg.author = Some("bob@c.us".to_string());
        let record = msg.into_record(None, Tz::UTC).expect("record");
        assert_eq!(record.sender, "bob@c.us");
    }

    #[test]
    fn time_respects_configured_zone() {
        let record = raw("m3")
            .into_record(None, chrono_tz::Asia::Kolkata)
            .expect("record");
        assert_eq!(record.time, "2023-11-15 03:43:20");
    }

    #[test]
    fn invalid_messages_are_rejected() {
        assert_eq!(
            raw("").into_record(None, Tz::UTC),
            Err(DecodeError::MissingId)
        );
        let mut no_chat = raw("m4");
        no_chat.chat = None;
        assert_eq!(
            no_chat.into_record(None, Tz::UTC),
            Err(DecodeError::MissingChat)
        );
        let mut bad_ts = raw("m5");
        bad_ts.timestamp = 0;
        assert_eq!(
            bad_ts.into_record(None, Tz::UTC),
            Err(DecodeError::BadTimestamp(0))
        );
        assert_eq!(
            DecodeError::BadTimestamp(-5).to_string(),
            "timestamp -5 is not a valid unix time"
        );
        let boxed: Box<dyn std::error::Error> = Box::new(DecodeError::MissingId);
        assert_eq!(boxed.to_string(), "message id missing");
    }

    #[test]
    fn explicit_chat_id_overrides_event_chat() {
        let mut msg = raw("m6");
        msg.chat = None;
        let record = msg
            .into_record(Some("bob@c.us"), Tz::UTC)
            .expect("record");
        assert_eq!(record.chat_id, "bob@c.us");
        assert_eq!(record.body, "hi");
    }

    #[test]
    fn bare_chat_id_infers_group_suffix() {
        let msg = RawMessage {
            chat_id: Some("team@g.us".to_string()),
            ..RawMessage::default()
        };
        let chat = msg.chat_identity().expect("chat");
        assert!(chat.is_group);
        assert!(chat.name.is_empty());
    }
}
