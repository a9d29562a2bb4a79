use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a mirrored message originated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    Discord,
    Webhook,
    Bot,
    Web,
}

impl MessageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageSource::Discord => "discord",
            MessageSource::Webhook => "webhook",
            MessageSource::Bot => "bot",
            MessageSource::Web => "web",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
}

/// One piece of media attached to or linked from a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub filename: String,
}

/// The message a record replies to, trimmed to what the web client renders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyRef {
    pub id: String,
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Unified message record served to the web client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub author: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub source: MessageSource,
    pub is_bot: bool,
    pub media: Vec<MediaRef>,
    pub reply_to: Option<ReplyRef>,
}
