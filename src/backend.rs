use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A message as delivered by the chat network, flattened to the fields the
/// bridge cares about.
#[derive(Debug, Clone, Default)]
pub struct GatewayMessage {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub author_is_bot: bool,
    pub via_webhook: bool,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub attachments: Vec<GatewayAttachment>,
    pub embeds: Vec<GatewayEmbed>,
    /// The replied-to message, already resolved by the gateway adapter. Left
    /// empty when the reference could not be fetched.
    pub referenced: Option<Box<GatewayMessage>>,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayAttachment {
    pub url: String,
    pub filename: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayEmbed {
    pub image_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

/// Capability surface of the chat network the bridge talks to. Any gateway
/// style chat API with these primitives fits; production uses Discord.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Most recent messages of the bridged channel, newest first.
    async fn recent_messages(&self, limit: u8) -> anyhow::Result<Vec<GatewayMessage>>;

    /// Fetch a single message of the bridged channel by id.
    async fn fetch_message(&self, id: &str) -> anyhow::Result<GatewayMessage>;

    /// Deliver `text` to the bridged channel, optionally as a native reply.
    async fn send_message(&self, text: &str, reply_to_id: Option<&str>) -> anyhow::Result<()>;

    /// One-shot typing indicator on the bridged channel.
    async fn send_typing(&self) -> anyhow::Result<()>;

    /// Ensure the destination channel is reachable.
    async fn resolve_destination(&self) -> anyhow::Result<()>;

    /// Advertise the bridge as online or idle on the chat network.
    async fn set_online(&self, online: bool) -> anyhow::Result<()>;
}
