use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use async_trait::async_trait;
use serenity::{
    all::{ChannelId, GatewayIntents, MessageId, OnlineStatus, UserId},
    builder::{CreateMessage, GetMessages},
    client::{Client, Context, EventHandler},
    gateway::ShardMessenger,
    http::Http,
    model::{channel::Message, gateway::Ready},
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    backend::{ChatBackend, GatewayAttachment, GatewayEmbed, GatewayMessage},
    bridge::MessageBridge,
    reconnect::Backoff,
};

/// A gateway run shorter than this counts as unhealthy and keeps climbing the
/// backoff ladder.
const HEALTHY_RUN: Duration = Duration::from_secs(60);

/// Serenity-backed implementation of the chat capability.
///
/// The HTTP and shard handles only exist once the gateway has connected; they
/// are attached from `ready` (again after every reconnect) and calls made
/// before that fail with a backend error.
pub struct DiscordBackend {
    channel_id: u64,
    http: RwLock<Option<Arc<Http>>>,
    shard: RwLock<Option<ShardMessenger>>,
    resolved: RwLock<Option<ChannelId>>,
}

impl DiscordBackend {
    pub fn new(channel_id: u64) -> Self {
        Self {
            channel_id,
            http: RwLock::new(None),
            shard: RwLock::new(None),
            resolved: RwLock::new(None),
        }
    }

    async fn attach(&self, http: Arc<Http>, shard: ShardMessenger) {
        *self.http.write().await = Some(http);
        *self.shard.write().await = Some(shard);
    }

    async fn http(&self) -> anyhow::Result<Arc<Http>> {
        self.http
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("gateway not connected"))
    }

    /// The configured id names either a channel or, for the DM case, a user
    /// whose direct-message channel is opened on demand.
    async fn destination(&self) -> anyhow::Result<ChannelId> {
        if let Some(channel) = *self.resolved.read().await {
            return Ok(channel);
        }

        let http = self.http().await?;
        let channel = match http.get_channel(ChannelId::new(self.channel_id)).await {
            Ok(channel) => channel.id(),
            Err(error) => {
                debug!(?error, "channel lookup failed, trying user DM fallback");
                let user = http
                    .get_user(UserId::new(self.channel_id))
                    .await
                    .context("configured id is neither a channel nor a user")?;
                user.create_dm_channel(&http).await?.id
            }
        };

        *self.resolved.write().await = Some(channel);
        Ok(channel)
    }

    /// Whether a gateway message belongs to the bridged channel.
    async fn is_bridged(&self, channel: ChannelId) -> bool {
        *self.resolved.read().await == Some(channel) || channel.get() == self.channel_id
    }

    /// Flatten a serenity message into the capability shape, resolving the
    /// replied-to message by id when the gateway did not inline it. Resolution
    /// failures are non-fatal and leave the reference empty.
    async fn convert_message(&self, msg: &Message) -> GatewayMessage {
        let mut converted = flatten_message(msg);

        if let Some(referenced) = &msg.referenced_message {
            converted.referenced = Some(Box::new(flatten_message(referenced)));
        } else if let Some(reference) = &msg.message_reference {
            if let Some(message_id) = reference.message_id {
                match self.fetch_referenced(msg.channel_id, message_id).await {
                    Ok(referenced) => converted.referenced = Some(Box::new(referenced)),
                    Err(error) => {
                        debug!(?error, message_id = %message_id, "referenced message not resolvable");
                    }
                }
            }
        }

        converted
    }

    async fn fetch_referenced(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> anyhow::Result<GatewayMessage> {
        let http = self.http().await?;
        let fetched = channel.message(&http, message).await?;
        Ok(flatten_message(&fetched))
    }
}

#[async_trait]
impl ChatBackend for DiscordBackend {
    async fn recent_messages(&self, limit: u8) -> anyhow::Result<Vec<GatewayMessage>> {
        let http = self.http().await?;
        let channel = self.destination().await?;
        let fetched = channel
            .messages(&http, GetMessages::new().limit(limit))
            .await?;

        let mut messages = Vec::with_capacity(fetched.len());
        for msg in &fetched {
            messages.push(self.convert_message(msg).await);
        }
        Ok(messages)
    }

    async fn fetch_message(&self, id: &str) -> anyhow::Result<GatewayMessage> {
        let http = self.http().await?;
        let channel = self.destination().await?;
        let message_id = MessageId::new(id.parse().context("malformed message id")?);
        let fetched = channel.message(&http, message_id).await?;
        Ok(flatten_message(&fetched))
    }

    async fn send_message(&self, text: &str, reply_to_id: Option<&str>) -> anyhow::Result<()> {
        let http = self.http().await?;
        let channel = self.destination().await?;

        let mut builder = CreateMessage::new().content(text);
        if let Some(id) = reply_to_id {
            let message_id = MessageId::new(id.parse().context("malformed message id")?);
            builder = builder.reference_message((channel, message_id));
        }

        channel.send_message(&http, builder).await?;
        Ok(())
    }

    async fn send_typing(&self) -> anyhow::Result<()> {
        let http = self.http().await?;
        let channel = self.destination().await?;
        channel.broadcast_typing(&http).await?;
        Ok(())
    }

    async fn resolve_destination(&self) -> anyhow::Result<()> {
        self.destination().await.map(|_| ())
    }

    async fn set_online(&self, online: bool) -> anyhow::Result<()> {
        let shard = self.shard.read().await;
        let shard = shard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("gateway not connected"))?;

        let status = if online {
            OnlineStatus::Online
        } else {
            OnlineStatus::DoNotDisturb
        };
        shard.set_presence(None, status);
        Ok(())
    }
}

/// Field-for-field flattening, without following reply references.
fn flatten_message(msg: &Message) -> GatewayMessage {
    GatewayMessage {
        id: msg.id.to_string(),
        author_id: msg.author.id.to_string(),
        author_name: msg.author.name.clone(),
        author_is_bot: msg.author.bot,
        via_webhook: msg.webhook_id.is_some(),
        content: msg.content.clone(),
        timestamp: *msg.timestamp,
        attachments: msg
            .attachments
            .iter()
            .map(|attachment| GatewayAttachment {
                url: attachment.url.clone(),
                filename: attachment.filename.clone(),
                content_type: attachment.content_type.clone(),
            })
            .collect(),
        embeds: msg
            .embeds
            .iter()
            .map(|embed| GatewayEmbed {
                image_url: embed.image.as_ref().map(|image| image.url.clone()),
                thumbnail_url: embed.thumbnail.as_ref().map(|thumbnail| thumbnail.url.clone()),
            })
            .collect(),
        referenced: None,
    }
}

struct Handler {
    bridge: Arc<MessageBridge>,
    backend: Arc<DiscordBackend>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("connected to Discord as {}", ready.user.name);

        self.backend.attach(ctx.http.clone(), ctx.shard.clone()).await;
        self.bridge.set_identity(ready.user.id.to_string());

        // Start idle; the presence poller flips us online on web activity.
        ctx.set_presence(None, OnlineStatus::DoNotDisturb);

        self.bridge.load_history().await;
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        // Our own outbound messages were already mirrored at submit time.
        if self.bridge.is_own_author(&msg.author.id.to_string()) {
            return;
        }

        if !self.backend.is_bridged(msg.channel_id).await {
            return;
        }

        let raw = self.backend.convert_message(&msg).await;
        self.bridge.handle_gateway_message(raw).await;
    }
}

/// Drive the gateway client, reconnecting with exponential backoff whenever
/// it exits. Never returns under normal operation.
pub async fn run(token: String, bridge: Arc<MessageBridge>, backend: Arc<DiscordBackend>) {
    let intents = GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut backoff = Backoff::default();

    loop {
        let handler = Handler {
            bridge: Arc::clone(&bridge),
            backend: Arc::clone(&backend),
        };

        let started = Instant::now();
        let result = async {
            let mut client = Client::builder(&token, intents)
                .event_handler(handler)
                .await?;
            client.start().await
        }
        .await;

        match result {
            Ok(()) => warn!("gateway client exited"),
            Err(error) => warn!(?error, "gateway client failed"),
        }

        if started.elapsed() > HEALTHY_RUN {
            backoff.reset();
        }

        let delay = backoff.next_delay();
        info!(?delay, "reconnecting to Discord");
        tokio::time::sleep(delay).await;
    }
}
