use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
    time::Duration,
};

use chrono::{Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    backend::{ChatBackend, GatewayMessage},
    error::BridgeError,
    types::{MediaKind, MediaRef, MessageRecord, MessageSource, ReplyRef},
};

/// Upper bound on the in-memory message mirror.
pub const MAX_MESSAGES: usize = 100;
/// How long a typing entry stays active without a refresh.
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(5);
/// Slack subtracted when an expiry timer checks whether its entry was
/// refreshed after it was scheduled.
const TYPING_EXPIRY_TOLERANCE: Duration = Duration::from_millis(100);
/// Web-client inactivity after which the bridge goes idle on the chat network.
pub const PRESENCE_TIMEOUT: Duration = Duration::from_secs(15);
/// Cadence of the presence poller.
pub const PRESENCE_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// History seeding window.
pub const HISTORY_DAYS: i64 = 7;
/// Most bot records a single purge call removes.
const PURGE_LIMIT: usize = 100;
/// Longest reply excerpt embedded in the quoted-text fallback.
const REPLY_QUOTE_LIMIT: usize = 100;

/// Reply target as submitted by the web client.
#[derive(Debug, Clone, Deserialize)]
pub struct WebReply {
    pub id: Option<String>,
    pub author: String,
    pub content: String,
}

/// What a polling web client receives.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub messages: Vec<MessageRecord>,
    pub typing: Vec<String>,
}

/// Bridges one Discord channel to the password-gated web chat: owns the
/// bounded message mirror and the typing table, normalizes traffic in both
/// directions and derives the advertised presence from web-client activity.
pub struct MessageBridge {
    backend: Arc<dyn ChatBackend>,
    password: String,
    history: Arc<RwLock<Vec<MessageRecord>>>,
    typing: Arc<RwLock<HashMap<String, Instant>>>,
    last_api_request: RwLock<Instant>,
    online: RwLock<bool>,
    bot_user_id: OnceLock<String>,
    web_prefix: Regex,
    image_url: Regex,
}

impl MessageBridge {
    pub fn new(backend: Arc<dyn ChatBackend>, password: String) -> Self {
        Self {
            backend,
            password,
            history: Arc::new(RwLock::new(Vec::new())),
            typing: Arc::new(RwLock::new(HashMap::new())),
            last_api_request: RwLock::new(Instant::now()),
            online: RwLock::new(false),
            bot_user_id: OnceLock::new(),
            web_prefix: Regex::new(r"^\*\*(.+?)\*\*: (?s)(.*)$").expect("valid author pattern"),
            image_url: Regex::new(r"(?i)https?://\S+\.(?:jpg|jpeg|png|gif|webp|bmp|svg)")
                .expect("valid image url pattern"),
        }
    }

    /// Record the bot account the gateway authenticated as. Normalization
    /// needs it to spot round-tripped web messages.
    pub fn set_identity(&self, bot_user_id: String) {
        let _ = self.bot_user_id.set(bot_user_id);
    }

    /// Whether `author_id` is the bridge's own bot account.
    pub fn is_own_author(&self, author_id: &str) -> bool {
        self.bot_user_id.get().is_some_and(|id| id == author_id)
    }

    /// Plain equality check backing the password probe endpoint.
    pub fn password_matches(&self, password: &str) -> bool {
        password == self.password
    }

    fn check_password(&self, password: &str) -> Result<(), BridgeError> {
        if self.password_matches(password) {
            Ok(())
        } else {
            Err(BridgeError::Unauthorized)
        }
    }

    /// Turn a gateway message into the unified record served to web clients.
    pub fn normalize(&self, raw: &GatewayMessage) -> MessageRecord {
        let (source, is_bot) = if raw.author_is_bot && raw.via_webhook {
            (MessageSource::Webhook, true)
        } else if raw.author_is_bot {
            (MessageSource::Bot, true)
        } else {
            (MessageSource::Discord, false)
        };

        let mut record = MessageRecord {
            id: raw.id.clone(),
            author: raw.author_name.clone(),
            content: raw.content.clone(),
            timestamp: raw.timestamp,
            source,
            is_bot,
            media: self.extract_media(raw),
            reply_to: raw
                .referenced
                .as_deref()
                .map(|referenced| self.reply_ref(referenced)),
        };

        // A round-tripped web message comes back authored by our own bot
        // account, wrapped as `**name**: text`; restore the original author.
        if self.is_own_author(&raw.author_id) {
            if let Some((author, content)) = self.unwrap_web_author(&raw.content) {
                record.author = author;
                record.content = content;
                record.source = MessageSource::Web;
                record.is_bot = false;
            }
        }

        record
    }

    fn reply_ref(&self, referenced: &GatewayMessage) -> ReplyRef {
        let mut author = referenced.author_name.clone();
        let mut content = referenced.content.clone();
        if self.is_own_author(&referenced.author_id) {
            if let Some((name, text)) = self.unwrap_web_author(&referenced.content) {
                author = name;
                content = text;
            }
        }

        ReplyRef {
            id: referenced.id.clone(),
            author,
            content,
            timestamp: referenced.timestamp,
        }
    }

    fn unwrap_web_author(&self, content: &str) -> Option<(String, String)> {
        let captures = self.web_prefix.captures(content)?;
        Some((captures[1].to_owned(), captures[2].to_owned()))
    }

    /// Collect image references from attachments, embeds and bare URLs in the
    /// body text, in that order. Duplicates are kept.
    fn extract_media(&self, raw: &GatewayMessage) -> Vec<MediaRef> {
        let mut media = Vec::new();

        for attachment in &raw.attachments {
            let is_image = attachment
                .content_type
                .as_deref()
                .is_some_and(|content_type| content_type.starts_with("image/"));
            if is_image {
                media.push(MediaRef {
                    url: attachment.url.clone(),
                    kind: MediaKind::Image,
                    filename: attachment.filename.clone(),
                });
            }
        }

        for embed in &raw.embeds {
            for url in [&embed.image_url, &embed.thumbnail_url].into_iter().flatten() {
                media.push(MediaRef {
                    url: url.clone(),
                    kind: MediaKind::Image,
                    filename: filename_from_url(url),
                });
            }
        }

        for url in self.sniff_image_urls(&raw.content) {
            media.push(MediaRef {
                filename: filename_from_url(&url),
                url,
                kind: MediaKind::Image,
            });
        }

        media
    }

    /// Extension-based image URL sniffing. Anything URL-shaped that ends in a
    /// known image extension counts; extension-less CDN links are missed.
    fn sniff_image_urls(&self, content: &str) -> Vec<String> {
        self.image_url
            .find_iter(content)
            .map(|found| found.as_str().to_owned())
            .collect()
    }

    /// Mirror an inbound gateway message.
    pub async fn handle_gateway_message(&self, raw: GatewayMessage) {
        let record = self.normalize(&raw);
        self.append(record).await;
    }

    /// Push a record, evicting the oldest entries past the cap.
    pub async fn append(&self, record: MessageRecord) {
        let mut history = self.history.write().await;
        history.push(record);
        if history.len() > MAX_MESSAGES {
            let excess = history.len() - MAX_MESSAGES;
            history.drain(..excess);
        }
    }

    /// Replace the mirror with the channel's recent history. A fetch failure
    /// leaves the current mirror untouched.
    pub async fn load_history(&self) {
        let fetched = match self.backend.recent_messages(MAX_MESSAGES as u8).await {
            Ok(messages) => messages,
            Err(error) => {
                warn!(?error, "failed to load channel history");
                return;
            }
        };

        let cutoff = Utc::now() - ChronoDuration::days(HISTORY_DAYS);
        let mut records = fetched
            .iter()
            .filter(|message| message.timestamp > cutoff)
            .map(|message| self.normalize(message))
            .collect::<Vec<_>>();
        records.sort_by_key(|record| record.timestamp);
        if records.len() > MAX_MESSAGES {
            let start = records.len() - MAX_MESSAGES;
            records = records.split_off(start);
        }

        let count = records.len();
        *self.history.write().await = records;
        info!(count, "seeded message history");
    }

    /// Deliver a web-submitted message to the chat network and mirror it.
    pub async fn submit_web_message(
        &self,
        author: &str,
        content: &str,
        password: &str,
        reply_to: Option<&WebReply>,
    ) -> Result<MessageRecord, BridgeError> {
        self.check_password(password)?;
        if content.trim().is_empty() {
            return Err(BridgeError::EmptyMessage);
        }

        self.backend.resolve_destination().await.map_err(|error| {
            warn!(?error, "destination channel could not be resolved");
            BridgeError::ChannelNotFound
        })?;

        if let Err(error) = self.backend.send_typing().await {
            debug!(?error, "typing indicator before send failed");
        }

        let mut outbound = format!("**{author}**: {content}");
        let mut native_reply = None;

        if let Some(reply) = reply_to {
            if let Some(id) = &reply.id {
                match self.backend.fetch_message(id).await {
                    Ok(_) => native_reply = Some(id.as_str()),
                    Err(error) => {
                        warn!(?error, reply_id = %id, "reply target unavailable, quoting inline");
                        outbound = quoted_fallback(author, reply, content);
                    }
                }
            }
        }

        self.backend
            .send_message(&outbound, native_reply)
            .await
            .map_err(BridgeError::Backend)?;

        let now = Utc::now();
        let record = MessageRecord {
            id: format!("web-{}", now.timestamp_millis()),
            author: author.to_owned(),
            content: content.to_owned(),
            timestamp: now,
            source: MessageSource::Web,
            is_bot: false,
            media: self
                .sniff_image_urls(content)
                .into_iter()
                .map(|url| MediaRef {
                    filename: filename_from_url(&url),
                    url,
                    kind: MediaKind::Image,
                })
                .collect(),
            reply_to: reply_to.map(|reply| ReplyRef {
                id: reply.id.clone().unwrap_or_default(),
                author: reply.author.clone(),
                content: reply.content.clone(),
                timestamp: now,
            }),
        };

        self.append(record.clone()).await;
        self.typing.write().await.remove(author);

        Ok(record)
    }

    /// Record or clear a web user's typing state.
    pub async fn set_typing(
        &self,
        username: &str,
        is_typing: bool,
        password: &str,
    ) -> Result<(), BridgeError> {
        self.check_password(password)?;

        if !is_typing {
            self.typing.write().await.remove(username);
            return Ok(());
        }

        self.typing
            .write()
            .await
            .insert(username.to_owned(), Instant::now());

        if let Err(error) = self.backend.send_typing().await {
            debug!(?error, "outbound typing indicator failed");
        }

        // Expiry timer: deletes the entry after the timeout unless it was
        // refreshed in the meantime.
        let typing = Arc::clone(&self.typing);
        let username = username.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(TYPING_TIMEOUT).await;
            let mut table = typing.write().await;
            if let Some(stamp) = table.get(&username) {
                if stamp.elapsed() >= TYPING_TIMEOUT - TYPING_EXPIRY_TOLERANCE {
                    table.remove(&username);
                }
            }
        });

        Ok(())
    }

    /// Current mirror plus active typers. Also feeds the presence heuristic:
    /// every call counts as web-client activity.
    pub async fn snapshot(&self, password: &str) -> Result<Snapshot, BridgeError> {
        self.check_password(password)?;

        *self.last_api_request.write().await = Instant::now();
        self.mark_online().await;

        let typing = self.sweep_typing().await;
        let messages = self.history.read().await.clone();

        Ok(Snapshot { messages, typing })
    }

    /// Drop expired typing entries, returning the active usernames.
    async fn sweep_typing(&self) -> Vec<String> {
        let mut table = self.typing.write().await;
        table.retain(|_, stamp| stamp.elapsed() < TYPING_TIMEOUT);
        let mut active = table.keys().cloned().collect::<Vec<_>>();
        active.sort();
        active
    }

    async fn mark_online(&self) {
        let mut online = self.online.write().await;
        if *online {
            return;
        }
        *online = true;
        drop(online);

        info!("web client active, going online");
        if let Err(error) = self.backend.set_online(true).await {
            warn!(?error, "presence update failed");
        }
    }

    /// One presence poll tick: drop to idle once the web client goes quiet.
    /// Status pushes are intent only; a failed push is logged and local state
    /// keeps the new value.
    pub async fn poll_presence(&self) {
        let last = *self.last_api_request.read().await;
        let mut online = self.online.write().await;
        if *online && last.elapsed() >= PRESENCE_TIMEOUT {
            *online = false;
            drop(online);

            info!("web client idle, going do-not-disturb");
            if let Err(error) = self.backend.set_online(false).await {
                warn!(?error, "presence update failed");
            }
        }
    }

    /// Remove bot-flagged records from the mirror, newest first, capped per
    /// call. Discord-side history is untouched.
    pub async fn purge_bot_messages(&self, password: &str) -> Result<usize, BridgeError> {
        self.check_password(password)?;

        let mut history = self.history.write().await;
        let mut removed = 0;
        for index in (0..history.len()).rev() {
            if removed == PURGE_LIMIT {
                break;
            }
            if history[index].is_bot {
                history.remove(index);
                removed += 1;
            }
        }

        info!(removed, "purged bot messages from mirror");
        Ok(removed)
    }
}

/// Background task flipping the advertised status when the web client goes
/// quiet.
pub fn spawn_presence_poller(bridge: Arc<MessageBridge>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRESENCE_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            bridge.poll_presence().await;
        }
    });
}

/// Inline quote used when the native reply reference cannot be built.
fn quoted_fallback(author: &str, reply: &WebReply, content: &str) -> String {
    let mut quoted = reply
        .content
        .chars()
        .take(REPLY_QUOTE_LIMIT)
        .collect::<String>();
    if reply.content.chars().count() > REPLY_QUOTE_LIMIT {
        quoted.push_str("...");
    }

    format!(
        "**{author}** replying to **{reply_author}**: \"{quoted}\"\n{content}",
        reply_author = reply.author,
    )
}

fn filename_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path).to_owned()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};

    use crate::backend::{GatewayAttachment, GatewayEmbed};

    use super::*;

    #[derive(Default)]
    struct MockBackend {
        recent: Mutex<Vec<GatewayMessage>>,
        recent_fails: bool,
        fetch_fails: bool,
        resolve_fails: bool,
        sent: Mutex<Vec<(String, Option<String>)>>,
        typing_calls: AtomicUsize,
        presence: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl ChatBackend for MockBackend {
        async fn recent_messages(&self, limit: u8) -> anyhow::Result<Vec<GatewayMessage>> {
            if self.recent_fails {
                anyhow::bail!("gateway unavailable");
            }
            let mut messages = self.recent.lock().unwrap().clone();
            messages.truncate(limit as usize);
            Ok(messages)
        }

        async fn fetch_message(&self, id: &str) -> anyhow::Result<GatewayMessage> {
            if self.fetch_fails {
                anyhow::bail!("unknown message");
            }
            Ok(GatewayMessage {
                id: id.to_owned(),
                ..GatewayMessage::default()
            })
        }

        async fn send_message(&self, text: &str, reply_to_id: Option<&str>) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((text.to_owned(), reply_to_id.map(str::to_owned)));
            Ok(())
        }

        async fn send_typing(&self) -> anyhow::Result<()> {
            self.typing_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn resolve_destination(&self) -> anyhow::Result<()> {
            if self.resolve_fails {
                anyhow::bail!("no such channel or user");
            }
            Ok(())
        }

        async fn set_online(&self, online: bool) -> anyhow::Result<()> {
            self.presence.lock().unwrap().push(online);
            Ok(())
        }
    }

    const PASSWORD: &str = "hunter2";

    fn bridge_with(backend: MockBackend) -> (Arc<MockBackend>, MessageBridge) {
        let backend = Arc::new(backend);
        let bridge = MessageBridge::new(backend.clone(), PASSWORD.to_owned());
        (backend, bridge)
    }

    fn discord_message(id: usize, is_bot: bool) -> GatewayMessage {
        GatewayMessage {
            id: id.to_string(),
            author_id: format!("user-{id}"),
            author_name: "someone".to_owned(),
            author_is_bot: is_bot,
            content: format!("message {id}"),
            timestamp: Utc::now(),
            ..GatewayMessage::default()
        }
    }

    #[tokio::test]
    async fn history_keeps_only_the_most_recent_records() {
        let (_, bridge) = bridge_with(MockBackend::default());

        for id in 0..150 {
            bridge.handle_gateway_message(discord_message(id, false)).await;
        }

        let history = bridge.history.read().await;
        assert_eq!(history.len(), MAX_MESSAGES);
        assert_eq!(history.first().map(|record| record.id.as_str()), Some("50"));
        assert_eq!(history.last().map(|record| record.id.as_str()), Some("149"));
        for (offset, record) in history.iter().enumerate() {
            assert_eq!(record.id, (50 + offset).to_string());
        }
    }

    #[tokio::test]
    async fn web_message_round_trips_through_normalization() {
        let (backend, bridge) = bridge_with(MockBackend::default());
        bridge.set_identity("bot-1".to_owned());

        bridge
            .submit_web_message("alice", "hello", PASSWORD, None)
            .await
            .expect("send should succeed");

        let (outbound, reply) = backend.sent.lock().unwrap()[0].clone();
        assert_eq!(outbound, "**alice**: hello");
        assert_eq!(reply, None);

        // As if re-fetched from Discord later, authored by the bot account.
        let echoed = GatewayMessage {
            id: "900".to_owned(),
            author_id: "bot-1".to_owned(),
            author_name: "bridge-bot".to_owned(),
            author_is_bot: true,
            content: outbound,
            timestamp: Utc::now(),
            ..GatewayMessage::default()
        };
        let record = bridge.normalize(&echoed);

        assert_eq!(record.author, "alice");
        assert_eq!(record.content, "hello");
        assert_eq!(record.source, MessageSource::Web);
        assert!(!record.is_bot);
    }

    #[tokio::test]
    async fn multiline_content_survives_the_unwrap() {
        let (_, bridge) = bridge_with(MockBackend::default());
        bridge.set_identity("bot-1".to_owned());

        let echoed = GatewayMessage {
            author_id: "bot-1".to_owned(),
            author_is_bot: true,
            content: "**alice**: line one\nline two".to_owned(),
            ..GatewayMessage::default()
        };
        let record = bridge.normalize(&echoed);

        assert_eq!(record.author, "alice");
        assert_eq!(record.content, "line one\nline two");
    }

    #[tokio::test]
    async fn classifies_webhook_bot_and_plain_sources() {
        let (_, bridge) = bridge_with(MockBackend::default());

        let webhook = GatewayMessage {
            author_is_bot: true,
            via_webhook: true,
            ..GatewayMessage::default()
        };
        assert_eq!(bridge.normalize(&webhook).source, MessageSource::Webhook);

        let bot = GatewayMessage {
            author_is_bot: true,
            ..GatewayMessage::default()
        };
        let bot_record = bridge.normalize(&bot);
        assert_eq!(bot_record.source, MessageSource::Bot);
        assert!(bot_record.is_bot);

        let plain = GatewayMessage::default();
        assert_eq!(bridge.normalize(&plain).source, MessageSource::Discord);
    }

    #[tokio::test]
    async fn media_extraction_orders_attachments_embeds_then_body() {
        let (_, bridge) = bridge_with(MockBackend::default());

        let raw = GatewayMessage {
            content: "look https://x.com/a.png here".to_owned(),
            attachments: vec![
                GatewayAttachment {
                    url: "https://cdn.example/photo.jpg".to_owned(),
                    filename: "photo.jpg".to_owned(),
                    content_type: Some("image/jpeg".to_owned()),
                },
                GatewayAttachment {
                    url: "https://cdn.example/notes.txt".to_owned(),
                    filename: "notes.txt".to_owned(),
                    content_type: Some("text/plain".to_owned()),
                },
            ],
            embeds: vec![GatewayEmbed {
                image_url: None,
                thumbnail_url: Some("https://cdn.example/thumb.png?size=64".to_owned()),
            }],
            ..GatewayMessage::default()
        };

        let media = bridge.normalize(&raw).media;
        assert_eq!(media.len(), 3);
        assert_eq!(media[0].url, "https://cdn.example/photo.jpg");
        assert_eq!(media[1].url, "https://cdn.example/thumb.png?size=64");
        assert_eq!(media[1].filename, "thumb.png");
        assert_eq!(media[2].url, "https://x.com/a.png");
        assert_eq!(media[2].filename, "a.png");
    }

    #[tokio::test]
    async fn embed_image_precedes_embed_thumbnail() {
        let (_, bridge) = bridge_with(MockBackend::default());

        let raw = GatewayMessage {
            embeds: vec![GatewayEmbed {
                image_url: Some("https://cdn.example/full.png".to_owned()),
                thumbnail_url: Some("https://cdn.example/small.png".to_owned()),
            }],
            ..GatewayMessage::default()
        };

        let media = bridge.normalize(&raw).media;
        assert_eq!(media.len(), 2);
        assert_eq!(media[0].url, "https://cdn.example/full.png");
        assert_eq!(media[1].url, "https://cdn.example/small.png");
    }

    #[tokio::test]
    async fn reply_falls_back_to_inline_quote_when_fetch_fails() {
        let (backend, bridge) = bridge_with(MockBackend {
            fetch_fails: true,
            ..MockBackend::default()
        });

        let reply = WebReply {
            id: Some("42".to_owned()),
            author: "alice".to_owned(),
            content: "x".repeat(150),
        };
        let record = bridge
            .submit_web_message("bob", "sounds good", PASSWORD, Some(&reply))
            .await
            .expect("fallback send should succeed");

        let (outbound, native) = backend.sent.lock().unwrap()[0].clone();
        assert!(outbound.starts_with("**bob** replying to **alice**: \""));
        assert!(outbound.contains(&format!("{}...", "x".repeat(100))));
        assert!(outbound.ends_with("\nsounds good"));
        assert_eq!(native, None);
        assert_eq!(record.content, "sounds good");
    }

    #[tokio::test]
    async fn reply_uses_native_reference_when_target_exists() {
        let (backend, bridge) = bridge_with(MockBackend::default());

        let reply = WebReply {
            id: Some("42".to_owned()),
            author: "alice".to_owned(),
            content: "original".to_owned(),
        };
        bridge
            .submit_web_message("bob", "hi", PASSWORD, Some(&reply))
            .await
            .expect("send should succeed");

        let (outbound, native) = backend.sent.lock().unwrap()[0].clone();
        assert_eq!(outbound, "**bob**: hi");
        assert_eq!(native, Some("42".to_owned()));
    }

    #[tokio::test]
    async fn empty_message_is_rejected_before_any_backend_call() {
        let (backend, bridge) = bridge_with(MockBackend::default());

        let result = bridge.submit_web_message("bob", "   ", PASSWORD, None).await;
        assert!(matches!(result, Err(BridgeError::EmptyMessage)));
        assert!(backend.sent.lock().unwrap().is_empty());
        assert_eq!(backend.typing_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn unresolvable_destination_surfaces_channel_not_found() {
        let (_, bridge) = bridge_with(MockBackend {
            resolve_fails: true,
            ..MockBackend::default()
        });

        let result = bridge.submit_web_message("bob", "hi", PASSWORD, None).await;
        assert!(matches!(result, Err(BridgeError::ChannelNotFound)));
    }

    #[tokio::test]
    async fn sending_clears_the_senders_typing_entry() {
        let (_, bridge) = bridge_with(MockBackend::default());

        bridge
            .set_typing("alice", true, PASSWORD)
            .await
            .expect("typing update should succeed");
        assert!(bridge.typing.read().await.contains_key("alice"));

        bridge
            .submit_web_message("alice", "done typing", PASSWORD, None)
            .await
            .expect("send should succeed");
        assert!(!bridge.typing.read().await.contains_key("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn typing_entry_expires_after_the_timeout() {
        let (_, bridge) = bridge_with(MockBackend::default());

        bridge
            .set_typing("alice", true, PASSWORD)
            .await
            .expect("typing update should succeed");

        tokio::time::sleep(TYPING_TIMEOUT + Duration::from_millis(200)).await;

        let snapshot = bridge.snapshot(PASSWORD).await.expect("snapshot should succeed");
        assert!(snapshot.typing.is_empty());
        assert!(bridge.typing.read().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refreshed_typing_entry_outlives_the_first_timer() {
        let (_, bridge) = bridge_with(MockBackend::default());

        bridge
            .set_typing("alice", true, PASSWORD)
            .await
            .expect("typing update should succeed");
        tokio::time::sleep(Duration::from_secs(3)).await;
        bridge
            .set_typing("alice", true, PASSWORD)
            .await
            .expect("typing refresh should succeed");

        // The first timer fires now; the refreshed entry must survive it.
        tokio::time::sleep(Duration::from_millis(2200)).await;
        let snapshot = bridge.snapshot(PASSWORD).await.expect("snapshot should succeed");
        assert_eq!(snapshot.typing, vec!["alice".to_owned()]);

        // The second timer eventually removes it.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(bridge.typing.read().await.is_empty());
    }

    #[tokio::test]
    async fn typing_false_removes_the_entry_immediately() {
        let (_, bridge) = bridge_with(MockBackend::default());

        bridge
            .set_typing("alice", true, PASSWORD)
            .await
            .expect("typing update should succeed");
        bridge
            .set_typing("alice", false, PASSWORD)
            .await
            .expect("typing update should succeed");

        assert!(bridge.typing.read().await.is_empty());
    }

    #[tokio::test]
    async fn load_history_filters_sorts_and_replaces() {
        let stale = GatewayMessage {
            id: "old".to_owned(),
            timestamp: Utc::now() - ChronoDuration::days(HISTORY_DAYS + 1),
            ..GatewayMessage::default()
        };
        let newer = GatewayMessage {
            id: "newer".to_owned(),
            timestamp: Utc::now(),
            ..GatewayMessage::default()
        };
        let older = GatewayMessage {
            id: "older".to_owned(),
            timestamp: Utc::now() - ChronoDuration::hours(1),
            ..GatewayMessage::default()
        };

        let (_, bridge) = bridge_with(MockBackend {
            recent: Mutex::new(vec![newer, older, stale]),
            ..MockBackend::default()
        });
        bridge.handle_gateway_message(discord_message(1, false)).await;

        bridge.load_history().await;

        let history = bridge.history.read().await;
        let ids = history.iter().map(|record| record.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["older", "newer"]);
    }

    #[tokio::test]
    async fn failed_history_fetch_leaves_the_mirror_alone() {
        let (_, bridge) = bridge_with(MockBackend {
            recent_fails: true,
            ..MockBackend::default()
        });
        bridge.handle_gateway_message(discord_message(7, false)).await;

        bridge.load_history().await;

        let history = bridge.history.read().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "7");
    }

    #[tokio::test]
    async fn purge_removes_only_bot_records_and_counts_them() {
        let (_, bridge) = bridge_with(MockBackend::default());

        for id in 0..150 {
            bridge
                .handle_gateway_message(discord_message(id, id % 3 == 0))
                .await;
        }

        let removed = bridge
            .purge_bot_messages(PASSWORD)
            .await
            .expect("purge should succeed");

        let history = bridge.history.read().await;
        let expected_bots = (50..150).filter(|id| id % 3 == 0).count();
        assert_eq!(removed, expected_bots);
        assert_eq!(history.len(), MAX_MESSAGES - expected_bots);
        assert!(history.iter().all(|record| !record.is_bot));

        // Survivors keep their relative order.
        let ids = history
            .iter()
            .map(|record| record.id.parse::<usize>().unwrap())
            .collect::<Vec<_>>();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_without_touching_state() {
        let (backend, bridge) = bridge_with(MockBackend::default());
        bridge.handle_gateway_message(discord_message(1, true)).await;

        assert!(matches!(
            bridge.submit_web_message("bob", "hi", "nope", None).await,
            Err(BridgeError::Unauthorized)
        ));
        assert!(matches!(
            bridge.set_typing("bob", true, "nope").await,
            Err(BridgeError::Unauthorized)
        ));
        assert!(matches!(
            bridge.snapshot("nope").await,
            Err(BridgeError::Unauthorized)
        ));
        assert!(matches!(
            bridge.purge_bot_messages("nope").await,
            Err(BridgeError::Unauthorized)
        ));

        assert_eq!(bridge.history.read().await.len(), 1);
        assert!(bridge.typing.read().await.is_empty());
        assert!(!*bridge.online.read().await);
        assert!(backend.sent.lock().unwrap().is_empty());
        assert!(backend.presence.lock().unwrap().is_empty());
        assert_eq!(backend.typing_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_goes_online_on_snapshot_and_idle_after_timeout() {
        let (backend, bridge) = bridge_with(MockBackend::default());

        bridge.snapshot(PASSWORD).await.expect("snapshot should succeed");
        assert!(*bridge.online.read().await);
        assert_eq!(backend.presence.lock().unwrap().as_slice(), &[true]);

        // A second snapshot while already online pushes nothing.
        bridge.snapshot(PASSWORD).await.expect("snapshot should succeed");
        assert_eq!(backend.presence.lock().unwrap().len(), 1);

        tokio::time::sleep(PRESENCE_TIMEOUT).await;
        bridge.poll_presence().await;
        assert!(!*bridge.online.read().await);
        assert_eq!(backend.presence.lock().unwrap().as_slice(), &[true, false]);

        // Still idle: the poller stays quiet.
        bridge.poll_presence().await;
        assert_eq!(backend.presence.lock().unwrap().len(), 2);

        bridge.snapshot(PASSWORD).await.expect("snapshot should succeed");
        assert_eq!(backend.presence.lock().unwrap().as_slice(), &[true, false, true]);
    }

    #[tokio::test]
    async fn password_probe_does_not_mark_the_client_active() {
        let (backend, bridge) = bridge_with(MockBackend::default());

        assert!(bridge.password_matches(PASSWORD));
        assert!(!bridge.password_matches("nope"));
        assert!(!*bridge.online.read().await);
        assert!(backend.presence.lock().unwrap().is_empty());
    }
}
