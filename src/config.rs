use std::{env, net::SocketAddr};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_bind: SocketAddr,
    pub discord_token: String,
    /// Discord channel to bridge. A user id also works; the backend falls back
    /// to opening a DM with that user.
    pub channel_id: u64,
    pub chat_password: String,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = env::var("PORT").unwrap_or_else(|_| "8080".to_owned());
        let http_bind = env::var("HTTP_BIND").unwrap_or_else(|_| format!("0.0.0.0:{port}"));
        let http_bind = http_bind.parse()?;

        Ok(Self {
            http_bind,
            discord_token: env::var("DISCORD_TOKEN").context("DISCORD_TOKEN is not set")?,
            channel_id: env::var("CHANNEL_ID")
                .context("CHANNEL_ID is not set")?
                .parse()
                .context("CHANNEL_ID must be a numeric Discord id")?,
            chat_password: env::var("CHAT_PASSWORD").context("CHAT_PASSWORD is not set")?,
        })
    }
}
