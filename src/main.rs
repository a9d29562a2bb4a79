use std::{net::SocketAddr, sync::Arc};

use bridgekeeper::{
    bridge::{self, MessageBridge},
    config::AppConfig,
    discord::{self, DiscordBackend},
    http::{self, AppState},
};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;

    let backend = Arc::new(DiscordBackend::new(config.channel_id));
    let bridge = Arc::new(MessageBridge::new(
        backend.clone(),
        config.chat_password.clone(),
    ));

    {
        let bridge = bridge.clone();
        let backend = backend.clone();
        let token = config.discord_token.clone();
        tokio::spawn(async move {
            discord::run(token, bridge, backend).await;
        });
    }

    bridge::spawn_presence_poller(bridge.clone());

    let app = http::router(AppState { bridge });
    let listener = TcpListener::bind(config.http_bind).await?;
    info!("bridgekeeper HTTP API listening on {}", config.http_bind);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();
}
