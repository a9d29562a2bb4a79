use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    bridge::{MessageBridge, Snapshot, WebReply},
    error::BridgeError,
    types::MessageRecord,
};

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<MessageBridge>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
}

#[derive(Debug, Deserialize)]
pub struct TypingRequest {
    pub username: String,
    pub password: String,
    #[serde(rename = "isTyping")]
    pub is_typing: bool,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    pub message: String,
    pub username: String,
    pub password: String,
    #[serde(rename = "replyTo")]
    pub reply_to: Option<WebReply>,
}

#[derive(Debug, Serialize)]
pub struct SendResponse {
    pub success: bool,
    pub message: MessageRecord,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeResponse {
    pub success: bool,
    pub removed_count: usize,
    pub message: String,
}

pub fn router(state: AppState) -> Router {
    // One request replenished every `seconds` per client IP, no burst. Keyed
    // by peer address, so clients behind a shared NAT share a bucket.
    let limit = |seconds: u64| GovernorLayer {
        config: Arc::new(
            GovernorConfigBuilder::default()
                .per_second(seconds)
                .burst_size(1)
                .finish()
                .expect("valid rate limiter configuration"),
        ),
    };

    Router::new()
        .route("/api/validate-password", post(validate_password).layer(limit(2)))
        .route("/api/messages", post(messages))
        .route("/api/typing", post(set_typing).layer(limit(4)))
        .route("/api/send", post(send_message).layer(limit(1)))
        .route("/api/purge-bot-messages", post(purge_bot_messages).layer(limit(1)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn validate_password(
    State(state): State<AppState>,
    Json(request): Json<PasswordRequest>,
) -> Json<ValidateResponse> {
    Json(ValidateResponse {
        valid: state.bridge.password_matches(&request.password),
    })
}

async fn messages(
    State(state): State<AppState>,
    Json(request): Json<PasswordRequest>,
) -> Result<Json<Snapshot>, BridgeError> {
    let snapshot = state.bridge.snapshot(&request.password).await?;
    Ok(Json(snapshot))
}

async fn set_typing(
    State(state): State<AppState>,
    Json(request): Json<TypingRequest>,
) -> Result<Json<Value>, BridgeError> {
    state
        .bridge
        .set_typing(&request.username, request.is_typing, &request.password)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, BridgeError> {
    let record = state
        .bridge
        .submit_web_message(
            &request.username,
            &request.message,
            &request.password,
            request.reply_to.as_ref(),
        )
        .await?;

    Ok(Json(SendResponse {
        success: true,
        message: record,
    }))
}

async fn purge_bot_messages(
    State(state): State<AppState>,
    Json(request): Json<PasswordRequest>,
) -> Result<Json<PurgeResponse>, BridgeError> {
    let removed = state.bridge.purge_bot_messages(&request.password).await?;
    Ok(Json(PurgeResponse {
        success: true,
        removed_count: removed,
        message: format!("removed {removed} bot messages"),
    }))
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
