use axum::http::StatusCode;
use thiserror::Error;

/// Failures surfaced by bridge operations, mapped onto HTTP statuses by the
/// API layer.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid password")]
    Unauthorized,

    #[error("message may not be empty")]
    EmptyMessage,

    #[error("destination channel could not be resolved")]
    ChannelNotFound,

    #[error("chat backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl BridgeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::EmptyMessage => StatusCode::BAD_REQUEST,
            Self::ChannelNotFound => StatusCode::NOT_FOUND,
            Self::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_expected_statuses() {
        assert_eq!(BridgeError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(BridgeError::EmptyMessage.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(BridgeError::ChannelNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            BridgeError::Backend(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
