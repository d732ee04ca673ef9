use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use artisan_messaging::MessagingError;
use artisan_types::api::ErrorResponse;
use artisan_types::gateway::GatewayError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        let Self::Messaging(err) = self;
        match err {
            MessagingError::EmptyMessage | MessagingError::InvalidMessage(_) | MessagingError::SelfConversation => {
                StatusCode::BAD_REQUEST
            }
            MessagingError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            MessagingError::NotParticipant { .. } | MessagingError::Gateway(GatewayError::Forbidden(_)) => {
                StatusCode::FORBIDDEN
            }
            MessagingError::Superseded(_) => StatusCode::CONFLICT,
            MessagingError::SignedOut => StatusCode::UNAUTHORIZED,
            MessagingError::Gateway(GatewayError::Network(_)) => StatusCode::SERVICE_UNAVAILABLE,
            MessagingError::Gateway(GatewayError::NotFound(_)) => StatusCode::NOT_FOUND,
            MessagingError::Gateway(GatewayError::Conflict(_)) => StatusCode::CONFLICT,
            MessagingError::Gateway(GatewayError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let Self::Messaging(err) = self;
        if status.is_server_error() {
            error!("Request failed: {}", err);
        }
        let body = ErrorResponse {
            error: err.user_message(),
            retryable: err.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
