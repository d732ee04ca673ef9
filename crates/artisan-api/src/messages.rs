use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use artisan_messaging::MessageDraft;
use artisan_types::api::{Claims, SendMessageRequest, SendMessageResponse};
use artisan_types::models::ConversationId;

use crate::error::ApiResult;
use crate::state::AppState;

fn draft_from(req: SendMessageRequest) -> MessageDraft {
    MessageDraft {
        content: req.content,
        message_type: req.message_type,
        file_url: req.file_url,
        file_name: req.file_name,
    }
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let messenger = state.messenger(claims.sub).await;
    let receipt = messenger.send_message(conversation_id, draft_from(req)).await?;

    Ok((
        StatusCode::CREATED,
        Json(SendMessageResponse {
            persisted: receipt.is_persisted(),
            message: receipt.message().clone(),
        }),
    ))
}
