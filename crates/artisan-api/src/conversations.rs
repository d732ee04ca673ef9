use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;

use artisan_types::api::{
    Claims, ConversationDetailResponse, ConversationListResponse, MarkReadResponse, StartConversationRequest,
    StartConversationResponse, UnreadResponse,
};
use artisan_types::models::ConversationId;

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let messenger = state.messenger(claims.sub).await;
    let conversations = messenger.load_conversations().await?;
    Ok(Json(ConversationListResponse {
        conversations,
        total_unread: messenger.total_unread(),
    }))
}

pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> ApiResult<impl IntoResponse> {
    let messenger = state.messenger(claims.sub).await;
    let conversation_id = messenger.get_or_create_conversation(req.other_identity_id).await?;
    Ok((StatusCode::CREATED, Json(StartConversationResponse { conversation_id })))
}

/// Open a conversation: full history, and everything in it marked read.
pub async fn open_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let messenger = state.messenger(claims.sub).await;
    let snapshot = messenger.open_conversation(conversation_id).await?;
    Ok(Json(ConversationDetailResponse {
        conversation: snapshot.conversation,
        messages: snapshot.messages,
    }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let messenger = state.messenger(claims.sub).await;
    let marked = messenger.mark_read(conversation_id).await?;
    Ok(Json(MarkReadResponse {
        marked,
        total_unread: messenger.total_unread(),
    }))
}

pub async fn start_typing(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    state.messenger(claims.sub).await.start_typing(conversation_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unread(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> impl IntoResponse {
    let messenger = state.messenger(claims.sub).await;
    Json(UnreadResponse {
        total_unread: messenger.total_unread(),
    })
}

/// Drop the caller's messaging session and every channel it holds.
pub async fn sign_out(State(state): State<AppState>, Extension(claims): Extension<Claims>) -> impl IntoResponse {
    if state.sign_out(claims.sub).await {
        info!("{} signed out", claims.sub);
    }
    StatusCode::NO_CONTENT
}
