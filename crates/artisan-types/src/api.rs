use serde::{Deserialize, Serialize};

use crate::models::{Conversation, ConversationId, IdentityId, Message, MessageType};

// -- JWT Claims --

/// Claims of the access token issued by the external auth provider. Only
/// `sub` is consumed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: IdentityId,
    pub exp: usize,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartConversationRequest {
    pub other_identity_id: IdentityId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartConversationResponse {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Serialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<Conversation>,
    pub total_unread: u32,
}

#[derive(Debug, Serialize)]
pub struct ConversationDetailResponse {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub message: Message,
    /// False when the message only exists locally.
    pub persisted: bool,
}

#[derive(Debug, Serialize)]
pub struct MarkReadResponse {
    pub marked: u32,
    pub total_unread: u32,
}

#[derive(Debug, Serialize)]
pub struct UnreadResponse {
    pub total_unread: u32,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
}
