use thiserror::Error;

use artisan_types::gateway::GatewayError;
use artisan_types::models::{ConversationId, IdentityId};

#[derive(Debug, Clone, Error)]
pub enum MessagingError {
    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Cannot start a conversation with yourself")]
    SelfConversation,

    #[error("Conversation {0} not found")]
    ConversationNotFound(ConversationId),

    #[error("{identity} is not a participant of conversation {conversation}")]
    NotParticipant {
        conversation: ConversationId,
        identity: IdentityId,
    },

    /// The user navigated elsewhere before this load finished.
    #[error("Load of conversation {0} was superseded")]
    Superseded(ConversationId),

    #[error("Messaging session has been signed out")]
    SignedOut,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl MessagingError {
    /// Whether re-submitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Gateway(GatewayError::Network(_) | GatewayError::Backend(_)))
    }

    /// Text for an error banner.
    pub fn user_message(&self) -> String {
        match self {
            Self::Gateway(GatewayError::Network(_)) => {
                "You appear to be offline. Check your connection and try again.".to_string()
            }
            Self::Gateway(_) => "Something went wrong talking to the server. Please try again.".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;
