/// Row types as stored in SQLite.
/// Distinct from artisan-types models to keep the DB layer independent.

#[derive(Debug, Clone)]
pub struct ProfileRow {
    pub id: String,
    pub display_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub id: String,
    pub participant_1_id: String,
    pub participant_2_id: String,
    pub last_message_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub message_type: String,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub is_read: bool,
    pub created_at: String,
}

/// Outcome of creating a conversation for a pair.
#[derive(Debug)]
pub enum CreateConversation {
    Created(ConversationRecord),
    /// The pair already has a conversation (possibly created concurrently).
    Duplicate,
}
