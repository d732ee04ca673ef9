use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shown in place of a profile that could not be resolved.
pub const UNKNOWN_USER: &str = "Unknown User";

/// Previews longer than this are cut and suffixed with an ellipsis.
pub const PREVIEW_CHARS: usize = 50;

const LOCAL_ID_PREFIX: &str = "local-";

// -- Ids --

/// The signed-in actor. Opaque; issued by the external auth provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub Uuid);

impl IdentityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IdentityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for IdentityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConversationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Message identifier. Server-issued ids are bare UUIDs; ids synthesized on
/// the client while a message is not (or never will be) persisted render as
/// `local-<uuid>`, so the two spaces cannot collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum MessageId {
    Server(Uuid),
    Local(Uuid),
}

impl MessageId {
    pub fn local() -> Self {
        Self::Local(Uuid::new_v4())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server(id) => write!(f, "{}", id),
            Self::Local(id) => write!(f, "{}{}", LOCAL_ID_PREFIX, id),
        }
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(LOCAL_ID_PREFIX) {
            Some(rest) => Ok(Self::Local(rest.parse()?)),
            None => Ok(Self::Server(s.parse()?)),
        }
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for MessageId {
    type Error = uuid::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// -- Profiles --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: IdentityId,
    pub display_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

impl Profile {
    /// Stand-in used when the profile lookup fails or times out.
    pub fn placeholder(id: IdentityId) -> Self {
        Self {
            id,
            display_name: Some(UNKNOWN_USER.to_string()),
            full_name: None,
            email: None,
            avatar_url: None,
        }
    }

    pub fn display_label(&self) -> &str {
        [&self.display_name, &self.full_name, &self.email]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|s| !s.trim().is_empty())
            .unwrap_or(UNKNOWN_USER)
    }
}

// -- Messages --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            other => Err(format!("unknown message type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: IdentityId,
    pub content: String,
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Short summary for list rows and toasts.
    pub fn preview(&self) -> String {
        match self.message_type {
            MessageType::Image => "📷 Image".to_string(),
            MessageType::File => match &self.file_name {
                Some(name) if !name.is_empty() => format!("📎 {}", name),
                _ => "📎 File".to_string(),
            },
            MessageType::Text => truncate_preview(&self.content),
        }
    }
}

fn truncate_preview(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(PREVIEW_CHARS).collect();
    format!("{}…", cut.trim_end())
}

/// A message as submitted for persistence. The gateway assigns id and
/// timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: IdentityId,
    pub content: String,
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
}

// -- Conversations --

/// The raw `conversations` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: ConversationId,
    pub participant_1_id: IdentityId,
    pub participant_2_id: IdentityId,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRow {
    pub fn involves(&self, identity: IdentityId) -> bool {
        self.participant_1_id == identity || self.participant_2_id == identity
    }

    /// The participant that is not `identity`, or `None` if `identity` is not
    /// part of this conversation.
    pub fn other_participant(&self, identity: IdentityId) -> Option<IdentityId> {
        if self.participant_1_id == identity {
            Some(self.participant_2_id)
        } else if self.participant_2_id == identity {
            Some(self.participant_1_id)
        } else {
            None
        }
    }
}

/// A conversation as seen by one identity, enriched for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_a: IdentityId,
    pub participant_b: IdentityId,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub other_participant: Profile,
    pub last_message: Option<Message>,
    pub last_message_preview: Option<String>,
    pub unread_count: u32,
}

impl Conversation {
    pub fn from_row(
        row: &ConversationRow,
        other_participant: Profile,
        last_message: Option<Message>,
        unread_count: u32,
    ) -> Self {
        Self {
            id: row.id,
            participant_a: row.participant_1_id,
            participant_b: row.participant_2_id,
            last_message_at: row.last_message_at,
            created_at: row.created_at,
            other_participant,
            last_message_preview: last_message.as_ref().map(Message::preview),
            last_message,
            unread_count,
        }
    }
}
