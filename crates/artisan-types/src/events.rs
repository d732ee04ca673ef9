use serde::{Deserialize, Serialize};

use crate::models::{ConversationId, ConversationRow, IdentityId, Message, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Conversations,
    Messages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// A row payload carried by a change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Row {
    Conversation(ConversationRow),
    Message(Message),
}

impl Row {
    pub fn table(&self) -> Table {
        match self {
            Self::Conversation(_) => Table::Conversations,
            Self::Message(_) => Table::Messages,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::Conversation(row) => row.id,
            Self::Message(message) => message.conversation_id,
        }
    }
}

/// Events published by the realtime broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeEvent {
    /// A row was inserted or updated.
    RowChange { kind: ChangeKind, row: Row },

    /// Ephemeral: a participant is typing. Never persisted.
    Typing {
        conversation_id: ConversationId,
        identity_id: IdentityId,
    },
}

impl RealtimeEvent {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::RowChange { row, .. } => row.conversation_id(),
            Self::Typing { conversation_id, .. } => *conversation_id,
        }
    }
}

/// Server-side filter for one realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub table: Table,
    /// `None` delivers both inserts and updates.
    pub event: Option<ChangeKind>,
    /// Restrict to one conversation (`conversation_id` column for messages,
    /// `id` for conversations).
    pub conversation_id: Option<ConversationId>,
    /// Also deliver typing events for `conversation_id`.
    pub typing: bool,
    /// Restrict conversation rows to those this identity takes part in.
    /// Message rows carry no participants and never match it.
    pub participant: Option<IdentityId>,
}

impl ChannelFilter {
    pub fn messages() -> Self {
        Self {
            table: Table::Messages,
            event: None,
            conversation_id: None,
            typing: false,
            participant: None,
        }
    }

    pub fn conversations() -> Self {
        Self {
            table: Table::Conversations,
            event: None,
            conversation_id: None,
            typing: false,
            participant: None,
        }
    }

    pub fn only(mut self, event: ChangeKind) -> Self {
        self.event = Some(event);
        self
    }

    pub fn in_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn involving(mut self, identity: IdentityId) -> Self {
        self.participant = Some(identity);
        self
    }

    pub fn with_typing(mut self) -> Self {
        self.typing = true;
        self
    }

    pub fn matches(&self, event: &RealtimeEvent) -> bool {
        if let Some(conversation_id) = self.conversation_id {
            if event.conversation_id() != conversation_id {
                return false;
            }
        }

        match event {
            RealtimeEvent::RowChange { kind, row } => {
                let participant_ok = match (self.participant, row) {
                    (None, _) => true,
                    (Some(identity), Row::Conversation(conversation)) => conversation.involves(identity),
                    (Some(_), Row::Message(_)) => false,
                };
                row.table() == self.table && self.event.map_or(true, |e| e == *kind) && participant_ok
            }
            RealtimeEvent::Typing { .. } => self.typing && self.conversation_id.is_some(),
        }
    }
}

/// What a gateway subscription delivers, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    /// The server acknowledged the subscription.
    Subscribed,
    Event(RealtimeEvent),
    /// Channel-level failure. No further signals follow.
    Error(String),
}

/// Toast surfaced by the global notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sender_id: IdentityId,
    pub title: String,
    pub preview: String,
    /// Deep link into the messaging view.
    pub link: String,
}

impl Notification {
    pub fn for_message(message: &Message) -> Self {
        Self {
            conversation_id: message.conversation_id,
            message_id: message.id,
            sender_id: message.sender_id,
            title: "New message".to_string(),
            preview: message.preview(),
            link: format!("/messages?conversation={}", message.conversation_id),
        }
    }
}

/// Commands sent FROM the UI over the notifications socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    StartTyping { conversation_id: ConversationId },
}
