use std::collections::HashSet;

use artisan_types::models::{Message, MessageId};

/// A message as held by an open conversation view.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    /// Shown before (or instead of) server confirmation. Carries a local id.
    Pending(Message),
    /// The authoritative row.
    Confirmed(Message),
    /// The write was rejected; kept visible so the user can re-submit.
    Failed { message: Message, reason: String },
}

impl TimelineEntry {
    pub fn message(&self) -> &Message {
        match self {
            Self::Pending(message) | Self::Confirmed(message) => message,
            Self::Failed { message, .. } => message,
        }
    }

    fn message_mut(&mut self) -> &mut Message {
        match self {
            Self::Pending(message) | Self::Confirmed(message) => message,
            Self::Failed { message, .. } => message,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

/// Ordered, duplicate-free message list for one conversation.
///
/// Entries are kept ascending by `created_at`; a new entry goes after every
/// entry with an equal or earlier timestamp, so accepted entries never move
/// relative to each other. Every insertion path checks the id first.
#[derive(Debug, Default)]
pub struct MessageTimeline {
    entries: Vec<TimelineEntry>,
    ids: HashSet<MessageId>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_history(messages: impl IntoIterator<Item = Message>) -> Self {
        let mut timeline = Self::new();
        for message in messages {
            timeline.append(message);
        }
        timeline
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn messages(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message().clone()).collect()
    }

    pub fn last(&self) -> Option<&Message> {
        self.entries.last().map(TimelineEntry::message)
    }

    /// Accept a message unless its id is already present. Local ids become
    /// `Pending` entries, server ids `Confirmed` ones.
    pub fn append(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        let entry = if message.id.is_local() {
            TimelineEntry::Pending(message)
        } else {
            TimelineEntry::Confirmed(message)
        };
        self.insert_ordered(entry);
        true
    }

    /// Replace the pending entry `local_id` with its authoritative row. If
    /// the row already arrived through the live feed, the pending copy is
    /// folded into it.
    pub fn confirm(&mut self, local_id: MessageId, confirmed: Message) -> bool {
        let Some(pos) = self.position(&local_id) else {
            return self.append(confirmed);
        };

        self.entries.remove(pos);
        self.ids.remove(&local_id);
        if self.ids.contains(&confirmed.id) {
            return false;
        }
        self.ids.insert(confirmed.id);
        self.insert_ordered(TimelineEntry::Confirmed(confirmed));
        true
    }

    /// Mark the pending entry `local_id` as failed.
    pub fn fail(&mut self, local_id: MessageId, reason: impl Into<String>) -> bool {
        let Some(pos) = self.position(&local_id) else {
            return false;
        };
        let TimelineEntry::Pending(message) = self.entries[pos].clone() else {
            return false;
        };
        self.entries[pos] = TimelineEntry::Failed {
            message,
            reason: reason.into(),
        };
        true
    }

    /// Apply an update to an existing row in place (read receipts).
    pub fn apply_update(&mut self, updated: &Message) -> bool {
        let Some(pos) = self.position(&updated.id) else {
            return false;
        };
        let message = self.entries[pos].message_mut();
        message.is_read = updated.is_read;
        message.content.clone_from(&updated.content);
        true
    }

    /// Flip `is_read` on confirmed messages not sent by `reader`. Returns how
    /// many changed.
    pub fn mark_read_by(&mut self, reader: artisan_types::models::IdentityId) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            if let TimelineEntry::Confirmed(message) = entry {
                if message.sender_id != reader && !message.is_read {
                    message.is_read = true;
                    changed += 1;
                }
            }
        }
        changed
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        if !self.ids.contains(id) {
            return None;
        }
        self.entries.iter().position(|e| e.message().id == *id)
    }

    fn insert_ordered(&mut self, entry: TimelineEntry) {
        let created_at = entry.message().created_at;
        let at = self.entries.partition_point(|e| e.message().created_at <= created_at);
        self.entries.insert(at, entry);
    }
}
