//! Row <-> model conversions between `artisan-db` records and
//! `artisan-types` models.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};

use artisan_db::models::{ConversationRecord, MessageRecord, ProfileRow};
use artisan_types::models::{ConversationRow, Message, MessageType, Profile};

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|_| {
            // Rows written by SQLite's datetime('now') carry no timezone
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .with_context(|| format!("Corrupt timestamp '{}'", raw))
}

pub fn conversation(record: ConversationRecord) -> Result<ConversationRow> {
    Ok(ConversationRow {
        id: record
            .id
            .parse()
            .with_context(|| format!("Corrupt conversation id '{}'", record.id))?,
        participant_1_id: record.participant_1_id.parse()?,
        participant_2_id: record.participant_2_id.parse()?,
        last_message_at: record
            .last_message_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
        created_at: parse_timestamp(&record.created_at)?,
        updated_at: parse_timestamp(&record.updated_at)?,
    })
}

pub fn message(record: MessageRecord) -> Result<Message> {
    Ok(Message {
        id: record
            .id
            .parse()
            .with_context(|| format!("Corrupt message id '{}'", record.id))?,
        conversation_id: record.conversation_id.parse()?,
        sender_id: record.sender_id.parse()?,
        message_type: record
            .message_type
            .parse::<MessageType>()
            .map_err(|e| anyhow!("{} on message '{}'", e, record.id))?,
        content: record.content,
        file_url: record.file_url,
        file_name: record.file_name,
        is_read: record.is_read,
        created_at: parse_timestamp(&record.created_at)?,
    })
}

pub fn profile(row: ProfileRow) -> Result<Profile> {
    Ok(Profile {
        id: row.id.parse()?,
        display_name: row.display_name,
        full_name: row.full_name,
        email: row.email,
        avatar_url: row.avatar_url,
    })
}

pub fn profile_row(profile: &Profile) -> ProfileRow {
    ProfileRow {
        id: profile.id.to_string(),
        display_name: profile.display_name.clone(),
        full_name: profile.full_name.clone(),
        email: profile.email.clone(),
        avatar_url: profile.avatar_url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_timestamp_shapes() {
        let stored = parse_timestamp("2026-03-01T10:20:30.123456Z").unwrap();
        assert_eq!(stored.timestamp_subsec_micros(), 123456);

        let legacy = parse_timestamp("2026-03-01 10:20:30").unwrap();
        assert_eq!(legacy.timestamp(), stored.timestamp());

        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn rejects_unknown_message_type() {
        let record = MessageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: uuid::Uuid::new_v4().to_string(),
            sender_id: uuid::Uuid::new_v4().to_string(),
            content: String::new(),
            message_type: "sticker".into(),
            file_url: None,
            file_name: None,
            is_read: false,
            created_at: "2026-03-01T10:20:30.000000Z".into(),
        };
        assert!(message(record).is_err());
    }
}
