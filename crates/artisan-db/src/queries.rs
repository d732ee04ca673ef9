use crate::models::{ConversationRecord, CreateConversation, MessageRecord, ProfileRow};
use crate::{Database, now_timestamp};
use anyhow::Result;
use rusqlite::{Connection, ErrorCode, Row};

const CONVERSATION_COLUMNS: &str =
    "id, participant_1_id, participant_2_id, last_message_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, content, message_type, file_url, file_name, is_read, created_at";

/// Stored participant order for the unordered pair `{a, b}`.
pub fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

impl Database {
    // -- Profiles --

    pub fn upsert_profile(&self, profile: &ProfileRow) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (id, display_name, full_name, email, avatar_url)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    display_name = excluded.display_name,
                    full_name = excluded.full_name,
                    email = excluded.email,
                    avatar_url = excluded.avatar_url",
                rusqlite::params![
                    profile.id,
                    profile.display_name,
                    profile.full_name,
                    profile.email,
                    profile.avatar_url
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, id: &str) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, display_name, full_name, email, avatar_url FROM profiles WHERE id = ?1",
                [id],
                |row| {
                    Ok(ProfileRow {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        full_name: row.get(2)?,
                        email: row.get(3)?,
                        avatar_url: row.get(4)?,
                    })
                },
            )
            .optional()
        })
    }

    // -- Conversations --

    pub fn list_conversations(&self, identity: &str) -> Result<Vec<ConversationRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {CONVERSATION_COLUMNS} FROM conversations
                 WHERE participant_1_id = ?1 OR participant_2_id = ?1
                 ORDER BY last_message_at IS NULL, last_message_at DESC, created_at DESC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([identity], conversation_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    pub fn find_conversation_between(&self, a: &str, b: &str) -> Result<Option<ConversationRecord>> {
        self.with_conn(|conn| query_conversation_between(conn, a, b))
    }

    /// Create the conversation for `{a, b}`. A concurrent creator that got
    /// there first shows up as [`CreateConversation::Duplicate`].
    pub fn create_conversation(&self, id: &str, a: &str, b: &str) -> Result<CreateConversation> {
        let (p1, p2) = ordered_pair(a, b);
        let now = now_timestamp();

        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO conversations (id, participant_1_id, participant_2_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![id, p1, p2, now],
            );

            match inserted {
                Ok(_) => Ok(CreateConversation::Created(ConversationRecord {
                    id: id.to_string(),
                    participant_1_id: p1.to_string(),
                    participant_2_id: p2.to_string(),
                    last_message_at: None,
                    created_at: now.clone(),
                    updated_at: now.clone(),
                })),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Ok(CreateConversation::Duplicate)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    // -- Messages --

    /// Insert a message and bump the conversation's `last_message_at` in the
    /// same transaction. Returns the stored row and the updated conversation.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        message_type: &str,
        file_url: Option<&str>,
        file_name: Option<&str>,
    ) -> Result<(MessageRecord, ConversationRecord)> {
        let now = now_timestamp();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, message_type, file_url, file_name, is_read, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
                rusqlite::params![id, conversation_id, sender_id, content, message_type, file_url, file_name, now],
            )?;
            tx.execute(
                "UPDATE conversations SET last_message_at = ?2, updated_at = ?2 WHERE id = ?1",
                rusqlite::params![conversation_id, now],
            )?;
            let conversation = query_conversation(&tx, conversation_id)?
                .ok_or_else(|| anyhow::anyhow!("Conversation not found: {}", conversation_id))?;
            tx.commit()?;

            Ok((
                MessageRecord {
                    id: id.to_string(),
                    conversation_id: conversation_id.to_string(),
                    sender_id: sender_id.to_string(),
                    content: content.to_string(),
                    message_type: message_type.to_string(),
                    file_url: file_url.map(str::to_string),
                    file_name: file_name.map(str::to_string),
                    is_read: false,
                    created_at: now,
                },
                conversation,
            ))
        })
    }

    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, rowid ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([conversation_id], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn last_message(&self, conversation_id: &str) -> Result<Option<MessageRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1"
            );
            conn.query_row(&sql, [conversation_id], message_from_row).optional()
        })
    }

    pub fn count_unread(&self, conversation_id: &str, reader: &str) -> Result<u32> {
        self.with_conn(|conn| {
            let count: u32 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND is_read = 0",
                [conversation_id, reader],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Mark every unread message from the other side as read. Returns the
    /// rows that changed, already flipped.
    pub fn mark_read(&self, conversation_id: &str, reader: &str) -> Result<Vec<MessageRecord>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut changed = {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1 AND sender_id != ?2 AND is_read = 0
                     ORDER BY created_at ASC, rowid ASC"
                );
                let mut stmt = tx.prepare(&sql)?;
                stmt.query_map([conversation_id, reader], message_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            tx.execute(
                "UPDATE messages SET is_read = 1
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND is_read = 0",
                [conversation_id, reader],
            )?;
            tx.commit()?;

            for record in &mut changed {
                record.is_read = true;
            }
            Ok(changed)
        })
    }
}

fn query_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationRecord>> {
    let sql = format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1");
    conn.query_row(&sql, [id], conversation_from_row).optional()
}

fn query_conversation_between(conn: &Connection, a: &str, b: &str) -> Result<Option<ConversationRecord>> {
    let (p1, p2) = ordered_pair(a, b);
    let sql = format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations
         WHERE participant_1_id = ?1 AND participant_2_id = ?2"
    );
    conn.query_row(&sql, [p1, p2], conversation_from_row).optional()
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationRecord> {
    Ok(ConversationRecord {
        id: row.get(0)?,
        participant_1_id: row.get(1)?,
        participant_2_id: row.get(2)?,
        last_message_at: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        message_type: row.get(4)?,
        file_url: row.get(5)?,
        file_name: row.get(6)?,
        is_read: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn id() -> String {
        Uuid::new_v4().to_string()
    }

    fn conversation(db: &Database, a: &str, b: &str) -> ConversationRecord {
        match db.create_conversation(&id(), a, b).unwrap() {
            CreateConversation::Created(record) => record,
            CreateConversation::Duplicate => panic!("unexpected duplicate"),
        }
    }

    #[test]
    fn pair_is_unique_regardless_of_order() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (id(), id());

        let created = conversation(&db, &a, &b);
        assert!(matches!(
            db.create_conversation(&id(), &b, &a).unwrap(),
            CreateConversation::Duplicate
        ));

        let found = db.find_conversation_between(&b, &a).unwrap().unwrap();
        assert_eq!(found.id, created.id);
    }

    #[test]
    fn insert_message_bumps_conversation() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (id(), id());
        let conv = conversation(&db, &a, &b);
        assert!(conv.last_message_at.is_none());

        let (message, updated) = db
            .insert_message(&id(), &conv.id, &a, "Hello", "text", None, None)
            .unwrap();

        assert_eq!(updated.last_message_at.as_deref(), Some(message.created_at.as_str()));
        assert_eq!(db.count_unread(&conv.id, &b).unwrap(), 1);
        assert_eq!(db.count_unread(&conv.id, &a).unwrap(), 0);
    }

    #[test]
    fn list_orders_by_last_message_nulls_last() {
        let db = Database::open_in_memory().unwrap();
        let me = id();
        let quiet = conversation(&db, &me, &id());
        let older = conversation(&db, &me, &id());
        let newer = conversation(&db, &me, &id());

        db.insert_message(&id(), &older.id, &me, "first", "text", None, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        db.insert_message(&id(), &newer.id, &me, "second", "text", None, None).unwrap();

        let ids: Vec<String> = db
            .list_conversations(&me)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![newer.id, older.id, quiet.id]);
    }

    #[test]
    fn mark_read_skips_own_messages() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (id(), id());
        let conv = conversation(&db, &a, &b);
        db.insert_message(&id(), &conv.id, &a, "from a", "text", None, None).unwrap();
        db.insert_message(&id(), &conv.id, &b, "from b", "text", None, None).unwrap();

        let changed = db.mark_read(&conv.id, &b).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].sender_id, a);
        assert!(changed[0].is_read);

        // idempotent
        assert!(db.mark_read(&conv.id, &b).unwrap().is_empty());
        // b's own message is still unread from a's side
        assert_eq!(db.count_unread(&conv.id, &a).unwrap(), 1);
    }

    #[test]
    fn messages_come_back_in_insert_order() {
        let db = Database::open_in_memory().unwrap();
        let (a, b) = (id(), id());
        let conv = conversation(&db, &a, &b);
        for i in 0..5 {
            db.insert_message(&id(), &conv.id, &a, &format!("m{}", i), "text", None, None)
                .unwrap();
        }

        let contents: Vec<String> = db
            .list_messages(&conv.id)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(db.last_message(&conv.id).unwrap().unwrap().content, "m4");
    }

    #[test]
    fn profiles_persist_on_disk() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let pid = id();
        {
            let db = Database::open(file.path()).unwrap();
            db.upsert_profile(&ProfileRow {
                id: pid.clone(),
                display_name: Some("Mira".into()),
                full_name: None,
                email: Some("mira@example.com".into()),
                avatar_url: None,
            })
            .unwrap();
        }

        let db = Database::open(file.path()).unwrap();
        let profile = db.get_profile(&pid).unwrap().unwrap();
        assert_eq!(profile.display_name.as_deref(), Some("Mira"));
        assert!(db.get_profile(&id()).unwrap().is_none());
    }
}
