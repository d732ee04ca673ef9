use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS profiles (
            id              TEXT PRIMARY KEY,
            display_name    TEXT,
            full_name       TEXT,
            email           TEXT,
            avatar_url      TEXT
        );

        -- Participants are stored ordered (participant_1_id < participant_2_id)
        -- so the UNIQUE constraint covers the unordered pair.
        CREATE TABLE IF NOT EXISTS conversations (
            id                  TEXT PRIMARY KEY,
            participant_1_id    TEXT NOT NULL,
            participant_2_id    TEXT NOT NULL,
            last_message_at     TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL,
            UNIQUE(participant_1_id, participant_2_id)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_p1
            ON conversations(participant_1_id);
        CREATE INDEX IF NOT EXISTS idx_conversations_p2
            ON conversations(participant_2_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL,
            content         TEXT NOT NULL DEFAULT '',
            message_type    TEXT NOT NULL DEFAULT 'text',
            file_url        TEXT,
            file_name       TEXT,
            is_read         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
