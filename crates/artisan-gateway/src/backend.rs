use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};
use uuid::Uuid;

use artisan_db::Database;
use artisan_db::models::CreateConversation;
use artisan_types::events::{ChangeKind, ChannelFilter, RealtimeEvent, Row};
use artisan_types::gateway::{Gateway, GatewayError, GatewayResult, GatewaySubscription, SubscriptionId};
use artisan_types::models::{ConversationId, ConversationRow, IdentityId, Message, NewMessage, Profile};

use crate::convert;
use crate::dispatcher::Dispatcher;

/// SQLite tables plus realtime change feeds. Every write publishes the
/// affected rows to the dispatcher after it commits.
#[derive(Clone)]
pub struct Backend {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl Backend {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            dispatcher: Dispatcher::new(),
        }
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Profiles are owned by the profile-editing surface; this exists for
    /// seeding and tests.
    pub async fn upsert_profile(&self, profile: Profile) -> GatewayResult<()> {
        let row = convert::profile_row(&profile);
        self.blocking(move |db| db.upsert_profile(&row)).await
    }

    /// Run a DB call off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> GatewayResult<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                GatewayError::Backend(e.to_string())
            })?
            .map_err(|e| GatewayError::Backend(format!("{:#}", e)))
    }
}

/// Writes into a conversation are limited to its two participants. The
/// outer error is a DB failure, the inner one the refusal.
fn participant_check(db: &Database, conversation: &str, identity: &str) -> anyhow::Result<GatewayResult<()>> {
    Ok(match db.get_conversation(conversation)? {
        None => Err(GatewayError::NotFound(format!("conversation {}", conversation))),
        Some(record) if record.participant_1_id == identity || record.participant_2_id == identity => Ok(()),
        Some(_) => {
            debug!("{} is not a participant of {}", identity, conversation);
            Err(GatewayError::Forbidden(format!(
                "{} is not a participant of conversation {}",
                identity, conversation
            )))
        }
    })
}

#[async_trait]
impl Gateway for Backend {
    async fn list_conversations(&self, identity: IdentityId) -> GatewayResult<Vec<ConversationRow>> {
        let identity = identity.to_string();
        self.blocking(move |db| {
            db.list_conversations(&identity)?
                .into_iter()
                .map(convert::conversation)
                .collect()
        })
        .await
    }

    async fn get_conversation(&self, id: ConversationId) -> GatewayResult<Option<ConversationRow>> {
        let id = id.to_string();
        self.blocking(move |db| db.get_conversation(&id)?.map(convert::conversation).transpose())
            .await
    }

    async fn find_conversation_between(
        &self,
        a: IdentityId,
        b: IdentityId,
    ) -> GatewayResult<Option<ConversationRow>> {
        let (a, b) = (a.to_string(), b.to_string());
        self.blocking(move |db| {
            db.find_conversation_between(&a, &b)?
                .map(convert::conversation)
                .transpose()
        })
        .await
    }

    async fn insert_conversation(&self, a: IdentityId, b: IdentityId) -> GatewayResult<ConversationRow> {
        let id = ConversationId::new().to_string();
        let (a_str, b_str) = (a.to_string(), b.to_string());
        let outcome = self
            .blocking(move |db| match db.create_conversation(&id, &a_str, &b_str)? {
                CreateConversation::Created(record) => convert::conversation(record).map(Some),
                CreateConversation::Duplicate => Ok(None),
            })
            .await?;

        let Some(row) = outcome else {
            debug!("Conversation between {} and {} already exists", a, b);
            return Err(GatewayError::Conflict(format!(
                "conversation between {} and {} already exists",
                a, b
            )));
        };

        self.dispatcher.publish(RealtimeEvent::RowChange {
            kind: ChangeKind::Insert,
            row: Row::Conversation(row.clone()),
        });
        Ok(row)
    }

    async fn get_profile(&self, id: IdentityId) -> GatewayResult<Option<Profile>> {
        let id = id.to_string();
        self.blocking(move |db| db.get_profile(&id)?.map(convert::profile).transpose())
            .await
    }

    async fn last_message(&self, conversation_id: ConversationId) -> GatewayResult<Option<Message>> {
        let id = conversation_id.to_string();
        self.blocking(move |db| db.last_message(&id)?.map(convert::message).transpose())
            .await
    }

    async fn count_unread(&self, conversation_id: ConversationId, reader: IdentityId) -> GatewayResult<u32> {
        let (id, reader) = (conversation_id.to_string(), reader.to_string());
        self.blocking(move |db| db.count_unread(&id, &reader)).await
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> GatewayResult<Vec<Message>> {
        let id = conversation_id.to_string();
        self.blocking(move |db| {
            db.list_messages(&id)?
                .into_iter()
                .map(convert::message)
                .collect()
        })
        .await
    }

    async fn insert_message(&self, message: NewMessage) -> GatewayResult<Message> {
        let id = Uuid::new_v4().to_string();
        let (stored, conversation) = self
            .blocking(move |db| {
                if let Err(denied) = participant_check(
                    db,
                    &message.conversation_id.to_string(),
                    &message.sender_id.to_string(),
                )? {
                    return Ok(Err(denied));
                }
                let (record, conversation) = db.insert_message(
                    &id,
                    &message.conversation_id.to_string(),
                    &message.sender_id.to_string(),
                    &message.content,
                    message.message_type.as_str(),
                    message.file_url.as_deref(),
                    message.file_name.as_deref(),
                )?;
                Ok(Ok((convert::message(record)?, convert::conversation(conversation)?)))
            })
            .await??;

        self.dispatcher.publish(RealtimeEvent::RowChange {
            kind: ChangeKind::Insert,
            row: Row::Message(stored.clone()),
        });
        self.dispatcher.publish(RealtimeEvent::RowChange {
            kind: ChangeKind::Update,
            row: Row::Conversation(conversation),
        });
        Ok(stored)
    }

    async fn mark_read(&self, conversation_id: ConversationId, reader: IdentityId) -> GatewayResult<u32> {
        let (id, reader) = (conversation_id.to_string(), reader.to_string());
        let changed = self
            .blocking(move |db| {
                if let Err(denied) = participant_check(db, &id, &reader)? {
                    return Ok(Err(denied));
                }
                db.mark_read(&id, &reader)?
                    .into_iter()
                    .map(convert::message)
                    .collect::<anyhow::Result<Vec<_>>>()
                    .map(Ok)
            })
            .await??;

        let count = changed.len() as u32;
        for message in changed {
            self.dispatcher.publish(RealtimeEvent::RowChange {
                kind: ChangeKind::Update,
                row: Row::Message(message),
            });
        }
        Ok(count)
    }

    async fn publish_typing(&self, conversation_id: ConversationId, identity: IdentityId) -> GatewayResult<()> {
        let (id, typist) = (conversation_id.to_string(), identity.to_string());
        self.blocking(move |db| participant_check(db, &id, &typist)).await??;
        self.dispatcher.publish(RealtimeEvent::Typing {
            conversation_id,
            identity_id: identity,
        });
        Ok(())
    }

    async fn subscribe(&self, filter: ChannelFilter) -> GatewayResult<GatewaySubscription> {
        Ok(self.dispatcher.open(filter).await)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> GatewayResult<()> {
        self.dispatcher.close(id).await;
        Ok(())
    }
}
