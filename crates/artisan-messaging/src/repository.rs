//! The signed-in identity's conversation list.

use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use artisan_types::gateway::{GatewayError, GatewayResult};
use artisan_types::models::{Conversation, ConversationId, ConversationRow, IdentityId, Profile};

use crate::context::MessagingContext;
use crate::error::{MessagingError, Result};
use crate::retry::with_network_retry;
use crate::subscriptions::ChannelKey;

#[derive(Clone)]
pub struct ConversationRepository {
    ctx: Arc<MessagingContext>,
}

impl ConversationRepository {
    pub fn new(ctx: Arc<MessagingContext>) -> Self {
        Self { ctx }
    }

    /// Load and enrich every conversation the identity takes part in, most
    /// recent activity first. Never fails: a list query that is still
    /// failing after retries yields an empty list.
    pub async fn load_conversations(&self) -> Vec<Conversation> {
        let me = self.ctx.identity();
        let gateway = self.ctx.gateway();
        let rows = match with_network_retry(self.ctx.config(), "list conversations", || {
            gateway.list_conversations(me)
        })
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Conversation list for {} unavailable: {}", me, e);
                return Vec::new();
            }
        };

        let enriched = join_all(rows.into_iter().map(|row| self.enrich(row))).await;
        let mut conversations: Vec<Conversation> = enriched.into_iter().flatten().collect();
        conversations.sort_by(by_recent_activity);

        if self.ctx.is_signed_out() {
            return Vec::new();
        }
        self.ctx.replace_conversations(conversations).await;
        self.ctx.conversations().await
    }

    /// Attach profile, last message and unread count. Each lookup runs
    /// concurrently under its own timeout and falls back to a default.
    async fn enrich(&self, row: ConversationRow) -> Option<Conversation> {
        let me = self.ctx.identity();
        let Some(other) = row.other_participant(me) else {
            warn!("Skipping conversation {}: {} is not a participant", row.id, me);
            return None;
        };

        let gateway = self.ctx.gateway();
        let budget = self.ctx.config().enrichment_timeout;
        let (profile, last_message, unread) = tokio::join!(
            bounded(budget, "profile", row.id, gateway.get_profile(other)),
            bounded(budget, "last message", row.id, gateway.last_message(row.id)),
            bounded(budget, "unread count", row.id, gateway.count_unread(row.id, me)),
        );

        let profile = profile.flatten().unwrap_or_else(|| Profile::placeholder(other));
        Some(Conversation::from_row(
            &row,
            profile,
            last_message.flatten(),
            unread.unwrap_or(0),
        ))
    }

    /// The id of the conversation between the identity and `other`, creating
    /// it if needed. Safe under concurrent callers on either side: losing
    /// the create race resolves to the winner's row.
    pub async fn get_or_create_conversation(&self, other: IdentityId) -> Result<ConversationId> {
        let me = self.ctx.identity();
        if other == me {
            return Err(MessagingError::SelfConversation);
        }

        if let Some(existing) = self.find_between(other).await? {
            return Ok(existing);
        }

        match self.ctx.gateway().insert_conversation(me, other).await {
            Ok(row) => {
                info!("Created conversation {} between {} and {}", row.id, me, other);
                Ok(row.id)
            }
            Err(GatewayError::Conflict(reason)) => {
                debug!("Conversation with {} created concurrently ({}), re-reading", other, reason);
                self.find_between(other).await?.ok_or_else(|| {
                    MessagingError::Gateway(GatewayError::NotFound(format!(
                        "conversation between {} and {} vanished after conflict",
                        me, other
                    )))
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_between(&self, other: IdentityId) -> GatewayResult<Option<ConversationId>> {
        let me = self.ctx.identity();
        let gateway = self.ctx.gateway();
        let row = with_network_retry(self.ctx.config(), "find conversation", || {
            gateway.find_conversation_between(me, other)
        })
        .await?;
        Ok(row.map(|r| r.id))
    }

    /// Reload the list whenever a conversation the identity takes part in
    /// is created or changes (a new message bumps its row). Bursts are
    /// coalesced into one reload. The task ends when the channel is released.
    pub async fn watch(&self) -> Result<JoinHandle<()>> {
        let me = self.ctx.identity();
        let (sink, mut events) = mpsc::unbounded_channel();
        self.ctx
            .subscriptions()
            .subscribe(ChannelKey::ConversationList(me), sink)
            .await?;

        let repository = self.clone();
        Ok(tokio::spawn(async move {
            while events.recv().await.is_some() {
                let mut changed = 1;
                while events.try_recv().is_ok() {
                    changed += 1;
                }
                debug!("{} conversation changes for {}, reloading list", changed, me);
                repository.load_conversations().await;
            }
            debug!("Conversation list watch for {} ended", me);
        }))
    }
}

/// `last_message_at` descending, conversations without messages last.
fn by_recent_activity(a: &Conversation, b: &Conversation) -> Ordering {
    match (a.last_message_at, b.last_message_at) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.created_at.cmp(&a.created_at),
    }
}

async fn bounded<T>(
    budget: Duration,
    lookup: &str,
    conversation: ConversationId,
    fut: impl Future<Output = GatewayResult<T>>,
) -> Option<T> {
    match timeout(budget, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("{} lookup for {} failed: {}", lookup, conversation, e);
            None
        }
        Err(_) => {
            warn!("{} lookup for {} timed out after {:?}", lookup, conversation, budget);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedGateway, context, new_text, profile, seeded};
    use artisan_gateway::Backend;
    use artisan_types::gateway::Gateway;
    use artisan_types::models::UNKNOWN_USER;

    #[tokio::test]
    async fn list_is_enriched_and_ordered() {
        let (backend, alice, bob, with_bob) = seeded().await;
        let (carol, dave) = (IdentityId::new(), IdentityId::new());
        backend.upsert_profile(profile(carol, "Carol")).await.unwrap();
        let with_carol = backend.insert_conversation(alice, carol).await.unwrap().id;
        let empty = backend.insert_conversation(dave, alice).await.unwrap().id;

        backend.insert_message(new_text(with_carol, carol, "older")).await.unwrap();
        backend.insert_message(new_text(with_bob, bob, "newer")).await.unwrap();

        let ctx = context(Arc::new(backend), alice);
        let list = ConversationRepository::new(ctx.clone()).load_conversations().await;

        let ids: Vec<ConversationId> = list.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![with_bob, with_carol, empty]);
        assert_eq!(list[0].other_participant.display_label(), "Bob");
        assert_eq!(list[0].last_message_preview.as_deref(), Some("newer"));
        assert_eq!(list[0].unread_count, 1);
        assert_eq!(list[2].other_participant.display_label(), UNKNOWN_USER);
        assert!(list[2].last_message.is_none());
        assert_eq!(ctx.unread().get(), 2);
    }

    #[tokio::test]
    async fn failed_profile_lookup_keeps_the_conversation() {
        let (backend, alice, bob, conversation) = seeded().await;
        backend.insert_message(new_text(conversation, bob, "hey")).await.unwrap();
        let gateway = Arc::new(ScriptedGateway::new(backend));
        gateway.fail_always("get_profile", GatewayError::Backend("profiles offline".into()));

        let list = ConversationRepository::new(context(gateway, alice))
            .load_conversations()
            .await;

        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, conversation);
        assert_eq!(list[0].other_participant, Profile::placeholder(bob));
        assert_eq!(list[0].unread_count, 1);
    }

    #[tokio::test]
    async fn stalled_lookups_degrade_to_defaults() {
        let (backend, alice, bob, conversation) = seeded().await;
        backend.insert_message(new_text(conversation, bob, "hey")).await.unwrap();
        let gateway = Arc::new(ScriptedGateway::new(backend));
        gateway.stall("last_message");
        gateway.stall("count_unread");

        let list = ConversationRepository::new(context(gateway, alice))
            .load_conversations()
            .await;

        assert_eq!(list.len(), 1);
        assert_eq!(list[0].other_participant.display_label(), "Bob");
        assert!(list[0].last_message.is_none());
        assert_eq!(list[0].unread_count, 0);
    }

    #[tokio::test]
    async fn list_query_recovers_after_two_network_failures() {
        let (backend, alice, _bob, conversation) = seeded().await;
        let gateway = Arc::new(ScriptedGateway::new(backend));
        gateway.fail_next("list_conversations", 2);

        let list = ConversationRepository::new(context(gateway.clone(), alice))
            .load_conversations()
            .await;

        assert_eq!(gateway.calls_of("list_conversations"), 3);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, conversation);
    }

    #[tokio::test]
    async fn list_query_gives_up_with_empty_list() {
        let (backend, alice, _bob, _) = seeded().await;
        let gateway = Arc::new(ScriptedGateway::new(backend));
        gateway.fail_next("list_conversations", 5);

        let list = ConversationRepository::new(context(gateway.clone(), alice))
            .load_conversations()
            .await;

        assert!(list.is_empty());
        assert_eq!(gateway.calls_of("list_conversations"), 3);
    }

    #[tokio::test]
    async fn get_or_create_reuses_existing_pair() {
        let (backend, alice, bob, conversation) = seeded().await;
        let backend = Arc::new(backend);

        let from_alice = ConversationRepository::new(context(backend.clone(), alice));
        let from_bob = ConversationRepository::new(context(backend, bob));
        assert_eq!(from_alice.get_or_create_conversation(bob).await.unwrap(), conversation);
        assert_eq!(from_bob.get_or_create_conversation(alice).await.unwrap(), conversation);
    }

    #[tokio::test]
    async fn losing_the_create_race_returns_the_winner() {
        let (backend, alice, bob, winner) = seeded().await;
        let gateway = Arc::new(ScriptedGateway::new(backend));
        // the lookup misses as if the other side had not committed yet
        gateway.miss_lookups(1);

        let repository = ConversationRepository::new(context(gateway.clone(), alice));
        assert_eq!(repository.get_or_create_conversation(bob).await.unwrap(), winner);
        assert_eq!(gateway.calls_of("insert_conversation"), 1);
        assert_eq!(gateway.calls_of("find_conversation_between"), 2);
    }

    #[tokio::test]
    async fn self_conversation_is_rejected_without_gateway_calls() {
        let gateway = Arc::new(ScriptedGateway::new(Backend::in_memory().unwrap()));
        let me = IdentityId::new();
        let result = ConversationRepository::new(context(gateway.clone(), me))
            .get_or_create_conversation(me)
            .await;
        assert!(matches!(result, Err(MessagingError::SelfConversation)));
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn watch_reloads_on_new_messages() {
        let (backend, alice, bob, conversation) = seeded().await;
        let ctx = context(Arc::new(backend.clone()), alice);
        let repository = ConversationRepository::new(ctx.clone());
        let watch = repository.watch().await.unwrap();
        repository.load_conversations().await;
        assert_eq!(ctx.unread().get(), 0);

        backend.insert_message(new_text(conversation, bob, "ping")).await.unwrap();
        eventually!(ctx.unread().get() == 1);

        // traffic between strangers does not count
        let (x, y) = (IdentityId::new(), IdentityId::new());
        let elsewhere = backend.insert_conversation(x, y).await.unwrap().id;
        backend.insert_message(new_text(elsewhere, x, "not for alice")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.conversations().await.len(), 1);
        assert_eq!(ctx.unread().get(), 1);

        ctx.subscriptions().unsubscribe_all().await;
        watch.await.unwrap();
    }

    #[tokio::test]
    async fn watch_picks_up_conversations_started_by_the_other_side() {
        let (backend, alice, _bob, _) = seeded().await;
        let ctx = context(Arc::new(backend.clone()), alice);
        let repository = ConversationRepository::new(ctx.clone());
        let watch = repository.watch().await.unwrap();
        repository.load_conversations().await;
        assert_eq!(ctx.conversations().await.len(), 1);

        // no message yet, only the row
        let carol = IdentityId::new();
        let started = backend.insert_conversation(carol, alice).await.unwrap().id;
        eventually!(ctx.knows_conversation(started).await);
        assert_eq!(ctx.conversations().await.len(), 2);
        assert!(!ctx.knows_conversation(ConversationId::new()).await);

        ctx.subscriptions().unsubscribe_all().await;
        watch.await.unwrap();
    }
}
