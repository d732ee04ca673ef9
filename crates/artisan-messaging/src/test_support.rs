//! Gateway wrapper with failure injection for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;

use artisan_gateway::Backend;
use artisan_types::events::{ChannelFilter, ChannelSignal};
use artisan_types::gateway::{Gateway, GatewayError, GatewayResult, GatewaySubscription, SubscriptionId};
use artisan_types::models::{
    ConversationId, ConversationRow, IdentityId, Message, MessageId, MessageType, NewMessage, Profile,
};

use crate::config::MessagingConfig;
use crate::context::MessagingContext;

/// Poll `$cond` (which may `.await`) until it holds, failing after ~1s.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..200 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(held, "condition never held: {}", stringify!($cond));
    }};
}

/// Millisecond budgets so failure paths finish quickly.
pub fn fast_config() -> MessagingConfig {
    MessagingConfig {
        enrichment_timeout: Duration::from_millis(50),
        max_retries: 2,
        initial_backoff: Duration::from_millis(5),
        teardown_timeout: Duration::from_millis(100),
        side_effect_timeout: Duration::from_millis(50),
        typing_ttl: Duration::from_millis(300),
    }
}

pub fn context(gateway: Arc<dyn Gateway>, identity: IdentityId) -> Arc<MessagingContext> {
    Arc::new(MessagingContext::new(gateway, identity, fast_config()))
}

/// A backend with two named profiles and a conversation between them.
pub async fn seeded() -> (Backend, IdentityId, IdentityId, ConversationId) {
    let backend = Backend::in_memory().unwrap();
    let (alice, bob) = (IdentityId::new(), IdentityId::new());
    backend.upsert_profile(profile(alice, "Alice")).await.unwrap();
    backend.upsert_profile(profile(bob, "Bob")).await.unwrap();
    let conversation = backend.insert_conversation(alice, bob).await.unwrap();
    (backend, alice, bob, conversation.id)
}

pub fn message_from(conversation_id: ConversationId, sender_id: IdentityId, content: &str) -> Message {
    Message {
        id: MessageId::Server(uuid::Uuid::new_v4()),
        conversation_id,
        sender_id,
        content: content.to_string(),
        message_type: MessageType::Text,
        file_url: None,
        file_name: None,
        is_read: false,
        created_at: Utc::now(),
    }
}

pub fn new_text(conversation_id: ConversationId, sender_id: IdentityId, content: &str) -> NewMessage {
    NewMessage {
        conversation_id,
        sender_id,
        content: content.to_string(),
        message_type: MessageType::Text,
        file_url: None,
        file_name: None,
    }
}

pub fn profile(id: IdentityId, name: &str) -> Profile {
    Profile {
        id,
        display_name: Some(name.to_string()),
        full_name: None,
        email: None,
        avatar_url: None,
    }
}

/// Delegates to a [`Backend`] unless told to fail, stall or break.
pub struct ScriptedGateway {
    inner: Backend,
    calls: Mutex<HashMap<&'static str, u32>>,
    network_failures: Mutex<HashMap<&'static str, u32>>,
    persistent_failures: Mutex<HashMap<&'static str, GatewayError>>,
    stalled: Mutex<HashSet<&'static str>>,
    injectors: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<ChannelSignal>>>,
    hang_unsubscribe: AtomicBool,
    missed_lookups: AtomicU32,
    subscribes: AtomicU32,
}

impl ScriptedGateway {
    pub fn new(inner: Backend) -> Self {
        Self {
            inner,
            calls: Mutex::new(HashMap::new()),
            network_failures: Mutex::new(HashMap::new()),
            persistent_failures: Mutex::new(HashMap::new()),
            stalled: Mutex::new(HashSet::new()),
            injectors: Mutex::new(HashMap::new()),
            hang_unsubscribe: AtomicBool::new(false),
            missed_lookups: AtomicU32::new(0),
            subscribes: AtomicU32::new(0),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.inner
    }

    /// The next `times` calls to `op` fail with a network error.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.network_failures.lock().unwrap().insert(op, times);
    }

    /// Every call to `op` fails with `error`.
    pub fn fail_always(&self, op: &'static str, error: GatewayError) {
        self.persistent_failures.lock().unwrap().insert(op, error);
    }

    /// Calls to `op` never resolve.
    pub fn stall(&self, op: &'static str) {
        self.stalled.lock().unwrap().insert(op);
    }

    /// The next `times` pair lookups report no conversation.
    pub fn miss_lookups(&self, times: u32) {
        self.missed_lookups.store(times, Ordering::SeqCst);
    }

    pub fn hang_unsubscribe(&self, hang: bool) {
        self.hang_unsubscribe.store(hang, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn calls_of(&self, op: &'static str) -> u32 {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Deliver a channel-level error on every open subscription.
    pub async fn break_channels(&self, reason: &str) {
        for tx in self.injectors.lock().unwrap().values() {
            let _ = tx.send(ChannelSignal::Error(reason.to_string()));
        }
    }

    async fn enter(&self, op: &'static str) -> GatewayResult<()> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;

        if self.stalled.lock().unwrap().contains(op) {
            std::future::pending::<()>().await;
        }
        if let Some(error) = self.persistent_failures.lock().unwrap().get(op) {
            return Err(error.clone());
        }
        let mut failures = self.network_failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(GatewayError::Network(format!("{} unreachable", op)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn list_conversations(&self, identity: IdentityId) -> GatewayResult<Vec<ConversationRow>> {
        self.enter("list_conversations").await?;
        self.inner.list_conversations(identity).await
    }

    async fn get_conversation(&self, id: ConversationId) -> GatewayResult<Option<ConversationRow>> {
        self.enter("get_conversation").await?;
        self.inner.get_conversation(id).await
    }

    async fn find_conversation_between(
        &self,
        a: IdentityId,
        b: IdentityId,
    ) -> GatewayResult<Option<ConversationRow>> {
        self.enter("find_conversation_between").await?;
        let missed = self
            .missed_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if missed.is_ok() {
            return Ok(None);
        }
        self.inner.find_conversation_between(a, b).await
    }

    async fn insert_conversation(&self, a: IdentityId, b: IdentityId) -> GatewayResult<ConversationRow> {
        self.enter("insert_conversation").await?;
        self.inner.insert_conversation(a, b).await
    }

    async fn get_profile(&self, id: IdentityId) -> GatewayResult<Option<Profile>> {
        self.enter("get_profile").await?;
        self.inner.get_profile(id).await
    }

    async fn last_message(&self, conversation_id: ConversationId) -> GatewayResult<Option<Message>> {
        self.enter("last_message").await?;
        self.inner.last_message(conversation_id).await
    }

    async fn count_unread(&self, conversation_id: ConversationId, reader: IdentityId) -> GatewayResult<u32> {
        self.enter("count_unread").await?;
        self.inner.count_unread(conversation_id, reader).await
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> GatewayResult<Vec<Message>> {
        self.enter("list_messages").await?;
        self.inner.list_messages(conversation_id).await
    }

    async fn insert_message(&self, message: NewMessage) -> GatewayResult<Message> {
        self.enter("insert_message").await?;
        self.inner.insert_message(message).await
    }

    async fn mark_read(&self, conversation_id: ConversationId, reader: IdentityId) -> GatewayResult<u32> {
        self.enter("mark_read").await?;
        self.inner.mark_read(conversation_id, reader).await
    }

    async fn publish_typing(&self, conversation_id: ConversationId, identity: IdentityId) -> GatewayResult<()> {
        self.enter("publish_typing").await?;
        self.inner.publish_typing(conversation_id, identity).await
    }

    async fn subscribe(&self, filter: ChannelFilter) -> GatewayResult<GatewaySubscription> {
        self.enter("subscribe").await?;
        self.subscribes.fetch_add(1, Ordering::SeqCst);

        let mut upstream = self.inner.subscribe(filter).await?;
        let (tx, signals) = mpsc::unbounded_channel();
        let forward = tx.clone();
        tokio::spawn(async move {
            while let Some(signal) = upstream.signals.recv().await {
                if forward.send(signal).is_err() {
                    break;
                }
            }
        });
        self.injectors.lock().unwrap().insert(upstream.id, tx);

        Ok(GatewaySubscription {
            id: upstream.id,
            signals,
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> GatewayResult<()> {
        self.enter("unsubscribe").await?;
        if self.hang_unsubscribe.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.injectors.lock().unwrap().remove(&id);
        self.inner.unsubscribe(id).await
    }
}
