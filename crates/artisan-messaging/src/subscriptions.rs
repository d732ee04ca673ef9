//! Realtime channel lifecycle.
//!
//! Each logical channel moves `Idle -> Subscribing -> Active -> Error | Closed`.
//! Opening a channel first tears down every registered channel whose key
//! overlaps it, waiting for the gateway to acknowledge each teardown, so
//! repeated mount/unmount cycles never leave duplicate deliveries behind.
//! Channel errors are logged and left alone; the owner's next mount is the
//! recovery path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use artisan_types::events::{ChangeKind, ChannelFilter, ChannelSignal, RealtimeEvent, Row};
use artisan_types::gateway::{Gateway, GatewayResult, SubscriptionId};
use artisan_types::models::{ConversationId, ConversationRow, IdentityId, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    /// Conversation-list watch: every change to a conversation row the
    /// identity takes part in. New messages arrive as row updates.
    ConversationList(IdentityId),
    /// Conversations created with the identity, by either side.
    Membership(IdentityId),
    /// The open conversation view. At most one per manager.
    Detail(ConversationId),
    /// Global notifier feed for one of the identity's conversations.
    Inbox {
        identity: IdentityId,
        conversation: ConversationId,
    },
}

impl ChannelKey {
    /// Whether opening `self` must first tear down `other`.
    pub fn overlaps(&self, other: &ChannelKey) -> bool {
        match (self, other) {
            (Self::Detail(_), Self::Detail(_)) => true,
            (a, b) => a == b,
        }
    }

    fn filter(&self) -> ChannelFilter {
        match *self {
            Self::ConversationList(identity) => ChannelFilter::conversations().involving(identity),
            Self::Membership(identity) => ChannelFilter::conversations()
                .only(ChangeKind::Insert)
                .involving(identity),
            Self::Detail(conversation) => ChannelFilter::messages().in_conversation(conversation).with_typing(),
            Self::Inbox { conversation, .. } => ChannelFilter::messages()
                .only(ChangeKind::Insert)
                .in_conversation(conversation),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConversationList(identity) => write!(f, "conversations:{}", identity),
            Self::Membership(identity) => write!(f, "membership:{}", identity),
            Self::Detail(conversation) => write!(f, "detail:{}", conversation),
            Self::Inbox { identity, conversation } => write!(f, "inbox:{}/{}", identity, conversation),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Subscribing,
    Active,
    Error(String),
    Closed,
}

/// An event routed to a channel's consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    MessageInserted(Message),
    MessageUpdated(Message),
    Typing {
        conversation_id: ConversationId,
        identity_id: IdentityId,
    },
    ConversationChanged(ConversationRow),
}

/// Decide whether `event` reaches the consumer of `key`, as seen by `me`.
pub fn route(key: &ChannelKey, me: IdentityId, event: RealtimeEvent) -> Option<ChannelEvent> {
    match (key, event) {
        (
            ChannelKey::Detail(open),
            RealtimeEvent::RowChange {
                kind,
                row: Row::Message(message),
            },
        ) if message.conversation_id == *open => Some(match kind {
            ChangeKind::Insert => ChannelEvent::MessageInserted(message),
            ChangeKind::Update => ChannelEvent::MessageUpdated(message),
        }),
        (
            ChannelKey::Detail(open),
            RealtimeEvent::Typing {
                conversation_id,
                identity_id,
            },
        ) if conversation_id == *open && identity_id != me => Some(ChannelEvent::Typing {
            conversation_id,
            identity_id,
        }),
        // Own messages never produce a notification
        (
            ChannelKey::Inbox { conversation, .. },
            RealtimeEvent::RowChange {
                kind: ChangeKind::Insert,
                row: Row::Message(message),
            },
        ) if message.conversation_id == *conversation && message.sender_id != me => {
            Some(ChannelEvent::MessageInserted(message))
        }
        (
            ChannelKey::ConversationList(owner),
            RealtimeEvent::RowChange {
                row: Row::Conversation(row),
                ..
            },
        ) if row.involves(*owner) => Some(ChannelEvent::ConversationChanged(row)),
        (
            ChannelKey::Membership(owner),
            RealtimeEvent::RowChange {
                kind: ChangeKind::Insert,
                row: Row::Conversation(row),
            },
        ) if row.involves(*owner) => Some(ChannelEvent::ConversationChanged(row)),
        _ => None,
    }
}

struct ChannelHandle {
    subscription: SubscriptionId,
    state: Arc<watch::Sender<ChannelState>>,
    pump: JoinHandle<()>,
}

/// Owns every realtime channel opened for one identity.
pub struct SubscriptionManager {
    gateway: Arc<dyn Gateway>,
    identity: IdentityId,
    teardown_timeout: Duration,
    channels: Mutex<HashMap<ChannelKey, ChannelHandle>>,
}

impl SubscriptionManager {
    pub fn new(gateway: Arc<dyn Gateway>, identity: IdentityId, teardown_timeout: Duration) -> Self {
        Self {
            gateway,
            identity,
            teardown_timeout,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Open the channel for `key`, routing its events into `sink`. Any
    /// overlapping channel is released first. Returns the subscription id,
    /// which the owner passes back to [`Self::release`].
    pub async fn subscribe(
        &self,
        key: ChannelKey,
        sink: mpsc::UnboundedSender<ChannelEvent>,
    ) -> GatewayResult<SubscriptionId> {
        // Held for the whole open so overlapping subscribes run one at a time
        let mut channels = self.channels.lock().await;

        let stale: Vec<ChannelKey> = channels.keys().filter(|k| key.overlaps(k)).copied().collect();
        for stale_key in stale {
            if let Some(handle) = channels.remove(&stale_key) {
                debug!("Replacing channel {} with {}", stale_key, key);
                self.teardown(stale_key, handle).await;
            }
        }

        let (state, _) = watch::channel(ChannelState::Idle);
        let state = Arc::new(state);
        state.send_replace(ChannelState::Subscribing);

        let subscription = match self.gateway.subscribe(key.filter()).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Subscribing {} failed: {}", key, e);
                return Err(e);
            }
        };

        let id = subscription.id;
        let pump = tokio::spawn(pump(key, self.identity, subscription.signals, state.clone(), sink));
        channels.insert(
            key,
            ChannelHandle {
                subscription: id,
                state,
                pump,
            },
        );
        info!("Channel {} subscribing ({})", key, id);
        Ok(id)
    }

    /// Close the channel for `key`. Returns whether one was registered.
    pub async fn unsubscribe(&self, key: ChannelKey) -> bool {
        let handle = self.channels.lock().await.remove(&key);
        match handle {
            Some(handle) => {
                self.teardown(key, handle).await;
                true
            }
            None => false,
        }
    }

    /// Close the channel for `key` only if it is still the one opened as
    /// `subscription`. A newer owner of the same key is left untouched.
    pub async fn release(&self, key: ChannelKey, subscription: SubscriptionId) -> bool {
        let handle = {
            let mut channels = self.channels.lock().await;
            match channels.get(&key) {
                Some(handle) if handle.subscription == subscription => channels.remove(&key),
                _ => None,
            }
        };
        match handle {
            Some(handle) => {
                self.teardown(key, handle).await;
                true
            }
            None => false,
        }
    }

    pub async fn unsubscribe_all(&self) {
        let drained: Vec<(ChannelKey, ChannelHandle)> = self.channels.lock().await.drain().collect();
        let count = drained.len();
        for (key, handle) in drained {
            self.teardown(key, handle).await;
        }
        if count > 0 {
            info!("Closed {} channels for {}", count, self.identity);
        }
    }

    pub async fn state(&self, key: &ChannelKey) -> Option<ChannelState> {
        self.channels
            .lock()
            .await
            .get(key)
            .map(|handle| handle.state.borrow().clone())
    }

    /// Keys of every registered channel, whatever its state.
    pub async fn keys(&self) -> Vec<ChannelKey> {
        self.channels.lock().await.keys().copied().collect()
    }

    async fn teardown(&self, key: ChannelKey, handle: ChannelHandle) {
        let ack = tokio::time::timeout(self.teardown_timeout, self.gateway.unsubscribe(handle.subscription)).await;
        match ack {
            Ok(Ok(())) => debug!("Channel {} released", key),
            Ok(Err(e)) => warn!("Releasing channel {} failed: {}", key, e),
            Err(_) => warn!(
                "Channel {} teardown not acknowledged within {:?}, proceeding",
                key, self.teardown_timeout
            ),
        }
        handle.pump.abort();
        handle.state.send_replace(ChannelState::Closed);
    }
}

/// Forward one channel's signals, in delivery order, to its consumer.
async fn pump(
    key: ChannelKey,
    me: IdentityId,
    mut signals: mpsc::UnboundedReceiver<ChannelSignal>,
    state: Arc<watch::Sender<ChannelState>>,
    sink: mpsc::UnboundedSender<ChannelEvent>,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            ChannelSignal::Subscribed => {
                state.send_replace(ChannelState::Active);
                debug!("Channel {} active", key);
            }
            ChannelSignal::Event(event) => {
                let Some(event) = route(&key, me, event) else {
                    continue;
                };
                if sink.send(event).is_err() {
                    debug!("Consumer of channel {} is gone", key);
                    break;
                }
            }
            ChannelSignal::Error(reason) => {
                warn!("Channel {} error: {}", key, reason);
                state.send_replace(ChannelState::Error(reason));
                return;
            }
        }
    }

    state.send_replace(ChannelState::Closed);
}
