//! One open conversation: its ordered history plus whatever arrives live.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use artisan_types::gateway::SubscriptionId;
use artisan_types::models::{Conversation, ConversationId, IdentityId, Message, MessageId, Profile};

use crate::context::MessagingContext;
use crate::error::{MessagingError, Result};
use crate::read_state::ReadStateTracker;
use crate::retry::with_network_retry;
use crate::subscriptions::{ChannelEvent, ChannelKey};
use crate::timeline::{MessageTimeline, TimelineEntry};

/// A conversation and its messages at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSnapshot {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

type TypingMap = Arc<Mutex<HashMap<IdentityId, Instant>>>;

pub struct ConversationSession {
    ctx: Arc<MessagingContext>,
    conversation: Conversation,
    local: bool,
    timeline: Arc<Mutex<MessageTimeline>>,
    typing: TypingMap,
    subscription: Mutex<Option<SubscriptionId>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConversationSession {
    /// Prepare, attach and load in one go.
    pub async fn load(ctx: Arc<MessagingContext>, id: ConversationId) -> Result<Self> {
        let session = Self::prepare(ctx, id).await?;
        if let Err(e) = session.attach().await {
            warn!("Conversation {} opened without live updates: {}", id, e);
        }
        if let Err(e) = session.load_history().await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Resolve the conversation row and the other participant's profile.
    /// The timeline starts empty; see [`Self::load_history`].
    pub async fn prepare(ctx: Arc<MessagingContext>, id: ConversationId) -> Result<Self> {
        if let Some(conversation) = ctx.local_conversation(id).await {
            debug!("Opening local conversation {}", id);
            return Ok(Self::new(ctx, conversation, true));
        }

        let me = ctx.identity();
        let config = ctx.config().clone();
        let gateway = ctx.gateway().clone();

        let row = with_network_retry(&config, "load conversation", || gateway.get_conversation(id))
            .await?
            .ok_or(MessagingError::ConversationNotFound(id))?;
        let other = row.other_participant(me).ok_or(MessagingError::NotParticipant {
            conversation: id,
            identity: me,
        })?;

        let profile = match timeout(config.enrichment_timeout, gateway.get_profile(other)).await {
            Ok(Ok(Some(profile))) => profile,
            Ok(Ok(None)) => Profile::placeholder(other),
            Ok(Err(e)) => {
                warn!("Profile lookup for {} failed: {}", other, e);
                Profile::placeholder(other)
            }
            Err(_) => {
                warn!("Profile lookup for {} timed out", other);
                Profile::placeholder(other)
            }
        };

        Ok(Self::new(ctx, Conversation::from_row(&row, profile, None, 0), false))
    }

    fn new(ctx: Arc<MessagingContext>, conversation: Conversation, local: bool) -> Self {
        Self {
            ctx,
            conversation,
            local,
            timeline: Arc::new(Mutex::new(MessageTimeline::new())),
            typing: Arc::new(Mutex::new(HashMap::new())),
            subscription: Mutex::new(None),
            pump: Mutex::new(None),
        }
    }

    /// Fetch the full history and merge it into the timeline. Messages that
    /// arrived live in the meantime are kept; duplicates collapse.
    pub async fn load_history(&self) -> Result<usize> {
        if self.local {
            return Ok(0);
        }
        let id = self.id();
        let config = self.ctx.config();
        let gateway = self.ctx.gateway();
        let history = with_network_retry(config, "load messages", || gateway.list_messages(id)).await?;

        let mut timeline = self.timeline.lock().await;
        let fetched = history.len();
        for message in history {
            timeline.append(message);
        }
        debug!("Loaded {} messages for {} ({} shown)", fetched, id, timeline.len());
        Ok(timeline.len())
    }

    /// Open the detail channel and start applying its events. Local
    /// conversations only listen for local echoes.
    pub async fn attach(&self) -> Result<()> {
        let id = self.id();
        let echo = self.ctx.local_echo();

        let events = if self.local {
            None
        } else {
            let (sink, events) = mpsc::unbounded_channel();
            let subscription = self.ctx.subscriptions().subscribe(ChannelKey::Detail(id), sink).await?;
            *self.subscription.lock().await = Some(subscription);
            Some(events)
        };

        let pump = tokio::spawn(apply_events(
            self.ctx.clone(),
            id,
            self.timeline.clone(),
            self.typing.clone(),
            events,
            echo,
        ));
        if let Some(previous) = self.pump.lock().await.replace(pump) {
            previous.abort();
        }
        info!("Conversation {} attached", id);
        Ok(())
    }

    /// Release the detail channel (if this session still owns it) and stop
    /// applying events.
    pub async fn close(&self) {
        if let Some(subscription) = self.subscription.lock().await.take() {
            self.ctx
                .subscriptions()
                .release(ChannelKey::Detail(self.id()), subscription)
                .await;
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        debug!("Conversation {} closed", self.id());
    }

    pub fn id(&self) -> ConversationId {
        self.conversation.id
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Append unless a message with the same id is already present.
    pub async fn append(&self, message: Message) -> bool {
        self.timeline.lock().await.append(message)
    }

    pub async fn contains(&self, id: &MessageId) -> bool {
        self.timeline.lock().await.contains(id)
    }

    pub(crate) async fn confirm(&self, local_id: MessageId, confirmed: Message) -> bool {
        self.timeline.lock().await.confirm(local_id, confirmed)
    }

    pub(crate) async fn fail(&self, local_id: MessageId, reason: String) -> bool {
        self.timeline.lock().await.fail(local_id, reason)
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.timeline.lock().await.messages()
    }

    pub async fn entries(&self) -> Vec<TimelineEntry> {
        self.timeline.lock().await.entries().to_vec()
    }

    /// Reflect a completed mark-read in the loaded history.
    pub async fn mark_inbound_read(&self) -> usize {
        self.timeline.lock().await.mark_read_by(self.ctx.identity())
    }

    /// Other participants seen typing within the typing TTL.
    pub async fn typing_participants(&self) -> Vec<IdentityId> {
        let ttl = self.ctx.config().typing_ttl;
        let mut typing = self.typing.lock().await;
        typing.retain(|_, seen| seen.elapsed() < ttl);
        typing.keys().copied().collect()
    }

    /// The conversation with its last-message and unread projections taken
    /// from the timeline.
    pub async fn snapshot(&self) -> ConversationSnapshot {
        let me = self.ctx.identity();
        let timeline = self.timeline.lock().await;
        let messages = timeline.messages();

        let mut conversation = self.conversation.clone();
        if let Some(last) = timeline.last() {
            conversation.last_message_at = Some(last.created_at);
            conversation.last_message_preview = Some(last.preview());
            conversation.last_message = Some(last.clone());
        }
        conversation.unread_count = messages.iter().filter(|m| m.sender_id != me && !m.is_read).count() as u32;

        ConversationSnapshot { conversation, messages }
    }
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<ChannelEvent>>) -> Option<ChannelEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn apply_events(
    ctx: Arc<MessagingContext>,
    id: ConversationId,
    timeline: Arc<Mutex<MessageTimeline>>,
    typing: TypingMap,
    mut events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    mut echo: broadcast::Receiver<Message>,
) {
    let me = ctx.identity();
    loop {
        tokio::select! {
            event = next_event(&mut events) => {
                let Some(event) = event else {
                    debug!("Detail channel for {} ended", id);
                    break;
                };
                match event {
                    ChannelEvent::MessageInserted(message) => {
                        let sender = message.sender_id;
                        let inbound = sender != me && !message.is_read;
                        let appended = timeline.lock().await.append(message);
                        typing.lock().await.remove(&sender);
                        if appended && inbound {
                            let tracker = ReadStateTracker::new(ctx.clone());
                            tokio::spawn(async move {
                                if let Err(e) = tracker.mark_conversation_read(id).await {
                                    warn!("Marking {} read failed: {}", id, e);
                                }
                            });
                        }
                    }
                    ChannelEvent::MessageUpdated(message) => {
                        timeline.lock().await.apply_update(&message);
                    }
                    ChannelEvent::Typing { identity_id, .. } => {
                        typing.lock().await.insert(identity_id, Instant::now());
                    }
                    ChannelEvent::ConversationChanged(_) => {}
                }
            }
            echoed = echo.recv() => {
                match echoed {
                    Ok(message) if message.conversation_id == id => {
                        timeline.lock().await.append(message);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!("Local echo for {} lagged by {}", id, skipped),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}
