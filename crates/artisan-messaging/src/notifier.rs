//! Process-wide new-message alerts, independent of the open conversation.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use artisan_types::events::Notification;
use artisan_types::models::{ConversationId, Message, MessageId};

use crate::context::MessagingContext;
use crate::retry::with_network_retry;
use crate::subscriptions::{ChannelEvent, ChannelKey};

/// Upper bound on remembered catch-up ids before they are forgotten.
const CAUGHT_UP_LIMIT: usize = 1024;

type Watched = Arc<Mutex<HashSet<ConversationId>>>;

/// Opens one inbox channel per conversation of the signed-in identity and
/// turns inbound inserts into [`Notification`]s. Own messages never alert.
///
/// A membership channel watches for conversations the other side starts, so
/// their first message alerts without a manual [`refresh`](Self::refresh).
pub struct GlobalNotifier {
    ctx: Arc<MessagingContext>,
    tx: broadcast::Sender<Notification>,
    sink: mpsc::UnboundedSender<ChannelEvent>,
    watched: Watched,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl GlobalNotifier {
    pub async fn start(ctx: Arc<MessagingContext>) -> Self {
        let (tx, _) = broadcast::channel(64);
        let (sink, events) = mpsc::unbounded_channel();
        let (membership_sink, membership) = mpsc::unbounded_channel();
        let watched: Watched = Arc::new(Mutex::new(HashSet::new()));

        let me = ctx.identity();
        if let Err(e) = ctx
            .subscriptions()
            .subscribe(ChannelKey::Membership(me), membership_sink)
            .await
        {
            warn!("New conversations for {} will only alert after a refresh: {}", me, e);
        }

        let pump = tokio::spawn(publish_alerts(
            ctx.clone(),
            events,
            membership,
            sink.clone(),
            watched.clone(),
            tx.clone(),
        ));

        let notifier = Self {
            ctx,
            tx,
            sink,
            watched,
            pump: Mutex::new(Some(pump)),
        };
        notifier.refresh().await;
        notifier
    }

    /// Open inbox channels for conversations not yet watched. Returns how
    /// many were opened.
    pub async fn refresh(&self) -> usize {
        if self.ctx.is_signed_out() {
            return 0;
        }
        let me = self.ctx.identity();
        let gateway = self.ctx.gateway();
        let rows = match with_network_retry(self.ctx.config(), "list conversations", || {
            gateway.list_conversations(me)
        })
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Notifier could not list conversations for {}: {}", me, e);
                return 0;
            }
        };

        let mut opened = 0;
        for row in rows {
            if watch_inbox(&self.ctx, &self.sink, &self.watched, row.id).await {
                opened += 1;
            }
        }
        if opened > 0 {
            info!("Notifier watching {} conversations for {}", self.watched.lock().await.len(), me);
        }
        opened
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub async fn watched(&self) -> Vec<ConversationId> {
        self.watched.lock().await.iter().copied().collect()
    }

    /// Close every channel this notifier opened.
    pub async fn stop(&self) {
        let me = self.ctx.identity();
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.ctx.subscriptions().unsubscribe(ChannelKey::Membership(me)).await;

        let watched: Vec<ConversationId> = self.watched.lock().await.drain().collect();
        for conversation in &watched {
            self.ctx
                .subscriptions()
                .unsubscribe(ChannelKey::Inbox {
                    identity: me,
                    conversation: *conversation,
                })
                .await;
        }
        debug!("Notifier for {} stopped ({} inboxes)", me, watched.len());
    }
}

/// Open the inbox for `conversation` unless it is already watched. Returns
/// whether a channel was opened.
async fn watch_inbox(
    ctx: &MessagingContext,
    sink: &mpsc::UnboundedSender<ChannelEvent>,
    watched: &Watched,
    conversation: ConversationId,
) -> bool {
    let mut watched = watched.lock().await;
    if watched.contains(&conversation) {
        return false;
    }
    let key = ChannelKey::Inbox {
        identity: ctx.identity(),
        conversation,
    };
    match ctx.subscriptions().subscribe(key, sink.clone()).await {
        Ok(_) => {
            watched.insert(conversation);
            true
        }
        Err(e) => {
            warn!("Notifier could not watch {}: {}", conversation, e);
            false
        }
    }
}

async fn publish_alerts(
    ctx: Arc<MessagingContext>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut membership: mpsc::UnboundedReceiver<ChannelEvent>,
    sink: mpsc::UnboundedSender<ChannelEvent>,
    watched: Watched,
    tx: broadcast::Sender<Notification>,
) {
    let me = ctx.identity();
    let mut membership_open = true;
    let mut caught_up: HashSet<MessageId> = HashSet::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let ChannelEvent::MessageInserted(message) = event else {
                    continue;
                };
                if caught_up.remove(&message.id) {
                    continue;
                }
                alert(&ctx, &tx, &message).await;
            }
            event = membership.recv(), if membership_open => {
                let Some(event) = event else {
                    membership_open = false;
                    continue;
                };
                let ChannelEvent::ConversationChanged(row) = event else {
                    continue;
                };
                if !watch_inbox(&ctx, &sink, &watched, row.id).await {
                    continue;
                }
                info!("{} was added to conversation {}", me, row.id);

                // Inserts that landed before the inbox opened
                if caught_up.len() > CAUGHT_UP_LIMIT {
                    caught_up.clear();
                }
                match ctx.gateway().list_messages(row.id).await {
                    Ok(messages) => {
                        for message in messages.iter().filter(|m| m.sender_id != me && !m.is_read) {
                            caught_up.insert(message.id);
                            alert(&ctx, &tx, message).await;
                        }
                    }
                    Err(e) => warn!("Could not catch up on {}: {}", row.id, e),
                }
            }
        }
    }
}

async fn alert(ctx: &MessagingContext, tx: &broadcast::Sender<Notification>, message: &Message) {
    if message.sender_id == ctx.identity() {
        return;
    }
    let mut notification = Notification::for_message(message);
    if let Some(conversation) = ctx.conversation(message.conversation_id).await {
        notification.title = format!("New message from {}", conversation.other_participant.display_label());
    }
    debug!("Alerting {} about {}", ctx.identity(), message.id);
    // no receivers is fine
    let _ = tx.send(notification);
}
