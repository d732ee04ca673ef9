//! Everything one signed-in identity needs, bundled for the UI layer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use artisan_types::events::Notification;
use artisan_types::models::{Conversation, ConversationId, IdentityId, Message};

use crate::context::MessagingContext;
use crate::error::{MessagingError, Result};
use crate::notifier::GlobalNotifier;
use crate::read_state::ReadStateTracker;
use crate::repository::ConversationRepository;
use crate::send::{MessageDraft, MessageSender, SendReceipt};
use crate::session::{ConversationSession, ConversationSnapshot};

pub struct Messenger {
    ctx: Arc<MessagingContext>,
    repository: ConversationRepository,
    sender: MessageSender,
    read_state: ReadStateTracker,
    notifier: GlobalNotifier,
    list_watch: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by every open; a load whose generation is stale is discarded.
    generation: AtomicU64,
    opening: Mutex<()>,
    active: Mutex<Option<Arc<ConversationSession>>>,
}

impl Messenger {
    /// Start the list watch, load the list and start the notifier.
    pub async fn sign_in(ctx: MessagingContext) -> Self {
        let ctx = Arc::new(ctx);
        let repository = ConversationRepository::new(ctx.clone());

        let list_watch = match repository.watch().await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Conversation list for {} will not update live: {}", ctx.identity(), e);
                None
            }
        };
        repository.load_conversations().await;
        let notifier = GlobalNotifier::start(ctx.clone()).await;

        info!("{} signed in to messaging", ctx.identity());
        Self {
            sender: MessageSender::new(ctx.clone(), repository.clone()),
            read_state: ReadStateTracker::new(ctx.clone()),
            ctx,
            repository,
            notifier,
            list_watch: Mutex::new(list_watch),
            generation: AtomicU64::new(0),
            opening: Mutex::new(()),
            active: Mutex::new(None),
        }
    }

    /// Close the open conversation and every channel. Further calls fail
    /// with [`MessagingError::SignedOut`].
    pub async fn sign_out(&self) {
        self.ctx.mark_signed_out();
        self.close_conversation().await;
        self.notifier.stop().await;
        if let Some(watch) = self.list_watch.lock().await.take() {
            watch.abort();
        }
        self.ctx.subscriptions().unsubscribe_all().await;
        info!("{} signed out of messaging", self.ctx.identity());
    }

    pub fn identity(&self) -> IdentityId {
        self.ctx.identity()
    }

    pub fn context(&self) -> &Arc<MessagingContext> {
        &self.ctx
    }

    fn ensure_signed_in(&self) -> Result<()> {
        if self.ctx.is_signed_out() {
            return Err(MessagingError::SignedOut);
        }
        Ok(())
    }

    // -- Conversation list --

    pub async fn load_conversations(&self) -> Result<Vec<Conversation>> {
        self.ensure_signed_in()?;
        Ok(self.repository.load_conversations().await)
    }

    /// The last loaded list, without a round trip.
    pub async fn conversations(&self) -> Vec<Conversation> {
        self.ctx.conversations().await
    }

    pub fn total_unread(&self) -> u32 {
        self.ctx.unread().get()
    }

    pub fn watch_unread(&self) -> watch::Receiver<u32> {
        self.ctx.unread().subscribe()
    }

    pub async fn get_or_create_conversation(&self, other: IdentityId) -> Result<ConversationId> {
        self.ensure_signed_in()?;
        let id = self.repository.get_or_create_conversation(other).await?;
        if !self.ctx.knows_conversation(id).await {
            self.repository.load_conversations().await;
            self.notifier.refresh().await;
        }
        Ok(id)
    }

    pub async fn start_local_conversation(&self, other: IdentityId) -> Result<Conversation> {
        self.ensure_signed_in()?;
        Ok(self.ctx.create_local_conversation(other).await)
    }

    // -- Open conversation --

    /// Make `id` the open conversation: load it, switch the detail channel
    /// over and mark it read. If another open starts before this one
    /// finishes, this one returns [`MessagingError::Superseded`].
    pub async fn open_conversation(&self, id: ConversationId) -> Result<ConversationSnapshot> {
        self.ensure_signed_in()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let session = ConversationSession::prepare(self.ctx.clone(), id).await?;

        // Opens run one at a time; readers of `active` are never held up by one
        let opening = self.opening.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Discarding superseded load of {}", id);
            return Err(MessagingError::Superseded(id));
        }

        // Attach before fetching history so nothing sent in between is missed
        if let Err(e) = session.attach().await {
            warn!("Conversation {} opened without live updates: {}", id, e);
        }
        if let Err(e) = session.load_history().await {
            session.close().await;
            return Err(e);
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            session.close().await;
            debug!("Discarding superseded load of {}", id);
            return Err(MessagingError::Superseded(id));
        }

        let session = Arc::new(session);
        let previous = self.active.lock().await.replace(session.clone());
        if let Some(previous) = previous {
            previous.close().await;
        }
        if self.ctx.is_signed_out() {
            self.close_conversation().await;
            return Err(MessagingError::SignedOut);
        }
        drop(opening);

        match self.read_state.mark_conversation_read(id).await {
            Ok(_) => {
                session.mark_inbound_read().await;
            }
            Err(e) => warn!("Could not mark {} read on open: {}", id, e),
        }
        Ok(session.snapshot().await)
    }

    pub async fn close_conversation(&self) {
        let session = self.active.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.active.lock().await.as_ref().map(|s| s.id())
    }

    async fn session_for(&self, id: ConversationId) -> Option<Arc<ConversationSession>> {
        self.active.lock().await.as_ref().filter(|s| s.id() == id).cloned()
    }

    /// Snapshot of `id` if it is the open conversation.
    pub async fn snapshot(&self, id: ConversationId) -> Option<ConversationSnapshot> {
        match self.session_for(id).await {
            Some(session) => Some(session.snapshot().await),
            None => None,
        }
    }

    pub async fn active_messages(&self) -> Option<Vec<Message>> {
        let session = self.active.lock().await.clone()?;
        Some(session.messages().await)
    }

    pub async fn typing_participants(&self, id: ConversationId) -> Vec<IdentityId> {
        match self.session_for(id).await {
            Some(session) => session.typing_participants().await,
            None => Vec::new(),
        }
    }

    // -- Writes --

    pub async fn send_message(&self, id: ConversationId, draft: MessageDraft) -> Result<SendReceipt> {
        let session = self.session_for(id).await;
        self.sender.send(id, draft, session.as_deref()).await
    }

    pub async fn mark_read(&self, id: ConversationId) -> Result<u32> {
        self.ensure_signed_in()?;
        let flipped = self.read_state.mark_conversation_read(id).await?;
        if let Some(session) = self.session_for(id).await {
            session.mark_inbound_read().await;
        }
        Ok(flipped)
    }

    pub async fn start_typing(&self, id: ConversationId) -> Result<()> {
        self.ensure_signed_in()?;
        if self.ctx.is_local_conversation(id).await {
            return Ok(());
        }
        self.ctx.ensure_participant(id).await?;
        self.ctx.gateway().publish_typing(id, self.ctx.identity()).await?;
        Ok(())
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }
}
