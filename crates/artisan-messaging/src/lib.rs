//! Messaging session manager: keeps a local view of conversations and
//! messages in sync with a [`Gateway`](artisan_types::gateway::Gateway)
//! through on-demand reads plus realtime change feeds.
//!
//! Everything hangs off a [`MessagingContext`], created when an identity
//! signs in and torn down when it signs out. [`Messenger`] bundles the
//! components for the UI layer.

#[cfg(test)]
#[macro_use]
mod test_support;

pub mod config;
pub mod context;
pub mod error;
pub mod messenger;
pub mod notifier;
pub mod read_state;
pub mod repository;
pub mod retry;
pub mod send;
pub mod session;
pub mod subscriptions;
pub mod timeline;

pub use config::MessagingConfig;
pub use context::{MessagingContext, RecipientNotifier, UnreadCounter};
pub use error::MessagingError;
pub use messenger::Messenger;
pub use notifier::GlobalNotifier;
pub use read_state::ReadStateTracker;
pub use repository::ConversationRepository;
pub use send::{MessageDraft, MessageSender, SendReceipt};
pub use session::ConversationSession;
pub use subscriptions::{ChannelEvent, ChannelKey, ChannelState, SubscriptionManager};
pub use timeline::{MessageTimeline, TimelineEntry};
