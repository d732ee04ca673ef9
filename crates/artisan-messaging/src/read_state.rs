use std::sync::Arc;

use tracing::debug;

use artisan_types::models::ConversationId;

use crate::context::MessagingContext;
use crate::error::Result;
use crate::retry::with_network_retry;

/// Marks inbound messages read and keeps the unread counters in step.
#[derive(Clone)]
pub struct ReadStateTracker {
    ctx: Arc<MessagingContext>,
}

impl ReadStateTracker {
    pub fn new(ctx: Arc<MessagingContext>) -> Self {
        Self { ctx }
    }

    /// Flip `is_read` on every unread message the other participant sent,
    /// then zero the conversation's count and take its prior value off the
    /// aggregate. Idempotent. Returns the number of rows flipped.
    pub async fn mark_conversation_read(&self, id: ConversationId) -> Result<u32> {
        if self.ctx.is_local_conversation(id).await {
            return Ok(0);
        }
        self.ctx.ensure_participant(id).await?;

        let me = self.ctx.identity();
        let gateway = self.ctx.gateway();
        let flipped = with_network_retry(self.ctx.config(), "mark read", || gateway.mark_read(id, me)).await?;
        let cleared = self.ctx.clear_unread(id).await;

        if flipped > 0 || cleared > 0 {
            debug!(
                "Marked {} messages read in {} (cleared {} from the badge)",
                flipped, id, cleared
            );
        }
        Ok(flipped)
    }
}
