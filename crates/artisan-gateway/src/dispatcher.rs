use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use artisan_types::events::{ChannelFilter, ChannelSignal, RealtimeEvent};
use artisan_types::gateway::{GatewaySubscription, SubscriptionId};

/// Fans published change events out to filtered channels.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Every channel task listens here and applies its own filter.
    broadcast_tx: broadcast::Sender<RealtimeEvent>,

    /// Live channels: subscription id -> (stop signal, forwarding task)
    channels: Mutex<HashMap<SubscriptionId, (oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Publish an event to every channel whose filter matches.
    pub fn publish(&self, event: RealtimeEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Open a filtered channel. The first signal is always `Subscribed`.
    pub async fn open(&self, filter: ChannelFilter) -> GatewaySubscription {
        let id = SubscriptionId::new();
        // Subscribe before acknowledging so nothing published after the ack is missed.
        let mut events = self.inner.broadcast_tx.subscribe();
        let (tx, signals) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            if tx.send(ChannelSignal::Subscribed).is_err() {
                return;
            }

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    result = events.recv() => {
                        let event = match result {
                            Ok(event) => event,
                            Err(RecvError::Lagged(n)) => {
                                warn!("Channel {} lagged by {} events", id, n);
                                continue;
                            }
                            Err(RecvError::Closed) => {
                                let _ = tx.send(ChannelSignal::Error("realtime broker closed".into()));
                                break;
                            }
                        };

                        if filter.matches(&event) && tx.send(ChannelSignal::Event(event)).is_err() {
                            // Receiver dropped without unsubscribing
                            break;
                        }
                    }
                }
            }
        });

        self.inner.channels.lock().await.insert(id, (stop_tx, task));
        debug!("Opened realtime channel {}", id);

        GatewaySubscription { id, signals }
    }

    /// Stop a channel and wait for its task to finish. After this returns no
    /// further signals are delivered for `id`.
    pub async fn close(&self, id: SubscriptionId) {
        let entry = self.inner.channels.lock().await.remove(&id);
        let Some((stop_tx, task)) = entry else {
            return;
        };

        let _ = stop_tx.send(());
        if let Err(e) = task.await {
            warn!("Realtime channel {} task ended abnormally: {}", id, e);
        }
        debug!("Closed realtime channel {}", id);
    }

    /// Number of channels currently open.
    pub async fn channel_count(&self) -> usize {
        self.inner.channels.lock().await.len()
    }
}
