use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use artisan_messaging::{MessagingConfig, MessagingContext, Messenger, RecipientNotifier};
use artisan_types::gateway::Gateway;
use artisan_types::models::IdentityId;

pub type AppState = Arc<AppStateInner>;

/// A resident messenger plus what eviction needs to know about it.
struct SessionEntry {
    messenger: Arc<Messenger>,
    /// Milliseconds since the state's epoch at the last use.
    last_used: AtomicU64,
    /// Open notification sockets; a connected session is never idle.
    sockets: AtomicUsize,
}

impl SessionEntry {
    fn touch(&self, epoch: Instant) {
        self.last_used.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn is_idle(&self, epoch: Instant, ttl: Duration) -> bool {
        if self.sockets.load(Ordering::Acquire) > 0 {
            return false;
        }
        let since = epoch.elapsed().as_millis() as u64;
        let idle_for = since.saturating_sub(self.last_used.load(Ordering::Relaxed));
        Duration::from_millis(idle_for) >= ttl
    }
}

/// Keeps a session resident while a notifications socket is open.
pub struct SocketLease {
    entry: Arc<SessionEntry>,
    epoch: Instant,
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        self.entry.touch(self.epoch);
        self.entry.sockets.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct AppStateInner {
    pub gateway: Arc<dyn Gateway>,
    pub jwt_secret: String,
    pub config: MessagingConfig,
    pub recipient_notifier: Option<Arc<dyn RecipientNotifier>>,
    /// One messaging session per signed-in identity, created on first use.
    messengers: RwLock<HashMap<IdentityId, Arc<SessionEntry>>>,
    epoch: Instant,
}

impl AppStateInner {
    pub fn new(gateway: Arc<dyn Gateway>, jwt_secret: String, config: MessagingConfig) -> Self {
        Self {
            gateway,
            jwt_secret,
            config,
            recipient_notifier: None,
            messengers: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    pub fn with_recipient_notifier(mut self, notifier: Arc<dyn RecipientNotifier>) -> Self {
        self.recipient_notifier = Some(notifier);
        self
    }

    /// The identity's messenger, signing it in if needed.
    pub async fn messenger(&self, identity: IdentityId) -> Arc<Messenger> {
        self.entry(identity).await.messenger.clone()
    }

    /// Like [`messenger`](Self::messenger), but the session cannot be
    /// evicted until the returned lease is dropped.
    pub async fn connect(&self, identity: IdentityId) -> (Arc<Messenger>, SocketLease) {
        let entry = self.entry(identity).await;
        entry.sockets.fetch_add(1, Ordering::AcqRel);
        let lease = SocketLease {
            entry: entry.clone(),
            epoch: self.epoch,
        };
        (entry.messenger.clone(), lease)
    }

    async fn entry(&self, identity: IdentityId) -> Arc<SessionEntry> {
        if let Some(entry) = self.messengers.read().await.get(&identity) {
            entry.touch(self.epoch);
            return entry.clone();
        }

        // Sign in without holding the map; other identities keep going
        let mut ctx = MessagingContext::new(self.gateway.clone(), identity, self.config.clone());
        if let Some(notifier) = &self.recipient_notifier {
            ctx = ctx.with_recipient_notifier(notifier.clone());
        }
        let built = Arc::new(SessionEntry {
            messenger: Arc::new(Messenger::sign_in(ctx).await),
            last_used: AtomicU64::new(0),
            sockets: AtomicUsize::new(0),
        });

        let (entry, spare) = {
            let mut messengers = self.messengers.write().await;
            match messengers.get(&identity) {
                Some(existing) => (existing.clone(), Some(built)),
                None => {
                    messengers.insert(identity, built.clone());
                    info!("{} active messaging sessions", messengers.len());
                    (built, None)
                }
            }
        };
        if let Some(spare) = spare {
            debug!("Another request signed {} in first, dropping the duplicate", identity);
            spare.messenger.sign_out().await;
        }
        entry.touch(self.epoch);
        entry
    }

    /// Tear down the identity's messenger. Returns whether one existed.
    pub async fn sign_out(&self, identity: IdentityId) -> bool {
        let removed = self.messengers.write().await.remove(&identity);
        match removed {
            Some(entry) => {
                entry.messenger.sign_out().await;
                true
            }
            None => false,
        }
    }

    /// Sign out every session unused for `ttl` with no open notifications
    /// socket. Returns how many were evicted.
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let evicted: Vec<(IdentityId, Arc<SessionEntry>)> = {
            let mut messengers = self.messengers.write().await;
            let idle: Vec<IdentityId> = messengers
                .iter()
                .filter(|(_, entry)| entry.is_idle(self.epoch, ttl))
                .map(|(identity, _)| *identity)
                .collect();
            idle.into_iter()
                .filter_map(|identity| messengers.remove(&identity).map(|entry| (identity, entry)))
                .collect()
        };

        for (identity, entry) in &evicted {
            debug!("Evicting idle messaging session for {}", identity);
            entry.messenger.sign_out().await;
        }
        evicted.len()
    }

    pub async fn session_count(&self) -> usize {
        self.messengers.read().await.len()
    }
}

/// Background task that evicts idle messaging sessions.
pub async fn run_idle_sweep(state: AppState, ttl: Duration, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        let count = state.evict_idle(ttl).await;
        if count > 0 {
            info!("Sweep: evicted {} idle messaging sessions", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use artisan_gateway::Backend;

    fn state(backend: &Backend) -> AppStateInner {
        AppStateInner::new(
            Arc::new(backend.clone()),
            "secret".into(),
            MessagingConfig::default(),
        )
    }

    #[tokio::test]
    async fn one_messenger_per_identity() {
        let state = state(&Backend::in_memory().unwrap());
        let me = IdentityId::new();

        let first = state.messenger(me).await;
        let second = state.messenger(me).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(state.session_count().await, 1);

        assert!(state.sign_out(me).await);
        assert!(!state.sign_out(me).await);
        assert_eq!(state.session_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_first_use_keeps_one_messenger() {
        let backend = Backend::in_memory().unwrap();
        let state = state(&backend);
        let me = IdentityId::new();

        let (first, second) = tokio::join!(state.messenger(me), state.messenger(me));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(state.session_count().await, 1);
        // the losing sign-in closed its channels: list watch + membership remain
        assert_eq!(backend.dispatcher().channel_count().await, 2);

        state.sign_out(me).await;
        assert_eq!(backend.dispatcher().channel_count().await, 0);
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted() {
        let backend = Backend::in_memory().unwrap();
        let state = state(&backend);
        let (idle, busy) = (IdentityId::new(), IdentityId::new());
        let evicted = state.messenger(idle).await;
        state.messenger(busy).await;

        assert_eq!(state.evict_idle(Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        state.messenger(busy).await;
        assert_eq!(state.evict_idle(Duration::from_millis(20)).await, 1);

        assert_eq!(state.session_count().await, 1);
        assert!(evicted.context().is_signed_out());
        // next use signs the identity back in
        let fresh = state.messenger(idle).await;
        assert!(!Arc::ptr_eq(&fresh, &evicted));
        assert!(!fresh.context().is_signed_out());

        state.sign_out(idle).await;
        state.sign_out(busy).await;
        assert_eq!(backend.dispatcher().channel_count().await, 0);
    }

    #[tokio::test]
    async fn connected_sessions_stay_resident() {
        let state = state(&Backend::in_memory().unwrap());
        let me = IdentityId::new();

        let (messenger, lease) = state.connect(me).await;
        assert_eq!(state.evict_idle(Duration::ZERO).await, 0);
        assert!(!messenger.context().is_signed_out());

        drop(lease);
        assert_eq!(state.evict_idle(Duration::ZERO).await, 1);
        assert!(messenger.context().is_signed_out());
        assert_eq!(state.session_count().await, 0);
    }
}
