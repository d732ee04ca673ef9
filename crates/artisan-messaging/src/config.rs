use std::time::Duration;

/// Timing knobs for the messaging subsystem.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Budget for each enrichment lookup (profile, last message, unread count).
    pub enrichment_timeout: Duration,
    /// Retries after the first attempt for network-class failures.
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further one.
    pub initial_backoff: Duration,
    /// How long to wait for a channel teardown acknowledgment before opening
    /// its replacement anyway.
    pub teardown_timeout: Duration,
    /// Budget for best-effort side effects of a send.
    pub side_effect_timeout: Duration,
    /// How long a typing indicator stays visible without a refresh.
    pub typing_ttl: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            enrichment_timeout: Duration::from_secs(5),
            max_retries: 2,
            initial_backoff: Duration::from_secs(2),
            teardown_timeout: Duration::from_secs(2),
            side_effect_timeout: Duration::from_secs(3),
            typing_ttl: Duration::from_secs(3),
        }
    }
}

impl MessagingConfig {
    /// Defaults overridden by `ARTISAN_*` environment variables. Unparseable
    /// values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enrichment_timeout: env_millis("ARTISAN_ENRICHMENT_TIMEOUT_MS")
                .unwrap_or(defaults.enrichment_timeout),
            max_retries: std::env::var("ARTISAN_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            initial_backoff: env_millis("ARTISAN_RETRY_BACKOFF_MS").unwrap_or(defaults.initial_backoff),
            teardown_timeout: env_millis("ARTISAN_TEARDOWN_TIMEOUT_MS")
                .unwrap_or(defaults.teardown_timeout),
            side_effect_timeout: env_millis("ARTISAN_SIDE_EFFECT_TIMEOUT_MS")
                .unwrap_or(defaults.side_effect_timeout),
            typing_ttl: defaults.typing_ttl,
        }
    }

    /// Backoff before retry number `attempt` (1-based): 2s, 4s, 8s...
    /// Saturates at [`Duration::MAX`].
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .unwrap_or(Duration::MAX)
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let config = MessagingConfig::default();
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(2), Duration::from_secs(4));
        assert_eq!(config.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let config = MessagingConfig {
            initial_backoff: Duration::from_secs(u64::MAX / 2),
            ..MessagingConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_secs(u64::MAX / 2));
        assert_eq!(config.backoff(2), Duration::MAX);
        assert_eq!(config.backoff(40), Duration::MAX);
        assert_eq!(MessagingConfig::default().backoff(64), Duration::MAX);
    }
}
