use std::future::Future;

use tracing::warn;

use artisan_types::gateway::GatewayResult;

use crate::config::MessagingConfig;

/// Run `op`, retrying network-class failures up to `config.max_retries`
/// times with doubling backoff. Other failures return immediately.
pub async fn with_network_retry<T, F, Fut>(config: &MessagingConfig, operation: &str, mut op: F) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_network() && attempt < config.max_retries => {
                attempt += 1;
                let backoff = config.backoff(attempt);
                let max_retries = config.max_retries;
                warn!("{operation} failed ({e}) - retry {attempt}/{max_retries} after {backoff:?}");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
