use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use crate::credential::cache::CredentialCache;

/// Background task that keeps the access token warm.
///
/// Wakes every `interval` (+ 0-10% jitter) and calls `get()` on the cache, so
/// an expired token is replaced before request traffic needs it. Failures
/// are logged and retried on the next tick.
pub fn spawn_token_keeper(cache: CredentialCache, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match cache.get().await {
                Ok(credential) => {
                    debug!(
                        expires_in_secs = credential.expires_in(tokio::time::Instant::now()).as_secs(),
                        "access token warm"
                    );
                }
                Err(err) => {
                    warn!(error = %err, "failed to refresh access token (will retry)");
                }
            }

            // Generate jitter outside the await so the future stays Send
            let jitter = {
                use rand::Rng;
                let max = (interval.as_millis() as u64 / 10).max(1);
                rand::thread_rng().gen_range(0..max)
            };
            sleep(interval + Duration::from_millis(jitter)).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::cache::{CachePhase, CachePolicy};
    use crate::credential::source::{AcquireError, AcquiredCredential, CredentialSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct ShortLived {
        calls: AtomicU64,
    }

    #[async_trait]
    impl CredentialSource for ShortLived {
        async fn acquire(&self) -> Result<AcquiredCredential, AcquireError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AcquiredCredential {
                value: format!("token-{n}"),
                ttl: Duration::from_secs(200),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeper_refreshes_after_expiry() {
        let source = Arc::new(ShortLived::default());
        let cache = CredentialCache::new(source.clone(), CachePolicy::default());
        // 200s ttl with a 180s margin -> 20s lifetime
        let handle = spawn_token_keeper(cache.clone(), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.status().phase, CachePhase::Valid);

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        handle.abort();
    }
}
