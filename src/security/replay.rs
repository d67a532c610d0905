use std::sync::Arc;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

/// Remembers recently seen callback keys for `ttl`.
#[derive(Debug, Clone)]
pub struct ReplayProtection {
    ttl: Duration,
    inner: Arc<Mutex<HashMap<String, Instant>>>,
}

impl ReplayProtection {
    pub fn new_ttl(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Key for one callback delivery.
    pub fn callback_key(timestamp: i64, nonce: &str, signature: &str) -> String {
        format!("{timestamp}:{nonce}:{}", signature.to_ascii_lowercase())
    }

    /// Returns true and records `id` if it was not seen within the ttl.
    pub async fn check_and_store(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        // purge expired
        let ttl = self.ttl;
        map.retain(|_, &mut t| now.duration_since(t) < ttl);
        if map.contains_key(id) {
            return false;
        }
        map.insert(id.to_string(), now);
        true
    }

    /// Keys currently remembered, expired ones included until the next store.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
