use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::credential::source::{AcquireError, CredentialSource};
use crate::security::audit_log::AuditLogger;

/// A bearer credential owned by the cache. `expires_at > issued_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    value: String,
    issued_at: Instant,
    expires_at: Instant,
}

impl Credential {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn expires_in(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Subtracted from the issuer's ttl to absorb clock drift and latency.
    pub safety_margin: Duration,
    /// How long an expired credential is retained after a failed refresh.
    pub stale_grace: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(180),
            stale_grace: Duration::from_secs(60),
        }
    }
}

impl CachePolicy {
    fn lifetime(&self, ttl: Duration) -> Duration {
        match ttl.checked_sub(self.safety_margin) {
            Some(lifetime) if !lifetime.is_zero() => lifetime,
            _ => ttl / 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePhase {
    Empty,
    Valid,
    Refreshing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatus {
    pub phase: CachePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
    pub acquisitions: u64,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, AcquireError>>>;

struct InFlight {
    id: u64,
    future: RefreshFuture,
}

#[derive(Default)]
struct State {
    current: Option<Credential>,
    in_flight: Option<InFlight>,
}

impl State {
    fn fresh(&self, now: Instant) -> Option<Credential> {
        self.current
            .as_ref()
            .filter(|c| !c.is_expired_at(now))
            .cloned()
    }
}

struct Inner {
    source: Arc<dyn CredentialSource>,
    policy: CachePolicy,
    state: RwLock<State>,
    next_refresh_id: AtomicU64,
    acquisitions: AtomicU64,
    audit: AuditLogger,
}

/// Shared access-token cache with single-flight refresh.
///
/// Reads of a still-valid credential take a short read lock and never wait on
/// the network. When a refresh is needed, exactly one acquire call runs (as a
/// spawned task) and every caller arriving meanwhile awaits the same result.
/// No lock is held across an `.await`.
#[derive(Clone)]
pub struct CredentialCache {
    inner: Arc<Inner>,
}

impl CredentialCache {
    pub fn new(source: Arc<dyn CredentialSource>, policy: CachePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                policy,
                state: RwLock::new(State::default()),
                next_refresh_id: AtomicU64::new(1),
                acquisitions: AtomicU64::new(0),
                audit: AuditLogger::new(),
            }),
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.inner.policy
    }

    /// Current credential, refreshing first if there is none or it expired.
    pub async fn get(&self) -> Result<Credential, AcquireError> {
        if let Some(credential) = self.inner.state.read().fresh(Instant::now()) {
            return Ok(credential);
        }

        let pending = {
            let mut state = self.inner.state.write();
            if let Some(credential) = state.fresh(Instant::now()) {
                return Ok(credential);
            }
            self.join_or_start(&mut state)
        };
        pending.await
    }

    /// Replace the credential regardless of its expiry. Joins a refresh that
    /// is already running instead of starting a second one.
    pub async fn force_refresh(&self) -> Result<Credential, AcquireError> {
        let pending = {
            let mut state = self.inner.state.write();
            self.join_or_start(&mut state)
        };
        pending.await
    }

    /// Refresh after the platform rejected `stale`. If another caller has
    /// already replaced it with a valid credential, that one is returned and
    /// no acquire call is made.
    pub async fn refresh_rejected(&self, stale: &Credential) -> Result<Credential, AcquireError> {
        let pending = {
            let mut state = self.inner.state.write();
            if state.in_flight.is_none() {
                if let Some(current) = state.fresh(Instant::now()).filter(|c| c != stale) {
                    debug!("credential already replaced, skipping refresh");
                    return Ok(current);
                }
            }
            self.join_or_start(&mut state)
        };
        pending.await
    }

    pub fn status(&self) -> CacheStatus {
        let now = Instant::now();
        let state = self.inner.state.read();
        let fresh = state.fresh(now);
        let phase = if state.in_flight.is_some() {
            CachePhase::Refreshing
        } else if fresh.is_some() {
            CachePhase::Valid
        } else {
            CachePhase::Empty
        };
        CacheStatus {
            phase,
            expires_in_secs: fresh.map(|c| c.expires_in(now).as_secs()),
            acquisitions: self.acquisitions(),
        }
    }

    /// Number of acquire calls issued so far.
    pub fn acquisitions(&self) -> u64 {
        self.inner.acquisitions.load(Ordering::SeqCst)
    }

    fn join_or_start(&self, state: &mut State) -> RefreshFuture {
        if let Some(flight) = &state.in_flight {
            debug!(refresh_id = flight.id, "joining in-flight refresh");
            return flight.future.clone();
        }

        let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        // Spawned so the refresh completes even if every waiter is dropped.
        let handle = tokio::spawn(inner.refresh(id));
        let future = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(AcquireError::Aborted(e.to_string())))
        }
        .boxed()
        .shared();

        state.in_flight = Some(InFlight {
            id,
            future: future.clone(),
        });
        future
    }
}

impl Inner {
    async fn refresh(self: Arc<Self>, id: u64) -> Result<Credential, AcquireError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        debug!(refresh_id = id, "acquiring credential");

        let result = match self.source.acquire().await {
            Ok(acquired) if acquired.ttl.is_zero() => {
                Err(AcquireError::Malformed("zero credential lifetime".to_string()))
            }
            other => other,
        };
        let now = Instant::now();

        let outcome = {
            let mut state = self.state.write();
            if state.in_flight.as_ref().is_some_and(|f| f.id == id) {
                state.in_flight = None;
            }
            match result {
                Ok(acquired) => {
                    let credential = Credential {
                        value: acquired.value,
                        issued_at: now,
                        expires_at: now + self.policy.lifetime(acquired.ttl),
                    };
                    state.current = Some(credential.clone());
                    Ok(credential)
                }
                Err(err) => {
                    let grace = self.policy.stale_grace;
                    let retain = state
                        .current
                        .as_ref()
                        .is_some_and(|c| now < c.expires_at + grace);
                    if !retain {
                        state.current = None;
                    }
                    Err(err)
                }
            }
        };

        match &outcome {
            Ok(credential) => {
                let expires_in = credential.expires_in(now).as_secs();
                info!(refresh_id = id, expires_in_secs = expires_in, "credential refreshed");
                self.audit.credential_refreshed(expires_in);
            }
            Err(err) => self.audit.credential_refresh_failed(&err.to_string()),
        }
        outcome
    }
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("policy", &self.inner.policy)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::source::AcquiredCredential;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct CountingSource {
        calls: AtomicU64,
        ttl: Duration,
        delay: Duration,
        failing: AtomicBool,
    }

    impl CountingSource {
        fn new(ttl_secs: u64, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU64::new(0),
                ttl: Duration::from_secs(ttl_secs),
                delay: Duration::from_millis(delay_ms),
                failing: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn acquire(&self) -> Result<AcquiredCredential, AcquireError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(AcquireError::Transport(format!("attempt {n} refused")));
            }
            Ok(AcquiredCredential {
                value: format!("token-{n}"),
                ttl: self.ttl,
            })
        }
    }

    fn cache(source: Arc<CountingSource>) -> CredentialCache {
        CredentialCache::new(source, CachePolicy::default())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_share_one_acquire() {
        let source = CountingSource::new(7200, 50);
        let cache = cache(source.clone());
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    cache.get().await
                })
            })
            .collect();

        for task in tasks {
            let credential = task.await.unwrap().unwrap();
            assert_eq!(credential.value(), "token-1");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.acquisitions(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_share_one_error() {
        let source = CountingSource::new(7200, 200);
        source.failing.store(true, Ordering::SeqCst);
        let cache = cache(source.clone());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get().await })
            })
            .collect();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err, AcquireError::Transport("attempt 1 refused".to_string()));
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.status().phase, CachePhase::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_credential_is_never_returned() {
        let source = CountingSource::new(600, 0);
        let cache = cache(source.clone());

        let first = cache.get().await.unwrap();
        assert_eq!(first.value(), "token-1");
        assert_eq!(first.expires_at() - first.issued_at(), Duration::from_secs(420));

        tokio::time::advance(Duration::from_secs(419)).await;
        assert_eq!(cache.get().await.unwrap().value(), "token-1");

        tokio::time::advance(Duration::from_secs(1)).await;
        let second = cache.get().await.unwrap();
        assert_eq!(second.value(), "token-2");
        assert!(second.expires_at() > Instant::now());
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_ttl_uses_half_lifetime() {
        let source = CountingSource::new(100, 0);
        let cache = cache(source);
        let credential = cache.get().await.unwrap();
        assert_eq!(credential.expires_at() - credential.issued_at(), Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_zero_ttl_is_malformed() {
        let source = CountingSource::new(0, 0);
        let cache = cache(source);
        assert!(matches!(cache.get().await, Err(AcquireError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_force_refresh_replaces_valid_credential() {
        let source = CountingSource::new(7200, 0);
        let cache = cache(source.clone());
        assert_eq!(cache.get().await.unwrap().value(), "token-1");
        assert_eq!(cache.force_refresh().await.unwrap().value(), "token-2");
        assert_eq!(cache.get().await.unwrap().value(), "token-2");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refresh_rejected_skips_when_already_replaced() {
        let source = CountingSource::new(7200, 0);
        let cache = cache(source.clone());
        let stale = cache.get().await.unwrap();
        let fresh = cache.force_refresh().await.unwrap();

        let got = cache.refresh_rejected(&stale).await.unwrap();
        assert_eq!(got, fresh);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        let newer = cache.refresh_rejected(&fresh).await.unwrap();
        assert_eq!(newer.value(), "token-3");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rejections_refresh_once() {
        let source = CountingSource::new(7200, 30);
        let cache = cache(source.clone());
        let stale = cache.get().await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let stale = stale.clone();
                tokio::spawn(async move { cache.refresh_rejected(&stale).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().value(), "token-2");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_valid_credential() {
        let source = CountingSource::new(7200, 0);
        let cache = cache(source.clone());
        cache.get().await.unwrap();

        source.failing.store(true, Ordering::SeqCst);
        assert!(cache.force_refresh().await.is_err());
        assert_eq!(cache.get().await.unwrap().value(), "token-1");
        assert_eq!(cache.status().phase, CachePhase::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failure() {
        let source = CountingSource::new(600, 0);
        let cache = cache(source.clone());
        cache.get().await.unwrap();

        source.failing.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(500)).await;
        assert!(cache.get().await.is_err());
        assert_eq!(cache.status().phase, CachePhase::Empty);

        source.failing.store(false, Ordering::SeqCst);
        assert_eq!(cache.get().await.unwrap().value(), "token-3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_expiry() {
        let source = CountingSource::new(600, 0);
        let cache = cache(source);
        assert_eq!(cache.status().phase, CachePhase::Empty);
        cache.get().await.unwrap();
        let status = cache.status();
        assert_eq!(status.phase, CachePhase::Valid);
        assert_eq!(status.expires_in_secs, Some(420));
        assert_eq!(status.acquisitions, 1);
    }

    #[tokio::test]
    async fn test_refresh_survives_dropped_waiter() {
        let source = CountingSource::new(7200, 20);
        let cache = cache(source.clone());
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get().await })
        };
        tokio::task::yield_now().await;
        waiter.abort();

        assert_eq!(cache.get().await.unwrap().value(), "token-1");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
