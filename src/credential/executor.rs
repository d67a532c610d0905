use std::future::Future;

use thiserror::Error;
use tracing::{debug, warn};

use crate::credential::cache::CredentialCache;
use crate::credential::source::AcquireError;
use crate::security::audit_log::AuditLogger;
use crate::transport::CallError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error(transparent)]
    Call(#[from] CallError),
}

impl ExecuteError {
    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, ExecuteError::Call(err) if err.is_invalid_credential())
    }
}

/// Runs API calls with a cached credential and one refresh-and-replay when
/// the platform rejects it.
#[derive(Debug, Clone)]
pub struct RequestExecutor {
    cache: CredentialCache,
    audit: AuditLogger,
}

impl RequestExecutor {
    pub fn new(cache: CredentialCache) -> Self {
        Self {
            cache,
            audit: AuditLogger::new(),
        }
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    /// Invoke `call` with the current access token. On `InvalidCredential`
    /// the token is refreshed and `call` runs exactly once more; that second
    /// result is returned as is. Other errors are never retried.
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> Result<T, ExecuteError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let credential = self.cache.get().await?;

        match call(credential.value().to_string()).await {
            Err(CallError::InvalidCredential(err)) => {
                warn!(errcode = err.errcode, errmsg = %err.errmsg, "credential rejected, refreshing once");
                self.audit.credential_rejected(err.errcode);

                let fresh = self.cache.refresh_rejected(&credential).await?;
                debug!("replaying call with refreshed credential");
                call(fresh.value().to_string()).await.map_err(ExecuteError::from)
            }
            other => other.map_err(ExecuteError::from),
        }
    }
}
