use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info};

use crate::agent::config::Config;
use crate::comms::webhook::{self, InboundMessage, MessageHandler, WebhookState};
use crate::credential::{spawn_token_keeper, CredentialCache, HttpTokenSource};
use crate::security::SecureEnvelope;
use crate::utils::idgen::IdentifierGenerator;

/// Acknowledges every callback and logs its size.
struct LoggingHandler;

impl MessageHandler for LoggingHandler {
    fn handle(&self, message: &InboundMessage) -> Option<Vec<u8>> {
        info!(
            correlation_id = %message.correlation_id,
            to = %message.to_user_name,
            bytes = message.plaintext.len(),
            "callback received"
        );
        None
    }
}

pub fn credential_cache(cfg: &Config) -> Result<CredentialCache> {
    let source = HttpTokenSource::new(&cfg.api_base_url, &cfg.app_id, &cfg.app_secret)?;
    Ok(CredentialCache::new(Arc::new(source), cfg.credential.policy()))
}

pub fn webhook_state(
    cfg: &Config,
    handler: Arc<dyn MessageHandler>,
    cache: Option<CredentialCache>,
) -> Result<WebhookState> {
    let ids = Arc::new(IdentifierGenerator::new());
    let envelope = SecureEnvelope::new(&cfg.tenant_keys()?, ids.clone());
    let state = WebhookState::new(envelope, handler, ids, &cfg.webhook);
    Ok(match cache {
        Some(cache) => state.with_credential_cache(cache),
        None => state,
    })
}

pub async fn run(cfg: Config, port: Option<u16>) -> Result<()> {
    info!(app_id = %cfg.app_id, api_base = %cfg.api_base_url, "daemon starting");

    let cache = credential_cache(&cfg)?;
    let keeper = cfg.credential.keeper_interval_secs.map(|secs| {
        info!(interval_secs = secs, "token keeper started");
        spawn_token_keeper(cache.clone(), Duration::from_secs(secs))
    });

    let state = Arc::new(webhook_state(&cfg, Arc::new(LoggingHandler), Some(cache))?);
    let port = port.unwrap_or(cfg.webhook.port);
    let mut server = tokio::spawn(webhook::serve(state, port));

    tokio::select! {
        res = signal::ctrl_c() => {
            res?;
            info!("shutdown signal received, stopping daemon");
        }
        res = &mut server => {
            match res {
                Ok(Err(e)) => error!(error = %e, "webhook server exited"),
                Err(e) => error!(error = %e, "webhook server task failed"),
                Ok(Ok(())) => info!("webhook server stopped"),
            }
        }
    }

    server.abort();
    if let Some(handle) = keeper {
        handle.abort();
        let _ = handle.await; // Ignore cancellation errors
    }

    Ok(())
}
