use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn url_verified(&self, app_id: &str) {
        info!(target: "audit", event = "url_verified", app_id);
    }

    pub fn url_signature_invalid(&self, app_id: &str, nonce: &str) {
        warn!(target: "audit", event = "url_signature_invalid", app_id, nonce);
    }

    pub fn envelope_accepted(&self, app_id: &str, nonce: &str, correlation_id: &str) {
        info!(target: "audit", event = "envelope_accepted", app_id, nonce, correlation_id);
    }

    pub fn envelope_rejected(&self, app_id: &str, nonce: &str) {
        warn!(target: "audit", event = "envelope_rejected", app_id, nonce);
    }

    pub fn stale_timestamp(&self, app_id: &str, timestamp: i64, skew_secs: u64) {
        warn!(target: "audit", event = "stale_timestamp", app_id, timestamp, skew_secs);
    }

    pub fn replay_detected(&self, app_id: &str, nonce: &str) {
        warn!(target: "audit", event = "replay_detected", app_id, nonce);
    }

    pub fn credential_refreshed(&self, expires_in_secs: u64) {
        info!(target: "audit", event = "credential_refreshed", expires_in_secs);
    }

    pub fn credential_refresh_failed(&self, error_msg: &str) {
        error!(target: "audit", event = "credential_refresh_failed", error = error_msg);
    }

    pub fn credential_rejected(&self, code: i64) {
        warn!(target: "audit", event = "credential_rejected", code);
    }
}
