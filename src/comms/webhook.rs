use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::agent::config::WebhookSettings;
use crate::credential::CredentialCache;
use crate::security::audit_log::AuditLogger;
use crate::security::replay::ReplayProtection;
use crate::security::signer;
use crate::security::{MessageEnvelope, SecureEnvelope};
use crate::utils::idgen::IdentifierGenerator;

type SharedState = Arc<WebhookState>;

/// A verified, decrypted callback message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub plaintext: Vec<u8>,
    pub to_user_name: String,
    pub timestamp: i64,
    pub nonce: String,
    pub correlation_id: String,
}

/// Receives decrypted callback payloads. Returning `Some(reply)` sends
/// `reply` back encrypted; `None` acknowledges with `success`.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: &InboundMessage) -> Option<Vec<u8>>;
}

impl<F> MessageHandler for F
where
    F: Fn(&InboundMessage) -> Option<Vec<u8>> + Send + Sync + 'static,
{
    fn handle(&self, message: &InboundMessage) -> Option<Vec<u8>> {
        self(message)
    }
}

pub struct WebhookState {
    pub path: String,
    pub envelope: SecureEnvelope,
    pub handler: Arc<dyn MessageHandler>,
    pub replay: ReplayProtection,
    pub audit: AuditLogger,
    pub ids: Arc<IdentifierGenerator>,
    pub max_skew_secs: u64,
    pub credential_cache: Option<CredentialCache>,
}

impl WebhookState {
    pub fn new(
        envelope: SecureEnvelope,
        handler: Arc<dyn MessageHandler>,
        ids: Arc<IdentifierGenerator>,
        settings: &WebhookSettings,
    ) -> Self {
        Self {
            path: settings.path.clone(),
            envelope,
            handler,
            replay: ReplayProtection::new_ttl(settings.replay_ttl_secs),
            audit: AuditLogger::new(),
            ids,
            max_skew_secs: settings.max_skew_secs,
            credential_cache: None,
        }
    }

    pub fn with_credential_cache(mut self, cache: CredentialCache) -> Self {
        self.credential_cache = Some(cache);
        self
    }
}

/// Query parameters the platform appends to the callback URL.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub timestamp: i64,
    pub nonce: String,
    pub signature: Option<String>,
    pub echostr: Option<String>,
    pub msg_signature: Option<String>,
    pub encrypt_type: Option<String>,
}

/// Encrypted callback body: `<xml><ToUserName/><Encrypt/></xml>`.
#[derive(Debug, Deserialize)]
pub struct EncryptedRequestBody {
    #[serde(rename = "ToUserName", default)]
    pub to_user_name: String,
    #[serde(rename = "Encrypt")]
    pub encrypt: String,
}

/// Encrypted reply body.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename = "xml")]
pub struct EncryptedResponseBody {
    #[serde(rename = "Encrypt")]
    pub encrypt: String,
    #[serde(rename = "MsgSignature")]
    pub msg_signature: String,
    #[serde(rename = "TimeStamp")]
    pub timestamp: i64,
    #[serde(rename = "Nonce")]
    pub nonce: String,
}

impl From<MessageEnvelope> for EncryptedResponseBody {
    fn from(envelope: MessageEnvelope) -> Self {
        Self {
            encrypt: envelope.ciphertext,
            msg_signature: envelope.signature,
            timestamp: envelope.timestamp,
            nonce: envelope.nonce,
        }
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn reject(status: StatusCode, msg: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
        .into_response()
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let replay_keys = state.replay.len().await;
    match &state.credential_cache {
        Some(cache) => Json(json!({
            "status": "ok",
            "replay_keys": replay_keys,
            "credential": cache.status(),
        })),
        None => Json(json!({"status": "ok", "replay_keys": replay_keys})),
    }
}

// URL verification handshake (GET)
async fn verify_url(State(state): State<SharedState>, Query(q): Query<CallbackQuery>) -> Response {
    let app_id = state.envelope.app_id();
    let (Some(signature), Some(echostr)) = (q.signature.as_deref(), q.echostr) else {
        return reject(StatusCode::BAD_REQUEST, "missing signature or echostr");
    };

    let timestamp = q.timestamp.to_string();
    if signer::verify(&[state.envelope.token(), &timestamp, &q.nonce], signature) {
        state.audit.url_verified(app_id);
        (StatusCode::OK, echostr).into_response()
    } else {
        state.audit.url_signature_invalid(app_id, &q.nonce);
        reject(StatusCode::UNAUTHORIZED, "signature mismatch")
    }
}

// Encrypted message delivery (POST)
async fn receive_message(
    State(state): State<SharedState>,
    Query(q): Query<CallbackQuery>,
    body: String,
) -> Response {
    let app_id = state.envelope.app_id();

    if q.encrypt_type.as_deref() != Some("aes") {
        return reject(StatusCode::BAD_REQUEST, "unsupported encrypt_type");
    }
    let Some(msg_signature) = q.msg_signature else {
        return reject(StatusCode::BAD_REQUEST, "missing msg_signature");
    };

    let skew = Utc::now().timestamp().abs_diff(q.timestamp);
    if skew > state.max_skew_secs {
        state.audit.stale_timestamp(app_id, q.timestamp, skew);
        return reject(StatusCode::UNAUTHORIZED, "stale request");
    }

    let request: EncryptedRequestBody = match quick_xml::de::from_str(&body) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "malformed callback body");
            return reject(StatusCode::BAD_REQUEST, "malformed body");
        }
    };

    let envelope = MessageEnvelope {
        ciphertext: request.encrypt,
        nonce: q.nonce,
        timestamp: q.timestamp,
        signature: msg_signature,
        correlation_id: state.ids.next().to_string(),
    };

    let plaintext = match state.envelope.consume(&envelope) {
        Ok(p) => p,
        Err(_) => {
            state.audit.envelope_rejected(app_id, &envelope.nonce);
            return reject(StatusCode::UNAUTHORIZED, "envelope rejected");
        }
    };

    let replay_key =
        ReplayProtection::callback_key(envelope.timestamp, &envelope.nonce, &envelope.signature);
    if !state.replay.check_and_store(&replay_key).await {
        state.audit.replay_detected(app_id, &envelope.nonce);
        return reject(StatusCode::CONFLICT, "replay detected");
    }
    state
        .audit
        .envelope_accepted(app_id, &envelope.nonce, &envelope.correlation_id);

    let message = InboundMessage {
        plaintext,
        to_user_name: request.to_user_name,
        timestamp: envelope.timestamp,
        nonce: envelope.nonce,
        correlation_id: envelope.correlation_id,
    };

    let Some(reply) = state.handler.handle(&message) else {
        return (StatusCode::OK, "success").into_response();
    };

    let sealed = state.envelope.produce(&reply, Utc::now().timestamp());
    match quick_xml::se::to_string(&EncryptedResponseBody::from(sealed)) {
        Ok(xml) => (StatusCode::OK, [(header::CONTENT_TYPE, "application/xml")], xml).into_response(),
        Err(e) => {
            error!(error = %e, correlation_id = %message.correlation_id, "failed to encode reply");
            reject(StatusCode::INTERNAL_SERVER_ERROR, "reply encoding failed")
        }
    }
}

pub fn create_router(state: SharedState) -> Router {
    let path = state.path.clone();
    Router::new()
        .route("/health", get(health))
        .route(&path, get(verify_url).post(receive_message))
        .with_state(state)
}

pub async fn serve(state: SharedState, port: u16) -> Result<()> {
    let app = create_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(path = %state.path, "webhook server listening on {}", addr);
    axum::serve(listener, app).into_future().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_parses_cdata() {
        let xml = "<xml><ToUserName><![CDATA[gh_123]]></ToUserName><Encrypt><![CDATA[abc+/=]]></Encrypt><AgentID>1</AgentID></xml>";
        let body: EncryptedRequestBody = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(body.to_user_name, "gh_123");
        assert_eq!(body.encrypt, "abc+/=");
    }

    #[test]
    fn test_response_body_layout() {
        let body = EncryptedResponseBody {
            encrypt: "ENC".into(),
            msg_signature: "SIG".into(),
            timestamp: 1409304348,
            nonce: "N".into(),
        };
        let xml = quick_xml::se::to_string(&body).unwrap();
        assert_eq!(
            xml,
            "<xml><Encrypt>ENC</Encrypt><MsgSignature>SIG</MsgSignature><TimeStamp>1409304348</TimeStamp><Nonce>N</Nonce></xml>"
        );
    }
}
