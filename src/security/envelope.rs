use std::sync::Arc;

use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::security::cipher::{AesKey, DecryptError, MessageCipher, RANDOM_LEN};
use crate::security::signer;
use crate::utils::idgen::IdentifierGenerator;

/// Secrets that scope one tenant's webhook traffic.
#[derive(Debug, Clone)]
pub struct TenantKeys {
    pub app_id: String,
    pub token: String,
    pub aes_key: AesKey,
}

/// The signed, encrypted wire unit of the callback channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Base64 of the AES ciphertext, as carried on the wire.
    pub ciphertext: String,
    pub nonce: String,
    pub timestamp: i64,
    pub signature: String,
    pub correlation_id: String,
}

/// Opaque rejection: callers cannot tell a bad signature from a bad ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("envelope rejected")]
pub struct EnvelopeRejected;

enum Fault {
    Signature,
    Encoding,
    Decrypt(DecryptError),
}

#[derive(Debug, Clone)]
pub struct SecureEnvelope {
    cipher: MessageCipher,
    token: String,
    ids: Arc<IdentifierGenerator>,
}

impl SecureEnvelope {
    pub fn new(tenant: &TenantKeys, ids: Arc<IdentifierGenerator>) -> Self {
        Self {
            cipher: MessageCipher::new(tenant.aes_key.clone(), tenant.app_id.clone()),
            token: tenant.token.clone(),
            ids,
        }
    }

    pub fn app_id(&self) -> &str {
        self.cipher.app_id()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn produce(&self, plaintext: &[u8], timestamp: i64) -> MessageEnvelope {
        let random: [u8; RANDOM_LEN] = rand::random();
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let ciphertext = general_purpose::STANDARD.encode(self.cipher.encrypt(&random, plaintext));
        let signature =
            signer::message_signature(&self.token, &timestamp.to_string(), &nonce, &ciphertext);

        MessageEnvelope {
            ciphertext,
            nonce,
            timestamp,
            signature,
            correlation_id: self.ids.next().to_string(),
        }
    }

    /// Verify, then decrypt. Nothing is decoded or decrypted until the
    /// signature has matched.
    pub fn consume(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, EnvelopeRejected> {
        self.open(envelope).map_err(|fault| {
            let reason = match fault {
                Fault::Signature => "signature",
                Fault::Encoding => "encoding",
                Fault::Decrypt(_) => "decrypt",
            };
            trace!(correlation_id = %envelope.correlation_id, reason, "envelope rejected");
            EnvelopeRejected
        })
    }

    fn open(&self, envelope: &MessageEnvelope) -> Result<Vec<u8>, Fault> {
        let timestamp = envelope.timestamp.to_string();
        let parts = [
            self.token.as_str(),
            timestamp.as_str(),
            envelope.nonce.as_str(),
            envelope.ciphertext.as_str(),
        ];
        if !signer::verify(&parts, &envelope.signature) {
            return Err(Fault::Signature);
        }

        let raw = general_purpose::STANDARD
            .decode(envelope.ciphertext.as_bytes())
            .map_err(|_| Fault::Encoding)?;
        let (_random, plaintext) = self.cipher.decrypt(&raw).map_err(Fault::Decrypt)?;
        Ok(plaintext)
    }
}
