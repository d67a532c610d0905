pub mod audit_log;
pub mod cipher;
pub mod envelope;
pub mod replay;
pub mod signer;

pub use cipher::{AesKey, DecryptError, KeyError, MessageCipher};
pub use envelope::{EnvelopeRejected, MessageEnvelope, SecureEnvelope, TenantKeys};
