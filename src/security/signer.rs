use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

/// Sign a set of strings. Input order does not matter: the parts are sorted
/// byte-wise before hashing, so both ends derive the same digest.
pub fn sign(parts: &[&str]) -> String {
    let mut sorted = parts.to_vec();
    sorted.sort_unstable();

    let mut hasher = Sha1::new();
    for part in sorted {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Constant-time check of `signature` against `sign(parts)`.
pub fn verify(parts: &[&str], signature: &str) -> bool {
    let expected = sign(parts);
    let provided = signature.to_ascii_lowercase();
    expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1
}

/// Signature for the callback URL handshake: `{token, timestamp, nonce}`.
pub fn url_signature(token: &str, timestamp: &str, nonce: &str) -> String {
    sign(&[token, timestamp, nonce])
}

/// Signature for an encrypted message: `{token, timestamp, nonce, ciphertext}`.
pub fn message_signature(token: &str, timestamp: &str, nonce: &str, encrypted: &str) -> String {
    sign(&[token, timestamp, nonce, encrypted])
}
