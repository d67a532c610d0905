use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// PKCS#7 block size used by the platform (not the AES block size).
pub const PAD_BLOCK_SIZE: usize = 32;
pub const RANDOM_LEN: usize = 16;
const AES_BLOCK: usize = 16;
const LEN_PREFIX: usize = 4;

// Encoding keys are 43 chars; the last one may carry non-zero spare bits.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("encoding key must be 43 characters, got {0}")]
    Length(usize),
    #[error("encoding key is not valid base64")]
    Encoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    #[error("ciphertext length {0} is not a positive multiple of the block size")]
    BlockLength(usize),
    #[error("invalid padding")]
    Padding,
    #[error("frame too short")]
    Truncated,
    #[error("length prefix exceeds frame")]
    Length,
    #[error("tenant id mismatch")]
    Tenant,
    #[error("cipher failure")]
    Cipher,
}

/// The 32-byte AES key derived from the platform's 43-character encoding key.
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey([u8; 32]);

impl AesKey {
    pub fn from_encoding_key(encoding_key: &str) -> Result<Self, KeyError> {
        if encoding_key.len() != 43 {
            return Err(KeyError::Length(encoding_key.len()));
        }
        let raw = KEY_ENGINE
            .decode(format!("{encoding_key}="))
            .map_err(|_| KeyError::Encoding)?;
        let key: [u8; 32] = raw.try_into().map_err(|_| KeyError::Encoding)?;
        Ok(Self(key))
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self(key)
    }

    fn iv(&self) -> &[u8] {
        &self.0[..AES_BLOCK]
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesKey(..)")
    }
}

/// AES-256-CBC message cipher bound to one tenant (app id).
///
/// Frame layout before padding: `random(16) | len(u32 BE) | message | app_id`.
#[derive(Debug, Clone)]
pub struct MessageCipher {
    key: AesKey,
    app_id: String,
}

impl MessageCipher {
    pub fn new(key: AesKey, app_id: impl Into<String>) -> Self {
        Self {
            key,
            app_id: app_id.into(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn encrypt(&self, random: &[u8; RANDOM_LEN], plaintext: &[u8]) -> Vec<u8> {
        let app_id = self.app_id.as_bytes();
        let mut frame =
            Vec::with_capacity(RANDOM_LEN + LEN_PREFIX + plaintext.len() + app_id.len() + PAD_BLOCK_SIZE);
        frame.extend_from_slice(random);
        frame.extend_from_slice(&(plaintext.len() as u32).to_be_bytes());
        frame.extend_from_slice(plaintext);
        frame.extend_from_slice(app_id);
        pkcs7_pad(&mut frame);

        Aes256CbcEnc::new(self.key.0.as_slice().into(), self.key.iv().into())
            .encrypt_padded_vec_mut::<NoPadding>(&frame)
    }

    /// Returns the embedded random bytes and the message. Fails if the
    /// padding, length prefix, or tenant suffix do not check out.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<([u8; RANDOM_LEN], Vec<u8>), DecryptError> {
        if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK != 0 {
            return Err(DecryptError::BlockLength(ciphertext.len()));
        }
        let mut frame = Aes256CbcDec::new(self.key.0.as_slice().into(), self.key.iv().into())
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| DecryptError::Cipher)?;
        pkcs7_unpad(&mut frame)?;

        if frame.len() < RANDOM_LEN + LEN_PREFIX {
            return Err(DecryptError::Truncated);
        }
        let mut random = [0u8; RANDOM_LEN];
        random.copy_from_slice(&frame[..RANDOM_LEN]);

        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&frame[RANDOM_LEN..RANDOM_LEN + LEN_PREFIX]);
        let msg_len = u32::from_be_bytes(len_bytes) as usize;

        let body = &frame[RANDOM_LEN + LEN_PREFIX..];
        if msg_len > body.len() {
            return Err(DecryptError::Length);
        }
        let (message, app_id) = body.split_at(msg_len);
        if app_id != self.app_id.as_bytes() {
            return Err(DecryptError::Tenant);
        }
        Ok((random, message.to_vec()))
    }
}

fn pkcs7_pad(buf: &mut Vec<u8>) {
    let pad = PAD_BLOCK_SIZE - buf.len() % PAD_BLOCK_SIZE;
    buf.resize(buf.len() + pad, pad as u8);
}

fn pkcs7_unpad(buf: &mut Vec<u8>) -> Result<(), DecryptError> {
    let pad = *buf.last().ok_or(DecryptError::Padding)? as usize;
    if pad == 0 || pad > PAD_BLOCK_SIZE || pad > buf.len() {
        return Err(DecryptError::Padding);
    }
    if buf[buf.len() - pad..].iter().any(|&b| b as usize != pad) {
        return Err(DecryptError::Padding);
    }
    buf.truncate(buf.len() - pad);
    Ok(())
}
