pub mod api_client;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const ERR_CODE_OK: i64 = 0;
/// "invalid credential": the access token is wrong or was revoked.
pub const ERR_CODE_INVALID_CREDENTIAL: i64 = 40001;
/// "access token expired".
pub const ERR_CODE_CREDENTIAL_TIMEOUT: i64 = 42001;

/// The `{errcode, errmsg}` envelope returned by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("errcode={errcode}, errmsg={errmsg}")]
pub struct VendorError {
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
}

impl VendorError {
    pub fn new(errcode: i64, errmsg: impl Into<String>) -> Self {
        Self {
            errcode,
            errmsg: errmsg.into(),
        }
    }

    pub fn is_credential_invalid(&self) -> bool {
        matches!(
            self.errcode,
            ERR_CODE_INVALID_CREDENTIAL | ERR_CODE_CREDENTIAL_TIMEOUT
        )
    }

    /// Extract a non-zero error envelope from a decoded response body.
    pub fn from_body(body: &Value) -> Option<Self> {
        let errcode = body.get("errcode").and_then(Value::as_i64)?;
        if errcode == ERR_CODE_OK {
            return None;
        }
        let errmsg = body
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Self { errcode, errmsg })
    }
}

/// Outcome of one API invocation, as seen by the request executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("credential rejected: {0}")]
    InvalidCredential(VendorError),
    #[error("platform error: {0}")]
    Remote(VendorError),
    #[error("transport error: {0}")]
    Transport(String),
}

impl CallError {
    pub fn is_invalid_credential(&self) -> bool {
        matches!(self, CallError::InvalidCredential(_))
    }
}

impl From<VendorError> for CallError {
    fn from(err: VendorError) -> Self {
        if err.is_credential_invalid() {
            CallError::InvalidCredential(err)
        } else {
            CallError::Remote(err)
        }
    }
}
