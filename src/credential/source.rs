use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::transport::VendorError;

/// A freshly issued access token and its lifetime as reported by the issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredCredential {
    pub value: String,
    pub ttl: Duration,
}

/// Credential issuance failed. `Clone` so one failure can reach every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("token request failed: {0}")]
    Transport(String),
    #[error("malformed token response: {0}")]
    Malformed(String),
    #[error("token issuance rejected: {0}")]
    Rejected(VendorError),
    #[error("token refresh aborted: {0}")]
    Aborted(String),
}

/// Pluggable "acquire new credential" call.
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    async fn acquire(&self) -> Result<AcquiredCredential, AcquireError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// Client-credential token endpoint:
/// `GET {base_url}/cgi-bin/token?grant_type=client_credential&appid=..&secret=..`
/// answering `{"access_token": "...", "expires_in": 7200}` or `{errcode, errmsg}`.
#[derive(Clone)]
pub struct HttpTokenSource {
    base_url: String,
    app_id: String,
    app_secret: String,
    http_client: Client,
}

impl HttpTokenSource {
    pub fn new(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("creating HTTP client")?;
        Ok(Self::with_client(base_url, app_id, app_secret, http_client))
    }

    pub fn with_client(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        http_client: Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            http_client,
        }
    }

    fn token_url(&self) -> String {
        format!("{}/cgi-bin/token", self.base_url)
    }
}

impl std::fmt::Debug for HttpTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTokenSource")
            .field("base_url", &self.base_url)
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CredentialSource for HttpTokenSource {
    async fn acquire(&self) -> Result<AcquiredCredential, AcquireError> {
        let url = self.token_url();
        debug!(url = %url, app_id = %self.app_id, "requesting access token");

        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", self.app_id.as_str()),
                ("secret", self.app_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| AcquireError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AcquireError::Transport(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AcquireError::Malformed(e.to_string()))?;
        parse_token_body(body)
    }
}

fn parse_token_body(body: Value) -> Result<AcquiredCredential, AcquireError> {
    if let Some(err) = VendorError::from_body(&body) {
        return Err(AcquireError::Rejected(err));
    }
    let parsed: TokenResponse =
        serde_json::from_value(body).map_err(|e| AcquireError::Malformed(e.to_string()))?;

    let value = parsed
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AcquireError::Malformed("access_token missing".to_string()))?;
    let expires_in = parsed
        .expires_in
        .filter(|s| *s > 0)
        .ok_or_else(|| AcquireError::Malformed("expires_in missing or zero".to_string()))?;

    Ok(AcquiredCredential {
        value,
        ttl: Duration::from_secs(expires_in),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_token_body() {
        let got = parse_token_body(json!({"access_token": "ACCESS", "expires_in": 7200})).unwrap();
        assert_eq!(got.value, "ACCESS");
        assert_eq!(got.ttl, Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_rejection() {
        let got = parse_token_body(json!({"errcode": 40013, "errmsg": "invalid appid"}));
        assert_eq!(
            got,
            Err(AcquireError::Rejected(VendorError::new(40013, "invalid appid")))
        );
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_token_body(json!({"expires_in": 7200})),
            Err(AcquireError::Malformed(_))
        ));
        assert!(matches!(
            parse_token_body(json!({"access_token": "A", "expires_in": 0})),
            Err(AcquireError::Malformed(_))
        ));
        assert!(matches!(
            parse_token_body(json!({"access_token": "A", "expires_in": "soon"})),
            Err(AcquireError::Malformed(_))
        ));
    }

    #[test]
    fn test_debug_hides_secret() {
        let source = HttpTokenSource::new("https://api.example.com/", "wxid", "s3cr3t").unwrap();
        let shown = format!("{source:?}");
        assert!(!shown.contains("s3cr3t"));
        assert_eq!(source.token_url(), "https://api.example.com/cgi-bin/token");
    }
}
