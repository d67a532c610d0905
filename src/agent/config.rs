use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use crate::credential::CachePolicy;
use crate::security::{AesKey, TenantKeys};

pub const DEFAULT_API_BASE: &str = "https://api.weixin.qq.com";

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialSettings {
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
    #[serde(default = "default_stale_grace")]
    pub stale_grace_secs: u64,
    /// Background refresh interval; `None` disables the token keeper.
    #[serde(default)]
    pub keeper_interval_secs: Option<u64>,
}

fn default_safety_margin() -> u64 {
    180
}

fn default_stale_grace() -> u64 {
    60
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            safety_margin_secs: default_safety_margin(),
            stale_grace_secs: default_stale_grace(),
            keeper_interval_secs: None,
        }
    }
}

impl CredentialSettings {
    pub fn policy(&self) -> CachePolicy {
        CachePolicy {
            safety_margin: Duration::from_secs(self.safety_margin_secs),
            stale_grace: Duration::from_secs(self.stale_grace_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSettings {
    #[serde(default = "default_webhook_path")]
    pub path: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_skew")]
    pub max_skew_secs: u64,
    #[serde(default = "default_replay_ttl")]
    pub replay_ttl_secs: u64,
}

fn default_webhook_path() -> String {
    "/wechat/callback".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_skew() -> u64 {
    300
}

fn default_replay_ttl() -> u64 {
    600
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            path: default_webhook_path(),
            port: default_port(),
            max_skew_secs: default_max_skew(),
            replay_ttl_secs: default_replay_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    /// Token registered for callback signatures.
    #[serde(default)]
    pub token: String,
    /// 43-character EncodingAESKey.
    #[serde(default)]
    pub encoding_aes_key: String,
    #[serde(default = "default_api_base")]
    pub api_base_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub credential: CredentialSettings,
    #[serde(default)]
    pub webhook: WebhookSettings,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let mut cfg: Config = serde_json::from_str(&raw).context("parsing JSON")?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Secrets may come from the environment instead of the file.
    ///
    /// - `WECHAT_APP_ID`, `WECHAT_APP_SECRET`
    /// - `WECHAT_TOKEN`, `WECHAT_ENCODING_AES_KEY`
    /// - `WECHAT_API_BASE`
    pub fn apply_env(&mut self) {
        let overrides = [
            ("WECHAT_APP_ID", &mut self.app_id),
            ("WECHAT_APP_SECRET", &mut self.app_secret),
            ("WECHAT_TOKEN", &mut self.token),
            ("WECHAT_ENCODING_AES_KEY", &mut self.encoding_aes_key),
            ("WECHAT_API_BASE", &mut self.api_base_url),
        ];
        for (var, field) in overrides {
            if let Ok(value) = std::env::var(var) {
                if !value.is_empty() {
                    *field = value;
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("app_id", &self.app_id),
            ("app_secret", &self.app_secret),
            ("token", &self.token),
        ] {
            if value.is_empty() {
                anyhow::bail!("missing required setting `{name}`");
            }
        }
        AesKey::from_encoding_key(&self.encoding_aes_key).context("invalid encoding_aes_key")?;
        if self.credential.keeper_interval_secs == Some(0) {
            anyhow::bail!("credential.keeper_interval_secs must be positive");
        }
        if !self.webhook.path.starts_with('/') {
            anyhow::bail!("webhook.path must start with '/'");
        }
        Ok(())
    }

    pub fn tenant_keys(&self) -> Result<TenantKeys> {
        Ok(TenantKeys {
            app_id: self.app_id.clone(),
            token: self.token.clone(),
            aes_key: AesKey::from_encoding_key(&self.encoding_aes_key)
                .context("invalid encoding_aes_key")?,
        })
    }
}
