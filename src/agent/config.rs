use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::accounts::upstream::{API_BASE, MCH_API_BASE, QY_API_BASE};
use crate::accounts::{
    Account, AccountKind, MpAccount, OpenAccount, QyAccount, UpstreamClient, UpstreamHosts,
    WeappAccount,
};
use crate::engine::Engine;
use crate::pay::Pay;
use crate::security::cipher::UnpadPolicy;

pub const ENV_API_BASE: &str = "WXGATE_API_BASE";
pub const ENV_QY_API_BASE: &str = "WXGATE_QY_API_BASE";
pub const ENV_CACHE_FILE: &str = "WXGATE_CACHE_FILE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub kind: AccountKind,
    pub app_id: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub encoding_aes_key: String,
    /// Enterprise accounts only.
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl AccountConfig {
    pub fn to_account(&self) -> Arc<dyn Account> {
        match self.kind {
            AccountKind::Mp => Arc::new(MpAccount {
                app_id: self.app_id.clone(),
                app_secret: self.secret.clone(),
                token: self.token.clone(),
                encoding_aes_key: self.encoding_aes_key.clone(),
            }),
            AccountKind::Qy => Arc::new(QyAccount {
                corp_id: self.app_id.clone(),
                secret: self.secret.clone(),
                token: self.token.clone(),
                encoding_aes_key: self.encoding_aes_key.clone(),
                agent_id: self.agent_id.clone(),
            }),
            AccountKind::Open => Arc::new(OpenAccount::new(
                self.app_id.clone(),
                self.secret.clone(),
                self.token.clone(),
                self.encoding_aes_key.clone(),
            )),
            AccountKind::Weapp => Arc::new(WeappAccount {
                app_id: self.app_id.clone(),
                app_secret: self.secret.clone(),
                token: self.token.clone(),
                encoding_aes_key: self.encoding_aes_key.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayConfig {
    pub mch_id: String,
    pub key: String,
    #[serde(default)]
    pub sandbox: bool,
    /// Reject refund payloads whose padding does not validate.
    #[serde(default)]
    pub strict_refund_padding: bool,
    /// PEM client certificate and PKCS#8 key, needed for refunds.
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub pay: Option<PayConfig>,
    #[serde(default = "default_cache_file")]
    pub cache_file: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_qy_api_base")]
    pub qy_api_base: String,
    #[serde(default = "default_mch_api_base")]
    pub mch_api_base: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default)]
    pub redirect_domain: Option<String>,
    /// Keep access tokens warm in the background; off when absent.
    #[serde(default)]
    pub prewarm_interval_secs: Option<u64>,
}

fn default_cache_file() -> String {
    "wechat.json".to_string()
}

fn default_api_base() -> String {
    API_BASE.to_string()
}

fn default_qy_api_base() -> String {
    QY_API_BASE.to_string()
}

fn default_mch_api_base() -> String {
    MCH_API_BASE.to_string()
}

fn default_http_timeout_secs() -> u64 {
    10
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let mut cfg: Config = serde_json::from_str(&raw).context("parsing JSON")?;
        cfg.apply_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply environment-style overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_API_BASE).filter(|v| !v.is_empty()) {
            self.api_base = v;
        }
        if let Some(v) = lookup(ENV_QY_API_BASE).filter(|v| !v.is_empty()) {
            self.qy_api_base = v;
        }
        if let Some(v) = lookup(ENV_CACHE_FILE).filter(|v| !v.is_empty()) {
            self.cache_file = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for account in &self.accounts {
            if account.app_id.is_empty() {
                bail!("{} account is missing app_id", account.kind);
            }
            if !seen.insert(account.app_id.as_str()) {
                bail!("duplicate app_id {} in config", account.app_id);
            }
        }
        if let Some(pay) = &self.pay {
            if pay.mch_id.is_empty() || pay.key.is_empty() {
                bail!("pay section requires mch_id and key");
            }
        }
        Ok(())
    }

    pub fn hosts(&self) -> UpstreamHosts {
        UpstreamHosts {
            api_base: self.api_base.clone(),
            qy_api_base: self.qy_api_base.clone(),
            mch_api_base: self.mch_api_base.clone(),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// One engine per configured account, all sharing one HTTP client.
    pub fn build_engines(&self) -> Result<Vec<Engine>> {
        let client = UpstreamClient::new(self.hosts(), self.http_timeout())?;
        Ok(self
            .accounts
            .iter()
            .map(|a| {
                Engine::new(a.to_account(), client.clone())
                    .with_redirect_domain(self.redirect_domain.clone())
            })
            .collect())
    }

    pub fn build_pay(&self) -> Result<Option<Pay>> {
        let Some(cfg) = &self.pay else {
            return Ok(None);
        };
        let identity = match (&cfg.cert_path, &cfg.key_path) {
            (Some(cert), Some(key)) => {
                let cert = fs::read(cert).context("reading pay certificate")?;
                let key = fs::read(key).context("reading pay private key")?;
                Some(
                    reqwest::Identity::from_pkcs8_pem(&cert, &key)
                        .context("loading pay client identity")?,
                )
            }
            _ => None,
        };
        let client = UpstreamClient::with_identity(self.hosts(), self.http_timeout(), identity)?;
        let policy = if cfg.strict_refund_padding {
            UnpadPolicy::Strict
        } else {
            UnpadPolicy::Trusting
        };
        Ok(Some(
            Pay::new(cfg.mch_id.clone(), cfg.key.clone(), client)
                .sandbox(cfg.sandbox)
                .refund_unpad(policy),
        ))
    }
}
