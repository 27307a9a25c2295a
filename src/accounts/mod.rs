//! Credential sources for the four platform products.
//!
//! Everything above this module talks to an account only through the
//! [`Account`] capability trait.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GateResult;
use crate::security::token_cache::CredentialCache;
use crate::security::token_refresh::Credential;

pub mod mp;
pub mod open;
pub mod qy;
pub mod upstream;
pub mod weapp;

pub use mp::MpAccount;
pub use open::OpenAccount;
pub use qy::QyAccount;
pub use upstream::{UpstreamClient, UpstreamHosts};
pub use weapp::WeappAccount;

pub const ACCESS_TOKEN_KEY: &str = "Token";
pub const JSAPI_TICKET_KEY: &str = "JsapiTicket";
pub const COMPONENT_VERIFY_TICKET_KEY: &str = "componentVerifyTicket";
pub const COMPONENT_ACCESS_TOKEN_KEY: &str = "component_access_token";
pub const PRE_AUTH_CODE_KEY: &str = "pre_auth_code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Mp,
    Qy,
    Open,
    Weapp,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Mp => "mp",
            AccountKind::Qy => "qy",
            AccountKind::Open => "open",
            AccountKind::Weapp => "weapp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mp" => Some(AccountKind::Mp),
            "qy" => Some(AccountKind::Qy),
            "open" => Some(AccountKind::Open),
            "weapp" => Some(AccountKind::Weapp),
            _ => None,
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an account needs to reach upstream: the HTTP client and the
/// account's own credential cache.
#[derive(Debug, Clone)]
pub struct AccountContext {
    pub client: UpstreamClient,
    pub cache: CredentialCache,
}

#[async_trait]
pub trait Account: Send + Sync + fmt::Debug {
    fn kind(&self) -> AccountKind;
    fn app_id(&self) -> &str;
    fn secret(&self) -> &str;
    fn token(&self) -> &str;
    fn encoding_aes_key(&self) -> &str;

    /// Fetch a fresh access token. The caller applies the safety margin.
    async fn fetch_access_token(&self, ctx: &AccountContext) -> GateResult<Credential>;

    /// Fetch a fresh JS-SDK ticket using a live access token.
    async fn fetch_ticket(&self, ctx: &AccountContext, access_token: &str)
        -> GateResult<Credential>;

    fn as_qy(&self) -> Option<&QyAccount> {
        None
    }

    fn as_open(&self) -> Option<&OpenAccount> {
        None
    }

    fn as_weapp(&self) -> Option<&WeappAccount> {
        None
    }
}

/// `cgi-bin/ticket/getticket` as used by every product except Qy.
pub(crate) async fn fetch_jsapi_ticket(
    ctx: &AccountContext,
    access_token: &str,
) -> GateResult<Credential> {
    let url = ctx.client.api_url("/cgi-bin/ticket/getticket");
    let json = ctx
        .client
        .get_json(&url, &[("type", "jsapi"), ("access_token", access_token)])
        .await?;
    Ok(Credential::new(
        upstream::str_field(&json, "ticket")?,
        upstream::expires_in(&json),
    ))
}

/// `cgi-bin/token` client-credential grant, shared by Mp and Weapp.
pub(crate) async fn fetch_client_credential(
    ctx: &AccountContext,
    app_id: &str,
    secret: &str,
) -> GateResult<Credential> {
    let url = ctx.client.api_url("/cgi-bin/token");
    let json = ctx
        .client
        .get_json(
            &url,
            &[
                ("grant_type", "client_credential"),
                ("appid", app_id),
                ("secret", secret),
            ],
        )
        .await?;
    Ok(Credential::new(
        upstream::str_field(&json, "access_token")?,
        upstream::expires_in(&json),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [AccountKind::Mp, AccountKind::Qy, AccountKind::Open, AccountKind::Weapp] {
            assert_eq!(AccountKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AccountKind::parse("corp"), None);
        let k: AccountKind = serde_json::from_str("\"weapp\"").unwrap();
        assert_eq!(k, AccountKind::Weapp);
    }
}
