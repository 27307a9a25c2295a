use async_trait::async_trait;

use super::upstream::{expires_in, str_field};
use super::{Account, AccountContext, AccountKind};
use crate::error::GateResult;
use crate::security::token_refresh::Credential;

/// Enterprise account. Uses its own API host and the corp id as app id.
#[derive(Debug, Clone, Default)]
pub struct QyAccount {
    pub corp_id: String,
    pub secret: String,
    pub token: String,
    pub encoding_aes_key: String,
    pub agent_id: Option<String>,
}

#[async_trait]
impl Account for QyAccount {
    fn kind(&self) -> AccountKind {
        AccountKind::Qy
    }

    fn app_id(&self) -> &str {
        &self.corp_id
    }

    fn secret(&self) -> &str {
        &self.secret
    }

    fn token(&self) -> &str {
        &self.token
    }

    fn encoding_aes_key(&self) -> &str {
        &self.encoding_aes_key
    }

    async fn fetch_access_token(&self, ctx: &AccountContext) -> GateResult<Credential> {
        let url = ctx.client.qy_url("/cgi-bin/gettoken");
        let json = ctx
            .client
            .get_json(
                &url,
                &[
                    ("corpid", self.corp_id.as_str()),
                    ("corpsecret", self.secret.as_str()),
                ],
            )
            .await?;
        Ok(Credential::new(str_field(&json, "access_token")?, expires_in(&json)))
    }

    async fn fetch_ticket(
        &self,
        ctx: &AccountContext,
        access_token: &str,
    ) -> GateResult<Credential> {
        let url = ctx.client.qy_url("/cgi-bin/get_jsapi_ticket");
        let json = ctx
            .client
            .get_json(&url, &[("access_token", access_token)])
            .await?;
        Ok(Credential::new(str_field(&json, "ticket")?, expires_in(&json)))
    }

    fn as_qy(&self) -> Option<&QyAccount> {
        Some(self)
    }
}
