use async_trait::async_trait;

use super::{fetch_client_credential, fetch_jsapi_ticket, Account, AccountContext, AccountKind};
use crate::error::GateResult;
use crate::security::token_refresh::Credential;

/// Official account.
#[derive(Debug, Clone, Default)]
pub struct MpAccount {
    pub app_id: String,
    pub app_secret: String,
    pub token: String,
    pub encoding_aes_key: String,
}

#[async_trait]
impl Account for MpAccount {
    fn kind(&self) -> AccountKind {
        AccountKind::Mp
    }

    fn app_id(&self) -> &str {
        &self.app_id
    }

    fn secret(&self) -> &str {
        &self.app_secret
    }

    fn token(&self) -> &str {
        &self.token
    }

    fn encoding_aes_key(&self) -> &str {
        &self.encoding_aes_key
    }

    async fn fetch_access_token(&self, ctx: &AccountContext) -> GateResult<Credential> {
        fetch_client_credential(ctx, &self.app_id, &self.app_secret).await
    }

    async fn fetch_ticket(
        &self,
        ctx: &AccountContext,
        access_token: &str,
    ) -> GateResult<Credential> {
        fetch_jsapi_ticket(ctx, access_token).await
    }
}
