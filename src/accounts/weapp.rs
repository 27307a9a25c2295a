use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde_json::Value;

use super::{fetch_client_credential, fetch_jsapi_ticket, Account, AccountContext, AccountKind};
use crate::error::{GateError, GateResult};
use crate::security::cipher;
use crate::security::signature::{constant_time_eq, sha1_concat};
use crate::security::token_refresh::Credential;

/// Mini program.
#[derive(Debug, Clone, Default)]
pub struct WeappAccount {
    pub app_id: String,
    pub app_secret: String,
    pub token: String,
    pub encoding_aes_key: String,
}

impl WeappAccount {
    /// Exchange a login code for `{openid, session_key, unionid?}`.
    pub async fn session_key(&self, ctx: &AccountContext, code: &str) -> GateResult<Value> {
        let url = ctx.client.api_url("/sns/jscode2session");
        ctx.client
            .get_json(
                &url,
                &[
                    ("appid", self.app_id.as_str()),
                    ("secret", self.app_secret.as_str()),
                    ("js_code", code),
                    ("grant_type", "authorization_code"),
                ],
            )
            .await
    }
}

/// Decrypt user data handed to a mini program. All three inputs are base64.
pub fn decrypt_user_data(session_key: &str, iv: &str, encrypted_data: &str) -> GateResult<String> {
    let key = general_purpose::STANDARD.decode(session_key)?;
    let iv = general_purpose::STANDARD.decode(iv)?;
    if iv.len() != cipher::BLOCK_SIZE {
        return Err(GateError::InvalidKey(format!(
            "iv must be {} bytes, got {}",
            cipher::BLOCK_SIZE,
            iv.len()
        )));
    }
    let plain = cipher::cbc_decrypt(encrypted_data, &key, Some(&iv))?;
    String::from_utf8(plain).map_err(|e| GateError::malformed(format!("user data is not utf-8: {e}")))
}

/// Check `signature == sha1(raw_data + session_key)`.
pub fn verify_user_data(session_key: &str, raw_data: &str, signature: &str) -> bool {
    let expected = sha1_concat(&[raw_data.as_bytes(), session_key.as_bytes()]);
    constant_time_eq(&expected, signature)
}

#[async_trait]
impl Account for WeappAccount {
    fn kind(&self) -> AccountKind {
        AccountKind::Weapp
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

    fn as_weapp(&self) -> Option<&WeappAccount> {
        Some(self)
    }
}
