use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::debug;

use super::upstream::{expires_in, str_field, UpstreamClient, MP_BASE};
use super::{
    fetch_jsapi_ticket, Account, AccountContext, AccountKind, COMPONENT_ACCESS_TOKEN_KEY,
    COMPONENT_VERIFY_TICKET_KEY, PRE_AUTH_CODE_KEY,
};
use crate::error::{GateError, GateResult};
use crate::security::token_cache::CredentialCache;
use crate::security::token_refresh::Credential;

/// Lifetime of a pushed component verify ticket. The platform re-pushes it
/// every ten minutes.
pub const COMPONENT_TICKET_TTL_SECS: i64 = 12 * 3600;

/// Grant that lets the component act for an authorizing official account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorizer {
    pub app_id: String,
    pub refresh_token: String,
}

/// Third-party platform ("component") account.
#[derive(Debug, Default)]
pub struct OpenAccount {
    pub app_id: String,
    pub app_secret: String,
    pub token: String,
    pub encoding_aes_key: String,
    authorizer: RwLock<Option<Authorizer>>,
}

impl OpenAccount {
    pub fn new(
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        token: impl Into<String>,
        encoding_aes_key: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            token: token.into(),
            encoding_aes_key: encoding_aes_key.into(),
            authorizer: RwLock::new(None),
        }
    }

    pub fn authorizer(&self) -> Option<Authorizer> {
        self.authorizer.read().clone()
    }

    pub fn set_authorizer_grant(&self, app_id: impl Into<String>, refresh_token: impl Into<String>) {
        *self.authorizer.write() = Some(Authorizer {
            app_id: app_id.into(),
            refresh_token: refresh_token.into(),
        });
    }

    pub async fn component_access_token(&self, ctx: &AccountContext) -> GateResult<String> {
        component_access_token(
            ctx.client.clone(),
            ctx.cache.clone(),
            self.app_id.clone(),
            self.app_secret.clone(),
        )
        .await
    }

    pub async fn pre_auth_code(&self, ctx: &AccountContext) -> GateResult<String> {
        let client = ctx.client.clone();
        let cache = ctx.cache.clone();
        let app_id = self.app_id.clone();
        let secret = self.app_secret.clone();
        ctx.cache
            .get_or_refresh(PRE_AUTH_CODE_KEY, move || async move {
                let token =
                    component_access_token(client.clone(), cache, app_id.clone(), secret).await?;
                let url = client.api_url("/cgi-bin/component/api_create_preauthcode");
                let json = client
                    .post_json(
                        &url,
                        &[("component_access_token", token.as_str())],
                        &json!({ "component_appid": app_id }),
                    )
                    .await?;
                Ok(Credential::new(str_field(&json, "pre_auth_code")?, expires_in(&json))
                    .into_refreshed())
            })
            .await
    }

    /// Exchange an authorization code for the authorizer's grant.
    pub async fn query_auth(&self, ctx: &AccountContext, auth_code: &str) -> GateResult<Value> {
        let token = self.component_access_token(ctx).await?;
        let url = ctx.client.api_url("/cgi-bin/component/api_query_auth");
        ctx.client
            .post_json(
                &url,
                &[("component_access_token", token.as_str())],
                &json!({
                    "component_appid": self.app_id,
                    "authorization_code": auth_code,
                }),
            )
            .await
    }

    /// Page the administrator is sent to in order to authorize the component.
    pub fn authorization_url(&self, pre_auth_code: &str, redirect_uri: &str) -> String {
        format!(
            "{MP_BASE}/cgi-bin/componentloginpage?component_appid={}&pre_auth_code={}&redirect_uri={}",
            self.app_id,
            pre_auth_code,
            url::form_urlencoded::byte_serialize(redirect_uri.as_bytes()).collect::<String>()
        )
    }
}

async fn component_access_token(
    client: UpstreamClient,
    cache: CredentialCache,
    app_id: String,
    secret: String,
) -> GateResult<String> {
    let ticket_cache = cache.clone();
    cache
        .get_or_refresh(COMPONENT_ACCESS_TOKEN_KEY, move || async move {
            let ticket = ticket_cache.get(COMPONENT_VERIFY_TICKET_KEY).ok_or_else(|| {
                GateError::RefreshFailed("component verify ticket not received yet".into())
            })?;
            let url = client.api_url("/cgi-bin/component/api_component_token");
            let json = client
                .post_json(
                    &url,
                    &[],
                    &json!({
                        "component_appid": app_id,
                        "component_appsecret": secret,
                        "component_verify_ticket": ticket,
                    }),
                )
                .await?;
            Ok(
                Credential::new(str_field(&json, "component_access_token")?, expires_in(&json))
                    .into_refreshed(),
            )
        })
        .await
}

#[async_trait]
impl Account for OpenAccount {
    fn kind(&self) -> AccountKind {
        AccountKind::Open
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

    /// Refreshes the authorizer access token with the stored refresh token.
    async fn fetch_access_token(&self, ctx: &AccountContext) -> GateResult<Credential> {
        let authorizer = self.authorizer().ok_or_else(|| {
            GateError::RefreshFailed("no authorizer grant; complete the authorization flow".into())
        })?;
        let token = self.component_access_token(ctx).await?;
        let url = ctx.client.api_url("/cgi-bin/component/api_authorizer_token");
        let json = ctx
            .client
            .post_json(
                &url,
                &[("component_access_token", token.as_str())],
                &json!({
                    "component_appid": self.app_id,
                    "authorizer_appid": authorizer.app_id,
                    "authorizer_refresh_token": authorizer.refresh_token,
                }),
            )
            .await?;

        let access_token = str_field(&json, "authorizer_access_token")?;
        let refresh_token = str_field(&json, "authorizer_refresh_token")?;
        debug!(authorizer = %authorizer.app_id, "authorizer grant renewed");
        self.set_authorizer_grant(authorizer.app_id, refresh_token);

        Ok(Credential::new(access_token, expires_in(&json)))
    }

    async fn fetch_ticket(
        &self,
        ctx: &AccountContext,
        access_token: &str,
    ) -> GateResult<Credential> {
        fetch_jsapi_ticket(ctx, access_token).await
    }

    fn as_open(&self) -> Option<&OpenAccount> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_url_encodes_redirect() {
        let open = OpenAccount::new("wxcomponent", "s", "t", "k");
        let url = open.authorization_url("preauth@1", "https://a.example/cb?x=1");
        assert_eq!(
            url,
            "https://mp.weixin.qq.com/cgi-bin/componentloginpage?component_appid=wxcomponent\
             &pre_auth_code=preauth@1&redirect_uri=https%3A%2F%2Fa.example%2Fcb%3Fx%3D1"
        );
    }

    #[test]
    fn test_authorizer_grant() {
        let open = OpenAccount::new("wxcomponent", "s", "t", "k");
        assert!(open.authorizer().is_none());
        open.set_authorizer_grant("wxauth", "refresh-1");
        assert_eq!(
            open.authorizer(),
            Some(Authorizer {
                app_id: "wxauth".into(),
                refresh_token: "refresh-1".into()
            })
        );
    }
}
