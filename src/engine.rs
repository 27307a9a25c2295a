use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::accounts::open::COMPONENT_TICKET_TTL_SECS;
use crate::accounts::upstream::OPEN_BASE;
use crate::accounts::{
    Account, AccountContext, AccountKind, OpenAccount, UpstreamClient, ACCESS_TOKEN_KEY,
    COMPONENT_VERIFY_TICKET_KEY, JSAPI_TICKET_KEY,
};
use crate::codec::xml::{self, XmlMap};
use crate::envelope::{CallbackQuery, EnvelopeKeys, InboundMessage, Received};
use crate::error::{GateError, GateResult};
use crate::security::audit_log::AuditLogger;
use crate::security::cipher;
use crate::security::signature::js_sdk_signature;
use crate::security::token_cache::CredentialCache;
use crate::security::token_refresh::{injected_ttl, retry_once_on_expired};
use crate::utils::random_string;

/// Scope requested on the OAuth authorize page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OAuthScope {
    Base,
    #[default]
    Userinfo,
    /// Enterprise accounts need this to see the user's profile.
    Privateinfo,
}

impl OAuthScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthScope::Base => "snsapi_base",
            OAuthScope::Userinfo => "snsapi_userinfo",
            OAuthScope::Privateinfo => "snsapi_privateinfo",
        }
    }
}

/// Parameters for the JS-SDK `wx.config` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JsSign {
    #[serde(rename = "appid")]
    pub app_id: String,
    pub timestamp: i64,
    pub nonce_str: String,
    pub signature: String,
}

/// Outcome of the user OAuth flow.
#[derive(Debug, Clone, PartialEq)]
pub enum OAuthOutcome {
    /// Identity returned by the code exchange.
    Authorized(Value),
    /// Send the user to this authorize URL for a new code.
    Redirect(String),
}

/// Outcome of the component authorization flow.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenAuthorization {
    Authorized(Value),
    /// The administrator still has to visit this page.
    Redirect(String),
}

/// One platform account together with its credential cache and HTTP client.
///
/// Cheap to clone; clones share the cache.
#[derive(Debug, Clone)]
pub struct Engine {
    account: Arc<dyn Account>,
    ctx: AccountContext,
    redirect_domain: Option<String>,
    audit: AuditLogger,
}

impl Engine {
    pub fn new(account: Arc<dyn Account>, client: UpstreamClient) -> Self {
        let cache = CredentialCache::new(format!("{}|{}", account.app_id(), account.kind()));
        Self {
            account,
            ctx: AccountContext { client, cache },
            redirect_domain: None,
            audit: AuditLogger::new(),
        }
    }

    /// Prefix for relative OAuth callback URLs, e.g. behind a proxy.
    pub fn with_redirect_domain(mut self, domain: Option<String>) -> Self {
        self.redirect_domain = domain.map(|d| d.trim_end_matches('/').to_string());
        self
    }

    pub fn app_id(&self) -> &str {
        self.account.app_id()
    }

    pub fn kind(&self) -> AccountKind {
        self.account.kind()
    }

    pub fn account(&self) -> &Arc<dyn Account> {
        &self.account
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.ctx.cache
    }

    pub fn client(&self) -> &UpstreamClient {
        &self.ctx.client
    }

    pub fn keys(&self) -> EnvelopeKeys {
        EnvelopeKeys {
            app_id: self.account.app_id().to_string(),
            token: self.account.token().to_string(),
            encoding_aes_key: self.account.encoding_aes_key().to_string(),
        }
    }

    fn unsupported(&self, operation: &str) -> GateError {
        GateError::Unsupported {
            kind: self.kind().to_string(),
            operation: operation.to_string(),
        }
    }

    fn open_account(&self, operation: &str) -> GateResult<&OpenAccount> {
        self.account.as_open().ok_or_else(|| self.unsupported(operation))
    }

    pub async fn access_token(&self) -> GateResult<String> {
        let account = self.account.clone();
        let ctx = self.ctx.clone();
        let audit = self.audit.clone();
        self.ctx
            .cache
            .get_or_refresh(ACCESS_TOKEN_KEY, move || async move {
                match account.fetch_access_token(&ctx).await {
                    Ok(credential) => {
                        let refreshed = credential.into_refreshed();
                        audit.credential_refreshed(
                            account.app_id(),
                            ACCESS_TOKEN_KEY,
                            refreshed.ttl.num_seconds(),
                        );
                        Ok(refreshed)
                    }
                    Err(err) => {
                        audit.refresh_failed(account.app_id(), ACCESS_TOKEN_KEY, &err.to_string());
                        Err(err)
                    }
                }
            })
            .await
    }

    /// Seed the access token obtained elsewhere; cached for `expires_in - 60` s.
    pub fn set_access_token(&self, access_token: &str, expires_in: i64) {
        self.ctx
            .cache
            .set(ACCESS_TOKEN_KEY, access_token, injected_ttl(expires_in));
    }

    /// Seconds the cached access token stays usable; 0 when there is none.
    pub fn access_token_countdown(&self) -> i64 {
        self.ctx
            .cache
            .remaining(ACCESS_TOKEN_KEY)
            .map(|d| d.num_seconds())
            .unwrap_or(0)
    }

    /// Drop the cached access token, unless a concurrent caller has already
    /// replaced the one that was rejected.
    fn invalidate_access_token(&self, err: &GateError, rejected: Option<String>) {
        let Some(rejected) = rejected else { return };
        if self.ctx.cache.invalidate_if(ACCESS_TOKEN_KEY, &rejected) {
            self.audit
                .credential_invalidated(self.app_id(), ACCESS_TOKEN_KEY, err.code());
        }
    }

    /// Run `call` with the current access token. When upstream rejects that
    /// token it is invalidated and `call` runs once more with a fresh one.
    async fn with_token<T, F, Fut>(&self, call: F) -> GateResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = GateResult<T>>,
    {
        let used = Mutex::new(None::<String>);
        let (used, call) = (&used, &call);
        retry_once_on_expired(
            move || async move {
                let token = self.access_token().await?;
                *used.lock() = Some(token.clone());
                call(token).await
            },
            |err| self.invalidate_access_token(err, used.lock().take()),
        )
        .await
    }

    pub async fn jsapi_ticket(&self) -> GateResult<String> {
        let engine = self.clone();
        self.ctx
            .cache
            .get_or_refresh(JSAPI_TICKET_KEY, move || async move {
                let this = &engine;
                let credential = this
                    .with_token(move |token| async move {
                        this.account.fetch_ticket(&this.ctx, &token).await
                    })
                    .await;
                match credential {
                    Ok(credential) => {
                        let refreshed = credential.into_refreshed();
                        engine.audit.credential_refreshed(
                            engine.app_id(),
                            JSAPI_TICKET_KEY,
                            refreshed.ttl.num_seconds(),
                        );
                        Ok(refreshed)
                    }
                    Err(err) => {
                        engine
                            .audit
                            .refresh_failed(engine.app_id(), JSAPI_TICKET_KEY, &err.to_string());
                        Err(err)
                    }
                }
            })
            .await
    }

    pub fn set_jsapi_ticket(&self, ticket: &str, expires_in: i64) {
        self.ctx
            .cache
            .set(JSAPI_TICKET_KEY, ticket, injected_ttl(expires_in));
    }

    /// Sign `url` for the JS-SDK.
    pub async fn js_sign(&self, url: &str) -> GateResult<JsSign> {
        let ticket = self.jsapi_ticket().await?;
        let timestamp = Utc::now().timestamp();
        let nonce_str = random_string(16);
        let signature = js_sdk_signature(&ticket, &nonce_str, timestamp, url);
        Ok(JsSign {
            app_id: self.app_id().to_string(),
            timestamp,
            nonce_str,
            signature,
        })
    }

    /// GET `url` with the access token appended. An expired token is dropped
    /// and the call repeated once with a fresh one.
    pub async fn get_with_token(&self, url: &str, query: &[(&str, &str)]) -> GateResult<Value> {
        let client = &self.ctx.client;
        self.with_token(move |token| async move {
            let mut params = query.to_vec();
            params.push(("access_token", token.as_str()));
            client.get_json(url, &params).await
        })
        .await
    }

    /// POST a JSON body to `url` with the access token appended, retrying
    /// once on an expired token.
    pub async fn post_with_token(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: &Value,
    ) -> GateResult<Value> {
        let client = &self.ctx.client;
        self.with_token(move |token| async move {
            let mut params = query.to_vec();
            params.push(("access_token", token.as_str()));
            client.post_json(url, &params, body).await
        })
        .await
    }

    /// Wrap an inbound callback for validation and parsing.
    pub fn receive(&self, query: CallbackQuery, body: impl Into<Vec<u8>>) -> Received {
        Received::new(self.keys(), query, body)
    }

    /// Build the OAuth authorize URL that sends the user back to `callback`.
    ///
    /// `code`, `state` and `scope` left over from an earlier round trip are
    /// stripped from the callback. Relative callbacks are resolved against the
    /// configured redirect domain.
    pub fn oauth_redirect_url(
        &self,
        callback: &str,
        state: &str,
        scope: OAuthScope,
    ) -> GateResult<String> {
        if self.kind() == AccountKind::Weapp {
            return Err(self.unsupported("oauth redirect"));
        }
        let callback = match (&self.redirect_domain, callback.starts_with('/')) {
            (Some(domain), true) => format!("{domain}{callback}"),
            _ => callback.to_string(),
        };
        let callback = strip_oauth_params(&callback)?;

        let mut out = format!(
            "{OPEN_BASE}/connect/oauth2/authorize?appid={}",
            self.app_id()
        );
        if let Some(qy) = self.account.as_qy() {
            out.push_str("&agentid=");
            out.push_str(qy.agent_id.as_deref().unwrap_or_default());
        }
        out.push_str("&redirect_uri=");
        out.extend(url::form_urlencoded::byte_serialize(callback.as_bytes()));
        out.push_str("&response_type=code&scope=");
        out.push_str(scope.as_str());
        out.push_str("&state=");
        out.push_str(state);
        out.push_str("#wechat_redirect");
        Ok(out)
    }

    /// Exchange an OAuth code for the user's identity.
    pub async fn auth_info(&self, code: &str) -> GateResult<Value> {
        match self.kind() {
            AccountKind::Weapp => match self.account.as_weapp() {
                Some(weapp) => weapp.session_key(&self.ctx, code).await,
                None => Err(self.unsupported("auth info")),
            },
            AccountKind::Qy => {
                let url = self.ctx.client.qy_url("/cgi-bin/user/getuserinfo");
                let mut json = self.get_with_token(&url, &[("code", code)]).await?;
                let openid = json.get("OpenId").cloned().unwrap_or(Value::Null);
                let token = self.access_token().await?;
                if let Some(obj) = json.as_object_mut() {
                    obj.insert("openid".into(), openid);
                    obj.insert("access_token".into(), Value::String(token));
                }
                Ok(json)
            }
            AccountKind::Open => Err(self.unsupported("auth info")),
            AccountKind::Mp => {
                let url = self.ctx.client.api_url("/sns/oauth2/access_token");
                self.ctx
                    .client
                    .get_json(
                        &url,
                        &[
                            ("appid", self.app_id()),
                            ("secret", self.account.secret()),
                            ("code", code),
                            ("grant_type", "authorization_code"),
                        ],
                    )
                    .await
            }
        }
    }

    /// Profile of an OAuth-authorized user, fetched with the user's own token.
    ///
    /// Enterprise accounts take the `user_ticket` from the code exchange in
    /// place of `openid`.
    pub async fn auth_user_info(&self, openid: &str, auth_access_token: &str) -> GateResult<Value> {
        match self.kind() {
            AccountKind::Qy => {
                let url = self.ctx.client.qy_url("/cgi-bin/user/getuserdetail");
                self.ctx
                    .client
                    .post_json(
                        &url,
                        &[("access_token", auth_access_token)],
                        &serde_json::json!({ "user_ticket": openid }),
                    )
                    .await
            }
            AccountKind::Weapp => Err(self.unsupported("auth user info")),
            AccountKind::Mp | AccountKind::Open => {
                let url = self.ctx.client.api_url("/sns/userinfo");
                self.ctx
                    .client
                    .get_json(
                        &url,
                        &[("access_token", auth_access_token), ("openid", openid)],
                    )
                    .await
            }
        }
    }

    /// One step of the user OAuth flow for a request that came in at
    /// `callback`.
    ///
    /// Without a `code`, or with one the platform refuses as missing, used or
    /// unknown, the user is redirected to the authorize page. Other exchange
    /// failures are returned.
    pub async fn authorize(
        &self,
        callback: &str,
        code: Option<&str>,
        state: &str,
        scope: OAuthScope,
    ) -> GateResult<OAuthOutcome> {
        let code = code.filter(|c| !c.is_empty());
        let Some(code) = code else {
            return self
                .oauth_redirect_url(callback, state, scope)
                .map(OAuthOutcome::Redirect);
        };
        match self.auth_info(code).await {
            Ok(info) => Ok(OAuthOutcome::Authorized(info)),
            Err(err) if err.is_stale_oauth_code() => {
                debug!(app_id = %self.app_id(), code = err.code(), "oauth code refused, redirecting");
                self.oauth_redirect_url(callback, state, scope)
                    .map(OAuthOutcome::Redirect)
            }
            Err(err) => Err(err),
        }
    }

    /// Decrypt a raw component verify ticket push and cache the ticket.
    pub fn component_verify_ticket(&self, raw: &[u8]) -> GateResult<String> {
        let open = self.open_account("component verify ticket")?;
        let outer = xml::decode(raw)?;
        let encrypt = outer
            .get("Encrypt")
            .ok_or_else(|| GateError::malformed("ticket push has no Encrypt element"))?;
        let frame = cipher::decrypt_message(encrypt, &open.encoding_aes_key).map_err(|err| {
            self.audit.decrypt_failed(self.app_id(), &err.to_string());
            err
        })?;
        if frame.receiver_id != open.app_id.as_bytes() {
            return Err(GateError::auth("appid mismatch"));
        }
        self.store_component_ticket(&xml::decode(&frame.msg)?)
    }

    /// Cache the ticket carried by an already authenticated push.
    pub fn accept_component_ticket(&self, msg: &InboundMessage) -> GateResult<String> {
        let open = self.open_account("component verify ticket")?;
        if msg.receiver_id.as_deref() != Some(open.app_id.as_str()) {
            return Err(GateError::auth("appid mismatch"));
        }
        self.store_component_ticket(&msg.fields)
    }

    fn store_component_ticket(&self, fields: &XmlMap) -> GateResult<String> {
        let ticket = fields
            .get("ComponentVerifyTicket")
            .filter(|t| !t.is_empty())
            .cloned()
            .ok_or_else(|| GateError::malformed("push carries no ComponentVerifyTicket"))?;
        debug!(app_id = %self.app_id(), "component verify ticket received");
        self.ctx.cache.set(
            COMPONENT_VERIFY_TICKET_KEY,
            ticket.clone(),
            Duration::seconds(COMPONENT_TICKET_TTL_SECS),
        );
        self.audit.component_ticket_received(self.app_id());
        Ok(ticket)
    }

    pub async fn component_access_token(&self) -> GateResult<String> {
        self.open_account("component access token")?
            .component_access_token(&self.ctx)
            .await
    }

    /// Finish the component authorization flow, or say where to send the
    /// administrator when there is no usable `auth_code`.
    pub async fn component_query_auth(
        &self,
        auth_code: &str,
        redirect_uri: &str,
    ) -> GateResult<OpenAuthorization> {
        let open = self.open_account("component authorization")?;
        if !auth_code.is_empty() {
            match open.query_auth(&self.ctx, auth_code).await {
                Ok(json) => {
                    if let Some(info) = json.get("authorization_info") {
                        self.seed_authorizer(info);
                    }
                    return Ok(OpenAuthorization::Authorized(json));
                }
                Err(err) => {
                    debug!(error = %err, "authorization code rejected, restarting flow");
                }
            }
        }
        let pre_auth_code = open.pre_auth_code(&self.ctx).await?;
        Ok(OpenAuthorization::Redirect(
            open.authorization_url(&pre_auth_code, redirect_uri),
        ))
    }

    fn seed_authorizer(&self, info: &Value) {
        let field = |name: &str| info.get(name).and_then(Value::as_str).unwrap_or_default();
        let expires_in = info.get("expires_in").and_then(Value::as_i64).unwrap_or(0);
        if let Err(err) = self.set_authorizer(
            field("authorizer_appid"),
            field("authorizer_access_token"),
            field("authorizer_refresh_token"),
            expires_in,
        ) {
            debug!(error = %err, "authorization info incomplete");
        }
    }

    /// Act on behalf of `authorizer_app_id` with an existing grant.
    pub fn set_authorizer(
        &self,
        authorizer_app_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_in: i64,
    ) -> GateResult<()> {
        let open = self.open_account("set authorizer")?;
        if authorizer_app_id.is_empty() || refresh_token.is_empty() {
            return Err(GateError::malformed("authorizer app id and refresh token are required"));
        }
        open.set_authorizer_grant(authorizer_app_id, refresh_token);
        if !access_token.is_empty() {
            self.set_access_token(access_token, expires_in);
        }
        Ok(())
    }
}

/// Drop `code`, `state` and `scope` from a callback URL's query.
pub fn strip_oauth_params(callback: &str) -> GateResult<String> {
    let mut url = Url::parse(callback)
        .map_err(|e| GateError::malformed(format!("invalid callback url {callback:?}: {e}")))?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !matches!(k.as_ref(), "code" | "state" | "scope"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }
    Ok(url.to_string())
}
