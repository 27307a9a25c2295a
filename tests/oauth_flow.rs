use std::sync::Arc;
use std::time::Duration;

use mockito::{Matcher, Server};
use serde_json::json;
use wxgate::accounts::{MpAccount, QyAccount, UpstreamClient, UpstreamHosts};
use wxgate::engine::{Engine, OAuthOutcome, OAuthScope};
use wxgate::error::GateError;

const CALLBACK: &str = "https://app.example.com/login?code=old&from=menu";

fn client(base: &str) -> UpstreamClient {
    UpstreamClient::new(
        UpstreamHosts {
            api_base: base.to_string(),
            qy_api_base: base.to_string(),
            mch_api_base: base.to_string(),
        },
        Duration::from_secs(5),
    )
    .unwrap()
}

fn mp_engine(base: &str) -> Engine {
    Engine::new(
        Arc::new(MpAccount {
            app_id: "wxmp".into(),
            app_secret: "mp-secret".into(),
            token: "tok".into(),
            encoding_aes_key: String::new(),
        }),
        client(base),
    )
}

fn assert_redirect(outcome: OAuthOutcome) {
    let OAuthOutcome::Redirect(url) = outcome else {
        panic!("expected a redirect, got {outcome:?}");
    };
    assert!(url.contains("/connect/oauth2/authorize?appid=wxmp"), "{url}");
    assert!(url.contains("scope=snsapi_userinfo&state=st"), "{url}");
    // the stale code from the previous round trip is not sent back
    assert!(!url.contains("code%3Dold"), "{url}");
    assert!(url.contains("from%3Dmenu"), "{url}");
}

#[tokio::test]
async fn mp_user_info_uses_oauth_token() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/sns/userinfo")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("access_token".into(), "user-tok".into()),
            Matcher::UrlEncoded("openid".into(), "o_user".into()),
        ]))
        .with_status(200)
        .with_body(json!({"openid": "o_user", "nickname": "n"}).to_string())
        .expect(1)
        .create_async()
        .await;

    let info = mp_engine(&server.url())
        .auth_user_info("o_user", "user-tok")
        .await
        .unwrap();
    assert_eq!(info["nickname"], "n");
    mock.assert_async().await;
}

#[tokio::test]
async fn qy_user_detail_posts_ticket() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/cgi-bin/user/getuserdetail")
        .match_query(Matcher::UrlEncoded("access_token".into(), "corp-user-tok".into()))
        .match_body(Matcher::PartialJson(json!({"user_ticket": "ticket-1"})))
        .with_status(200)
        .with_body(json!({"errcode": 0, "userid": "zhangsan", "mobile": "130"}).to_string())
        .expect(1)
        .create_async()
        .await;

    let engine = Engine::new(
        Arc::new(QyAccount {
            corp_id: "wwcorp".into(),
            secret: "corp-secret".into(),
            ..QyAccount::default()
        }),
        client(&server.url()),
    );
    let info = engine
        .auth_user_info("ticket-1", "corp-user-tok")
        .await
        .unwrap();
    assert_eq!(info["userid"], "zhangsan");
    mock.assert_async().await;
}

#[tokio::test]
async fn missing_code_redirects_to_authorize() {
    let engine = mp_engine("http://127.0.0.1:9");
    let outcome = engine
        .authorize(CALLBACK, None, "st", OAuthScope::Userinfo)
        .await
        .unwrap();
    assert_redirect(outcome);

    let outcome = engine
        .authorize(CALLBACK, Some(""), "st", OAuthScope::Userinfo)
        .await
        .unwrap();
    assert_redirect(outcome);
}

#[tokio::test]
async fn used_code_redirects_for_a_new_one() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/sns/oauth2/access_token")
        .match_query(Matcher::UrlEncoded("code".into(), "used".into()))
        .with_status(200)
        .with_body(json!({"errcode": 40163, "errmsg": "code been used"}).to_string())
        .expect(1)
        .create_async()
        .await;

    let outcome = mp_engine(&server.url())
        .authorize(CALLBACK, Some("used"), "st", OAuthScope::Userinfo)
        .await
        .unwrap();
    assert_redirect(outcome);
    mock.assert_async().await;
}

#[tokio::test]
async fn valid_code_is_exchanged() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/sns/oauth2/access_token")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("appid".into(), "wxmp".into()),
            Matcher::UrlEncoded("secret".into(), "mp-secret".into()),
            Matcher::UrlEncoded("code".into(), "fresh".into()),
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
        ]))
        .with_status(200)
        .with_body(
            json!({"access_token": "user-tok", "openid": "o_user", "scope": "snsapi_userinfo"})
                .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let outcome = mp_engine(&server.url())
        .authorize(CALLBACK, Some("fresh"), "st", OAuthScope::Userinfo)
        .await
        .unwrap();
    let OAuthOutcome::Authorized(info) = outcome else {
        panic!("expected authorization, got {outcome:?}");
    };
    assert_eq!(info["openid"], "o_user");
    mock.assert_async().await;
}

#[tokio::test]
async fn other_exchange_errors_are_returned() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("GET", "/sns/oauth2/access_token")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({"errcode": 40125, "errmsg": "invalid appsecret"}).to_string())
        .create_async()
        .await;

    let err = mp_engine(&server.url())
        .authorize(CALLBACK, Some("fresh"), "st", OAuthScope::Userinfo)
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::Upstream { code: 40125, .. }));
}
