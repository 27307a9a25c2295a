use std::time::Duration;

use mockito::{Matcher, Server};
use wxgate::accounts::{UpstreamClient, UpstreamHosts};
use wxgate::codec::xml_tree::XmlValue;
use wxgate::error::GateError;
use wxgate::pay::order::{OrderRef, PayOrder, RefundOrder};
use wxgate::pay::Pay;

fn pay(base: &str) -> Pay {
    let client = UpstreamClient::new(
        UpstreamHosts {
            mch_api_base: base.to_string(),
            ..UpstreamHosts::default()
        },
        Duration::from_secs(5),
    )
    .unwrap();
    Pay::new("10000100", "merchant-key", client)
}

#[tokio::test]
async fn unified_order_returns_prepay_id() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/pay/unifiedorder")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex("<mch_id>10000100</mch_id>".into()),
            Matcher::Regex("<appid>wxapp</appid>".into()),
            Matcher::Regex("<sign>".into()),
        ]))
        .with_status(200)
        .with_body(
            "<xml><return_code>SUCCESS</return_code><result_code>SUCCESS</result_code>\
             <prepay_id>wx201410272009395522657a690389285100</prepay_id></xml>",
        )
        .expect(1)
        .create_async()
        .await;

    let order = PayOrder::new("o_user", 1, "127.0.0.1", "coffee");
    let prepay_id = pay(&server.url())
        .unified_order("wxapp", &order, "https://shop.example.com/notify")
        .await
        .unwrap();
    assert_eq!(prepay_id, "wx201410272009395522657a690389285100");
    mock.assert_async().await;
}

#[tokio::test]
async fn business_failure_surfaces_description() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/pay/unifiedorder")
        .with_status(200)
        .with_body(
            "<xml><return_code>SUCCESS</return_code><result_code>FAIL</result_code>\
             <err_code_des>order paid</err_code_des></xml>",
        )
        .create_async()
        .await;

    let order = PayOrder::new("o_user", 1, "127.0.0.1", "coffee");
    let err = pay(&server.url())
        .unified_order("wxapp", &order, "https://shop.example.com/notify")
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::Upstream { ref message, .. } if message == "order paid"));
}

#[tokio::test]
async fn sandbox_signs_with_fetched_key() {
    let mut server = Server::new_async().await;
    let key = server
        .mock("POST", "/sandboxnew/pay/getsignkey")
        .with_status(200)
        .with_body(
            "<xml><return_code>SUCCESS</return_code><return_msg>ok</return_msg>\
             <sandbox_signkey>sandbox-key</sandbox_signkey></xml>",
        )
        .expect(1)
        .create_async()
        .await;
    let refund = server
        .mock("POST", "/sandboxnew/pay/refund")
        .with_status(200)
        .with_body(
            "<xml><return_code>SUCCESS</return_code><result_code>SUCCESS</result_code>\
             <refund_id>50000000382019052709732678859</refund_id></xml>",
        )
        .expect(2)
        .create_async()
        .await;

    let pay = pay(&server.url()).sandbox(true);
    assert_eq!(pay.signing_key().await.unwrap(), "sandbox-key");

    let order = RefundOrder::new(100, 100, OrderRef::OutTradeNo("trade-1".into()));
    for _ in 0..2 {
        let refund_id = pay
            .refund("wxapp", &order, "https://shop.example.com/refund")
            .await
            .unwrap();
        assert_eq!(refund_id, "50000000382019052709732678859");
    }

    key.assert_async().await;
    refund.assert_async().await;
}

#[tokio::test]
async fn order_query_keeps_nested_fields() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/pay/orderquery")
        .match_body(Matcher::Regex("<transaction_id>".into()))
        .with_status(200)
        .with_body(
            "<xml><return_code>SUCCESS</return_code><result_code>SUCCESS</result_code>\
             <trade_state>SUCCESS</trade_state>\
             <detail><goods_id>g1</goods_id><quantity>2</quantity></detail></xml>",
        )
        .create_async()
        .await;

    let doc = pay(&server.url())
        .order_query("wxapp", &OrderRef::TransactionId("4200000001".into()))
        .await
        .unwrap();
    assert_eq!(doc["trade_state"], XmlValue::text("SUCCESS"));
    assert_eq!(
        doc["detail"].get("goods_id").and_then(XmlValue::as_text),
        Some("g1")
    );
}

#[tokio::test]
async fn order_query_requires_reference() {
    let err = pay("http://127.0.0.1:9")
        .order_query("wxapp", &OrderRef::OutTradeNo(String::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::MalformedInput(_)));
}
