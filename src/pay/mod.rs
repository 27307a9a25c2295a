//! Merchant payments: request signing, notifications and order calls.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use tracing::debug;

use crate::accounts::UpstreamClient;
use crate::codec::xml::{self, XmlMap};
use crate::codec::xml_tree::{self, XmlValue};
use crate::error::{GateError, GateResult};
use crate::security::audit_log::AuditLogger;
use crate::security::cipher::{self, UnpadPolicy};
use crate::security::signature::{
    sign_params, verify_params, SignParams, SignType, SIGN_FIELD, SIGN_TYPE_FIELD,
};
use crate::security::token_cache::{CredentialCache, Refreshed};
use crate::utils::random_string;

pub mod order;

pub use order::{OrderRef, PayOrder, RefundOrder};

/// Acknowledgement for an accepted notification.
pub const NOTIFY_SUCCESS: &str =
    "<xml><return_code><![CDATA[SUCCESS]]></return_code><return_msg><![CDATA[OK]]></return_msg></xml>";

const SANDBOX_KEY: &str = "sandbox_signkey";
const SANDBOX_KEY_TTL_SECS: i64 = 24 * 3600;

/// Rejection sent back for a notification that failed to decode or verify.
pub fn notify_failure(message: &str) -> String {
    format!(
        "<xml><return_code><![CDATA[FAIL]]></return_code><return_msg><![CDATA[{}]]></return_msg></xml>",
        message.replace("]]>", "]]]]><![CDATA[>")
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Unknown,
    Pay,
    Refund,
}

/// Decoded notification plus the body to answer it with.
#[derive(Debug, Clone)]
pub struct NotifyResult {
    pub kind: NotifyKind,
    pub data: XmlMap,
    /// Always [`NOTIFY_SUCCESS`] or a [`notify_failure`] body.
    pub response: String,
    pub error: Option<GateError>,
}

impl NotifyResult {
    pub fn is_accepted(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Pay {
    mch_id: String,
    key: String,
    sandbox: bool,
    refund_unpad: UnpadPolicy,
    client: UpstreamClient,
    cache: CredentialCache,
    audit: AuditLogger,
}

impl Pay {
    pub fn new(mch_id: impl Into<String>, key: impl Into<String>, client: UpstreamClient) -> Self {
        let mch_id = mch_id.into();
        Self {
            cache: CredentialCache::new(format!("{mch_id}|pay")),
            mch_id,
            key: key.into(),
            sandbox: false,
            refund_unpad: UnpadPolicy::default(),
            client,
            audit: AuditLogger::new(),
        }
    }

    pub fn sandbox(mut self, enable: bool) -> Self {
        self.sandbox = enable;
        self
    }

    /// Unpadding applied to decrypted refund payloads.
    pub fn refund_unpad(mut self, policy: UnpadPolicy) -> Self {
        self.refund_unpad = policy;
        self
    }

    pub fn mch_id(&self) -> &str {
        &self.mch_id
    }

    pub fn is_sandbox(&self) -> bool {
        self.sandbox
    }

    /// Key that signs requests: the merchant key, or the sandbox key when
    /// sandbox mode is on.
    pub async fn signing_key(&self) -> GateResult<String> {
        if !self.sandbox {
            return Ok(self.key.clone());
        }
        let this = self.clone();
        self.cache
            .get_or_refresh(SANDBOX_KEY, move || async move {
                let key = this.sandbox_sign_key().await?;
                Ok(Refreshed::new(key, Duration::seconds(SANDBOX_KEY_TTL_SECS)))
            })
            .await
    }

    /// Ask the sandbox for its signing key.
    pub async fn sandbox_sign_key(&self) -> GateResult<String> {
        let mut params = SignParams::new();
        params.insert("mch_id".into(), self.mch_id.clone());
        params.insert("nonce_str".into(), random_string(16));
        params.insert(SIGN_TYPE_FIELD.into(), SignType::Md5.as_str().into());
        let sign = sign_params(&params, &self.key, SignType::Md5);
        params.insert(SIGN_FIELD.into(), sign);

        let url = self.client.mch_url("/sandboxnew/pay/getsignkey");
        let body = self.client.post_xml(&url, xml::encode(&params)?).await?;
        let data = xml::decode(&body)?;
        check_return(
            data.get("return_code").map(String::as_str),
            Some("SUCCESS"),
            None,
            data.get("return_msg").map(String::as_str),
        )?;
        data.get("sandbox_signkey")
            .filter(|k| !k.is_empty())
            .cloned()
            .ok_or_else(|| GateError::RefreshFailed("sandbox sign key missing".into()))
    }

    /// Sign `params` with the active key; the digest follows their `sign_type`.
    pub async fn sign(&self, params: &SignParams) -> GateResult<String> {
        let sign_type = params
            .get(SIGN_TYPE_FIELD)
            .map(|s| SignType::parse(s))
            .unwrap_or_default();
        Ok(sign_params(params, &self.signing_key().await?, sign_type))
    }

    /// Handle a payment or refund notification.
    ///
    /// A `req_info` field marks a refund: it is decrypted and merged into
    /// `data`. Otherwise the body is a payment result and must carry a valid
    /// parameter signature.
    pub async fn notify(&self, raw: &[u8]) -> NotifyResult {
        let mut result = NotifyResult {
            kind: NotifyKind::Unknown,
            data: XmlMap::new(),
            response: String::new(),
            error: None,
        };
        match self.process_notify(raw, &mut result).await {
            Ok(()) => result.response = NOTIFY_SUCCESS.to_string(),
            Err(err) => {
                self.audit.pay_notify_rejected(&self.mch_id, &err.to_string());
                result.response = notify_failure(&err.to_string());
                result.error = Some(err);
            }
        }
        result
    }

    async fn process_notify(&self, raw: &[u8], result: &mut NotifyResult) -> GateResult<()> {
        let mut data = xml::decode(raw)?;
        let success = data.get("return_code").map(String::as_str) == Some("SUCCESS");
        let key = self.signing_key().await?;

        let req_info = data.get("req_info").filter(|v| !v.is_empty()).cloned();
        match req_info {
            Some(info) => {
                result.kind = NotifyKind::Refund;
                // the encrypted payload authenticates a refund; the outer sign is optional
                if success && data.contains_key(SIGN_FIELD) {
                    verify_params(&data, &key)?;
                }
                let plain =
                    cipher::ecb_decrypt(&info, cipher::refund_key(&key).as_bytes(), self.refund_unpad)?;
                let refund = xml::decode(&plain)?;
                if refund.is_empty() {
                    return Err(GateError::malformed("refund payload carries no fields"));
                }
                data.extend(refund);
                data.remove("req_info");
                debug!(mch_id = %self.mch_id, "refund notification decrypted");
            }
            None => {
                result.kind = NotifyKind::Pay;
                if success {
                    verify_params(&data, &key)?;
                }
            }
        }
        result.data = data;
        Ok(())
    }

    async fn signed_request(&self, path: &str, mut params: SignParams) -> GateResult<Vec<u8>> {
        params.insert("mch_id".into(), self.mch_id.clone());
        let sign = self.sign(&params).await?;
        params.insert(SIGN_FIELD.into(), sign);

        let path = if self.sandbox {
            format!("/sandboxnew{path}")
        } else {
            path.to_string()
        };
        let url = self.client.mch_url(&path);
        self.client.post_xml(&url, xml::encode(&params)?).await
    }

    /// Place an order; returns the `prepay_id`.
    pub async fn unified_order(
        &self,
        app_id: &str,
        order: &PayOrder,
        notify_url: &str,
    ) -> GateResult<String> {
        let mut params = order.to_params();
        params.insert("appid".into(), app_id.into());
        params.insert("notify_url".into(), notify_url.into());
        let data = pay_response(&self.signed_request("/pay/unifiedorder", params).await?)?;
        Ok(data.get("prepay_id").cloned().unwrap_or_default())
    }

    /// Request a refund; returns the `refund_id`.
    pub async fn refund(
        &self,
        app_id: &str,
        order: &RefundOrder,
        notify_url: &str,
    ) -> GateResult<String> {
        let mut params = order.to_params();
        params.insert("appid".into(), app_id.into());
        params.insert("notify_url".into(), notify_url.into());
        let path = if self.sandbox {
            "/pay/refund"
        } else {
            "/secapi/pay/refund"
        };
        let data = pay_response(&self.signed_request(path, params).await?)?;
        Ok(data.get("refund_id").cloned().unwrap_or_default())
    }

    /// Look an order up; the response may nest (coupon and goods details).
    pub async fn order_query(
        &self,
        app_id: &str,
        order: &OrderRef,
    ) -> GateResult<BTreeMap<String, XmlValue>> {
        if order.value().is_empty() {
            return Err(GateError::malformed("out_trade_no or transaction_id is required"));
        }
        let mut params = SignParams::new();
        params.insert("appid".into(), app_id.into());
        params.insert("nonce_str".into(), random_string(32));
        params.insert(SIGN_TYPE_FIELD.into(), SignType::Md5.as_str().into());
        params.insert(order.field().into(), order.value().into());

        let body = self.signed_request("/pay/orderquery", params).await?;
        let doc = xml_tree::decode(&body)?;
        let text = |k: &str| doc.get(k).and_then(XmlValue::as_text);
        check_return(
            text("return_code"),
            text("result_code"),
            text("err_code_des"),
            text("return_msg"),
        )?;
        Ok(doc)
    }

    /// Parameters for the JSAPI `chooseWXPay` call.
    pub fn js_pay_params(&self, app_id: &str, prepay_id: &str) -> BTreeMap<String, String> {
        let mut data = SignParams::new();
        data.insert("appId".into(), app_id.into());
        data.insert("timeStamp".into(), Utc::now().timestamp().to_string());
        data.insert("nonceStr".into(), random_string(16));
        data.insert("package".into(), format!("prepay_id={prepay_id}"));
        data.insert("signType".into(), SignType::Md5.as_str().into());
        let sign = sign_params(&data, &self.key, SignType::Md5);
        data.insert("paySign".into(), sign);
        data
    }
}

/// Accept a merchant API response only when both codes report success.
fn check_return(
    return_code: Option<&str>,
    result_code: Option<&str>,
    err_code_des: Option<&str>,
    return_msg: Option<&str>,
) -> GateResult<()> {
    if return_code == Some("SUCCESS") {
        if let Some(code) = result_code.filter(|c| !c.is_empty() && *c != "FAIL") {
            debug!(result_code = code, "merchant call succeeded");
            return Ok(());
        }
    }
    let message = err_code_des
        .or(return_msg)
        .filter(|m| !m.is_empty())
        .unwrap_or("unknown error");
    Err(GateError::Upstream {
        code: -1,
        message: message.to_string(),
    })
}

fn pay_response(body: &[u8]) -> GateResult<XmlMap> {
    let data = xml::decode(body)?;
    let get = |k: &str| data.get(k).map(String::as_str);
    check_return(
        get("return_code"),
        get("result_code"),
        get("err_code_des"),
        get("return_msg"),
    )?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::UpstreamHosts;

    const KEY: &str = "192006250b4c09247ec02edce69f6a2d";

    fn pay() -> Pay {
        let client =
            UpstreamClient::new(UpstreamHosts::default(), std::time::Duration::from_secs(1)).unwrap();
        Pay::new("10000100", KEY, client)
    }

    fn signed_pay_notify() -> XmlMap {
        let mut data = XmlMap::new();
        for (k, v) in [
            ("appid", "wx2421b1c4370ec43b"),
            ("mch_id", "10000100"),
            ("nonce_str", "5d2b6c2a8db53831f7eda20af46e531c"),
            ("out_trade_no", "1409811653"),
            ("result_code", "SUCCESS"),
            ("return_code", "SUCCESS"),
            ("total_fee", "1"),
            ("transaction_id", "1004400740201409030005092168"),
        ] {
            data.insert(k.into(), v.into());
        }
        let sign = sign_params(&data, KEY, SignType::Md5);
        data.insert(SIGN_FIELD.into(), sign);
        data
    }

    #[tokio::test]
    async fn test_notify_accepts_valid_payment() {
        let raw = xml::encode(&signed_pay_notify()).unwrap();
        let result = pay().notify(raw.as_bytes()).await;

        assert!(result.is_accepted(), "{:?}", result.error);
        assert_eq!(result.kind, NotifyKind::Pay);
        assert_eq!(result.response, NOTIFY_SUCCESS);
        assert_eq!(result.data["out_trade_no"], "1409811653");
    }

    #[tokio::test]
    async fn test_notify_rejects_tampered_payment() {
        let mut data = signed_pay_notify();
        data.insert("total_fee".into(), "100".into());
        let raw = xml::encode(&data).unwrap();

        let result = pay().notify(raw.as_bytes()).await;
        assert!(matches!(result.error, Some(GateError::Authentication(_))));
        assert!(result.response.contains("<return_code><![CDATA[FAIL]]></return_code>"));
        assert!(result.data.is_empty());
    }

    #[tokio::test]
    async fn test_notify_rejects_unsigned_payment() {
        let mut data = signed_pay_notify();
        data.remove(SIGN_FIELD);
        let raw = xml::encode(&data).unwrap();
        assert!(!pay().notify(raw.as_bytes()).await.is_accepted());
    }

    #[tokio::test]
    async fn test_notify_decrypts_refund() {
        let inner = "<root><out_refund_no>R1</out_refund_no><refund_status>SUCCESS</refund_status></root>";
        let req_info =
            cipher::ecb_encrypt(inner.as_bytes(), cipher::refund_key(KEY).as_bytes()).unwrap();
        let raw = format!(
            "<xml><return_code>SUCCESS</return_code><appid>wx1</appid><mch_id>10000100</mch_id>\
             <req_info><![CDATA[{req_info}]]></req_info></xml>"
        );

        let result = pay().notify(raw.as_bytes()).await;
        assert!(result.is_accepted(), "{:?}", result.error);
        assert_eq!(result.kind, NotifyKind::Refund);
        assert_eq!(result.data["out_refund_no"], "R1");
        assert_eq!(result.data["refund_status"], "SUCCESS");
        assert!(!result.data.contains_key("req_info"));
    }

    #[tokio::test]
    async fn test_notify_refund_with_wrong_key_fails() {
        let req_info = cipher::ecb_encrypt(b"<root><a>1</a></root>", [1u8; 32].as_slice()).unwrap();
        let raw = format!("<xml><return_code>SUCCESS</return_code><req_info>{req_info}</req_info></xml>");
        let result = pay().notify(raw.as_bytes()).await;
        assert_eq!(result.kind, NotifyKind::Refund);
        assert!(!result.is_accepted());
        assert!(result.response.starts_with("<xml><return_code><![CDATA[FAIL]]>"));
    }

    #[tokio::test]
    async fn test_notify_malformed_body() {
        let result = pay().notify(b"").await;
        assert_eq!(result.kind, NotifyKind::Unknown);
        assert!(matches!(result.error, Some(GateError::MalformedInput(_))));
    }

    #[test]
    fn test_notify_failure_escapes_cdata_end() {
        let body = notify_failure("bad ]]> input");
        assert_eq!(
            xml::decode(body.as_bytes()).unwrap()["return_msg"],
            "bad ]]> input"
        );
    }

    #[test]
    fn test_check_return() {
        assert!(check_return(Some("SUCCESS"), Some("SUCCESS"), None, None).is_ok());
        assert_eq!(
            check_return(Some("SUCCESS"), Some("FAIL"), Some("ORDERPAID"), Some("OK")),
            Err(GateError::Upstream {
                code: -1,
                message: "ORDERPAID".into()
            })
        );
        assert_eq!(
            check_return(Some("FAIL"), None, None, Some("sign error")).unwrap_err().to_string(),
            "upstream error -1: sign error"
        );
    }

    #[test]
    fn test_js_pay_params_signed() {
        let params = pay().js_pay_params("wx1", "wx201410272009395522657a690389285100");
        assert_eq!(params["package"], "prepay_id=wx201410272009395522657a690389285100");
        let mut unsigned = params.clone();
        let sign = unsigned.remove("paySign").unwrap();
        assert_eq!(sign, sign_params(&unsigned, KEY, SignType::Md5));
    }

    #[tokio::test]
    async fn test_sign_follows_sign_type() {
        let mut p = SignParams::new();
        p.insert("a".into(), "1".into());
        p.insert(SIGN_TYPE_FIELD.into(), "SHA1".into());
        assert_eq!(pay().sign(&p).await.unwrap(), sign_params(&p, KEY, SignType::Sha1));
    }
}
