use std::collections::BTreeMap;

use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use crate::error::{GateError, GateResult};

/// Payment parameters keyed by name; iteration order is the signing order.
pub type SignParams = BTreeMap<String, String>;

/// Field carrying the signature inside a parameter map.
pub const SIGN_FIELD: &str = "sign";
/// Field selecting the digest used for the parameter signature.
pub const SIGN_TYPE_FIELD: &str = "sign_type";

/// Sorted-join SHA1: sort the inputs, concatenate without a delimiter and
/// return the lowercase hex digest.
///
/// Used for callback validation (`token`, `timestamp`, `nonce` and optionally
/// the encrypted payload) and for reply signing.
pub fn sha1_signature<S: AsRef<str>>(params: &[S]) -> String {
    let mut sorted: Vec<&str> = params.iter().map(AsRef::as_ref).collect();
    sorted.sort_unstable();
    let mut hasher = Sha1::new();
    for p in sorted {
        hasher.update(p.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Verify a sorted-join SHA1 signature.
pub fn verify_sha1_signature<S: AsRef<str>>(provided: &str, params: &[S]) -> GateResult<()> {
    let expected = sha1_signature(params);
    if constant_time_eq(provided, &expected) {
        Ok(())
    } else {
        Err(GateError::auth("signature mismatch"))
    }
}

/// SHA1 over the parts in the given order (no sorting), lowercase hex.
pub fn sha1_concat(parts: &[&[u8]]) -> String {
    let mut hasher = Sha1::new();
    for p in parts {
        hasher.update(p);
    }
    hex::encode(hasher.finalize())
}

/// Signature handed to the JS-SDK `wx.config` call.
pub fn js_sdk_signature(jsapi_ticket: &str, noncestr: &str, timestamp: i64, url: &str) -> String {
    let plain = format!(
        "jsapi_ticket={}&noncestr={}&timestamp={}&url={}",
        jsapi_ticket, noncestr, timestamp, url
    );
    sha1_signature(&[plain])
}

/// Digest used for payment parameter signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignType {
    #[default]
    Md5,
    Sha1,
}

impl SignType {
    /// Case-insensitive; anything other than `SHA1` selects MD5.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("SHA1") {
            SignType::Sha1
        } else {
            SignType::Md5
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignType::Md5 => "MD5",
            SignType::Sha1 => "SHA1",
        }
    }
}

/// Build the string that gets hashed for a parameter signature:
/// non-empty params sorted by key, joined as `k=v` with `&`, then `&key=<secret>`.
pub fn param_string(params: &SignParams, secret: &str) -> String {
    let mut joined = params
        .iter()
        .filter(|(k, v)| !v.is_empty() && k.as_str() != SIGN_FIELD)
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    if !joined.is_empty() {
        joined.push('&');
    }
    joined.push_str("key=");
    joined.push_str(secret);
    joined
}

/// MD5 yields uppercase hex, SHA1 lowercase hex.
pub fn sign_params(params: &SignParams, secret: &str, sign_type: SignType) -> String {
    let plain = param_string(params, secret);
    match sign_type {
        SignType::Md5 => format!("{:X}", md5::compute(plain.as_bytes())),
        SignType::Sha1 => sha1_concat(&[plain.as_bytes()]),
    }
}

/// Re-derive the signature of `params` (minus `sign`) and compare it with the
/// carried `sign` field. The digest follows `sign_type`, defaulting to MD5.
pub fn verify_params(params: &SignParams, secret: &str) -> GateResult<()> {
    let provided = params
        .get(SIGN_FIELD)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GateError::auth("missing sign field"))?;
    let sign_type = params
        .get(SIGN_TYPE_FIELD)
        .map(|s| SignType::parse(s))
        .unwrap_or_default();

    let expected = sign_params(params, secret, sign_type);
    if constant_time_eq(provided, &expected) {
        Ok(())
    } else {
        Err(GateError::auth("parameter signature mismatch"))
    }
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> SignParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_param_string_known_vector() {
        let p = params(&[("z", "222"), ("a", "1"), ("er", "6"), ("b", "dd")]);
        assert_eq!(param_string(&p, "999"), "a=1&b=dd&er=6&z=222&key=999");
    }

    #[test]
    fn test_param_string_drops_empty_values() {
        let p = params(&[("a", ""), ("b", "x"), ("c", "")]);
        assert_eq!(param_string(&p, "k"), "b=x&key=k");

        let none = params(&[("a", "")]);
        assert_eq!(param_string(&none, "k"), "key=k");
    }

    #[test]
    fn test_sign_params_digest_case() {
        let p = params(&[("a", "1"), ("b", "dd"), ("er", "6"), ("z", "222")]);
        let plain = "a=1&b=dd&er=6&z=222&key=999";

        let md5 = sign_params(&p, "999", SignType::Md5);
        assert_eq!(md5, format!("{:X}", md5::compute(plain)));
        assert_eq!(md5, md5.to_uppercase());

        let sha = sign_params(&p, "999", SignType::Sha1);
        assert_eq!(sha, sha1_concat(&[plain.as_bytes()]));
        assert_eq!(sha, sha.to_lowercase());
    }

    #[test]
    fn test_sha1_signature_known_value() {
        // sha1("abc")
        assert_eq!(
            sha1_signature(&["c", "a", "b"]),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_sha1_signature_deterministic_and_sensitive() {
        let a = sha1_signature(&["token", "1700000000", "nonce"]);
        let b = sha1_signature(&["nonce", "token", "1700000000"]);
        assert_eq!(a, b);

        let c = sha1_signature(&["token", "1700000001", "nonce"]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_verify_sha1_signature() {
        let sig = sha1_signature(&["t", "1", "n"]);
        assert!(verify_sha1_signature(&sig, &["t", "1", "n"]).is_ok());
        assert!(matches!(
            verify_sha1_signature(&sig, &["t", "2", "n"]),
            Err(GateError::Authentication(_))
        ));
    }

    #[test]
    fn test_verify_params_roundtrip_and_tamper() {
        let mut p = params(&[
            ("appid", "wx1"),
            ("mch_id", "10000100"),
            ("nonce_str", "abc"),
            ("total_fee", "100"),
            ("sign_type", "SHA1"),
        ]);
        let sign = sign_params(&p, "secret", SignType::Sha1);
        p.insert(SIGN_FIELD.into(), sign);
        assert!(verify_params(&p, "secret").is_ok());

        p.insert("total_fee".into(), "1".into());
        assert!(matches!(
            verify_params(&p, "secret"),
            Err(GateError::Authentication(_))
        ));
    }

    #[test]
    fn test_verify_params_requires_sign() {
        let p = params(&[("a", "1")]);
        assert!(verify_params(&p, "k").is_err());
    }

    #[test]
    fn test_js_sdk_signature_matches_sorted_join() {
        let sig = js_sdk_signature("ticket", "nonce", 1414587457, "http://mp.weixin.qq.com?params=value");
        let plain = "jsapi_ticket=ticket&noncestr=nonce&timestamp=1414587457&url=http://mp.weixin.qq.com?params=value";
        assert_eq!(sig, sha1_concat(&[plain.as_bytes()]));
    }

    #[test]
    fn test_sign_type_parse() {
        assert_eq!(SignType::parse("sha1"), SignType::Sha1);
        assert_eq!(SignType::parse("MD5"), SignType::Md5);
        assert_eq!(SignType::parse("HMAC-SHA256"), SignType::Md5);
    }
}
