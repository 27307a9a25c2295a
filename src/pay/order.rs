use chrono::Utc;

use crate::security::signature::{SignParams, SignType};
use crate::utils::random_string;

/// Trade number: 12 hex chars derived from `seed`, the unix time, 10 random chars.
fn trade_number(seed: &str) -> String {
    let digest = format!("{:x}", md5::compute(seed.as_bytes()));
    format!("{}{}{}", &digest[..12], Utc::now().timestamp(), random_string(10))
}

fn insert_non_empty(params: &mut SignParams, key: &str, value: &str) {
    if !value.is_empty() {
        params.insert(key.to_string(), value.to_string());
    }
}

/// JSAPI payment order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayOrder {
    pub device_info: String,
    pub nonce_str: String,
    pub sign_type: SignType,
    pub body: String,
    pub out_trade_no: String,
    pub fee_type: String,
    pub total_fee: u64,
    pub spbill_create_ip: String,
    pub trade_type: String,
    pub openid: String,
}

impl PayOrder {
    pub fn new(openid: &str, total_fee: u64, ip: &str, body: &str) -> Self {
        Self {
            device_info: "WEB".into(),
            nonce_str: random_string(16),
            sign_type: SignType::Md5,
            body: body.into(),
            out_trade_no: trade_number(openid),
            fee_type: "CNY".into(),
            total_fee,
            spbill_create_ip: ip.into(),
            trade_type: "JSAPI".into(),
            openid: openid.into(),
        }
    }

    pub fn with_trade_type(mut self, trade_type: &str) -> Self {
        self.trade_type = trade_type.into();
        self
    }

    pub fn with_device_info(mut self, device_info: &str) -> Self {
        self.device_info = device_info.into();
        self
    }

    pub fn with_out_trade_no(mut self, out_trade_no: &str) -> Self {
        self.out_trade_no = out_trade_no.into();
        self
    }

    pub fn out_trade_no(&self) -> &str {
        &self.out_trade_no
    }

    pub fn to_params(&self) -> SignParams {
        let mut p = SignParams::new();
        insert_non_empty(&mut p, "device_info", &self.device_info);
        insert_non_empty(&mut p, "nonce_str", &self.nonce_str);
        insert_non_empty(&mut p, "sign_type", self.sign_type.as_str());
        insert_non_empty(&mut p, "body", &self.body);
        insert_non_empty(&mut p, "out_trade_no", &self.out_trade_no);
        insert_non_empty(&mut p, "fee_type", &self.fee_type);
        insert_non_empty(&mut p, "trade_type", &self.trade_type);
        insert_non_empty(&mut p, "openid", &self.openid);
        insert_non_empty(&mut p, "spbill_create_ip", &self.spbill_create_ip);
        p.insert("total_fee".into(), self.total_fee.to_string());
        p
    }
}

/// Which identifier a refund or query refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderRef {
    OutTradeNo(String),
    TransactionId(String),
}

impl OrderRef {
    pub fn value(&self) -> &str {
        match self {
            OrderRef::OutTradeNo(v) | OrderRef::TransactionId(v) => v,
        }
    }

    pub fn field(&self) -> &'static str {
        match self {
            OrderRef::OutTradeNo(_) => "out_trade_no",
            OrderRef::TransactionId(_) => "transaction_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundOrder {
    pub device_info: String,
    pub nonce_str: String,
    pub sign_type: SignType,
    pub out_refund_no: String,
    pub refund_fee_type: String,
    pub total_fee: u64,
    pub refund_fee: u64,
    pub order: OrderRef,
}

impl RefundOrder {
    pub fn new(total_fee: u64, refund_fee: u64, order: OrderRef) -> Self {
        Self {
            device_info: "WEB".into(),
            nonce_str: random_string(16),
            sign_type: SignType::Md5,
            out_refund_no: trade_number(order.value()),
            refund_fee_type: "CNY".into(),
            total_fee,
            refund_fee,
            order,
        }
    }

    pub fn with_out_refund_no(mut self, out_refund_no: &str) -> Self {
        self.out_refund_no = out_refund_no.into();
        self
    }

    pub fn out_refund_no(&self) -> &str {
        &self.out_refund_no
    }

    pub fn to_params(&self) -> SignParams {
        let mut p = SignParams::new();
        insert_non_empty(&mut p, "device_info", &self.device_info);
        insert_non_empty(&mut p, "nonce_str", &self.nonce_str);
        insert_non_empty(&mut p, "sign_type", self.sign_type.as_str());
        insert_non_empty(&mut p, "out_refund_no", &self.out_refund_no);
        insert_non_empty(&mut p, "refund_fee_type", &self.refund_fee_type);
        insert_non_empty(&mut p, self.order.field(), self.order.value());
        p.insert("total_fee".into(), self.total_fee.to_string());
        p.insert("refund_fee".into(), self.refund_fee.to_string());
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pay_order_defaults() {
        let order = PayOrder::new("o_user", 101, "127.0.0.1", "coffee");
        let digest = format!("{:x}", md5::compute("o_user"));
        assert!(order.out_trade_no().starts_with(&digest[..12]));
        assert_eq!(order.out_trade_no().len(), 12 + 10 + 10);

        let p = order.to_params();
        assert_eq!(p["trade_type"], "JSAPI");
        assert_eq!(p["total_fee"], "101");
        assert_eq!(p["sign_type"], "MD5");
        assert_eq!(p["openid"], "o_user");
        assert_eq!(p["nonce_str"].len(), 16);
    }

    #[test]
    fn test_pay_order_options() {
        let p = PayOrder::new("o", 1, "::1", "b")
            .with_trade_type("NATIVE")
            .with_device_info("")
            .to_params();
        assert_eq!(p["trade_type"], "NATIVE");
        assert!(!p.contains_key("device_info"));
    }

    #[test]
    fn test_refund_order_params() {
        let order = RefundOrder::new(200, 50, OrderRef::TransactionId("4200000001".into()));
        let p = order.to_params();
        assert_eq!(p["transaction_id"], "4200000001");
        assert!(!p.contains_key("out_trade_no"));
        assert_eq!(p["refund_fee"], "50");
        assert_eq!(p["total_fee"], "200");
        assert_eq!(p["out_refund_no"], order.out_refund_no());
    }
}
