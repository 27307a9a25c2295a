use crate::codec::xml::{self, XmlMap};
use crate::error::GateResult;
use crate::utils::unix_timestamp;

use super::InboundMessage;

/// Body the platform accepts as "handled, nothing to send".
pub const EMPTY_REPLY: &str = "success";

/// Reply to `msg` with a text message, sealed for the message's channel.
///
/// `None` answers with the bare `success` acknowledgement.
pub fn reply_text(msg: &InboundMessage, content: Option<&str>) -> GateResult<String> {
    let Some(content) = content else {
        return Ok(EMPTY_REPLY.to_string());
    };

    let mut data = XmlMap::new();
    data.insert("Content".into(), content.to_string());
    data.insert("CreateTime".into(), unix_timestamp());
    data.insert("ToUserName".into(), msg.from_user().unwrap_or_default().to_string());
    data.insert("FromUserName".into(), msg.to_user().unwrap_or_default().to_string());
    data.insert("MsgType".into(), "text".into());

    msg.build_reply(&xml::encode(&data)?)
}
