//! Inbound callback handling: signature check, decryption, parsing and
//! sealing of the reply.

use serde::Deserialize;
use tracing::debug;

use crate::codec::xml::{self, XmlMap};
use crate::error::{GateError, GateResult};
use crate::security::cipher;
use crate::security::signature::{sha1_signature, verify_sha1_signature};
use crate::utils::random_frame_prefix;

pub mod reply;

pub use reply::reply_text;

/// Query parameters of a callback request.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CallbackQuery {
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub echostr: String,
    #[serde(default)]
    pub msg_signature: String,
}

/// Per-account secrets the envelope needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeKeys {
    pub app_id: String,
    pub token: String,
    pub encoding_aes_key: String,
}

/// An inbound callback request as received, before any check has run.
#[derive(Debug, Clone)]
pub struct Received {
    keys: EnvelopeKeys,
    query: CallbackQuery,
    body: Vec<u8>,
}

impl Received {
    pub fn new(keys: EnvelopeKeys, query: CallbackQuery, body: impl Into<Vec<u8>>) -> Self {
        Self {
            keys,
            query,
            body: body.into(),
        }
    }

    /// Encrypted mode is signalled by the presence of `msg_signature`.
    pub fn is_encrypted(&self) -> bool {
        !self.query.msg_signature.is_empty()
    }

    /// Answer the platform's URL verification handshake with the echo string.
    ///
    /// The signature is checked before anything is decrypted.
    pub fn validate(&self) -> GateResult<String> {
        let q = &self.query;
        if self.is_encrypted() {
            verify_sha1_signature(
                &q.msg_signature,
                &[&self.keys.token, &q.timestamp, &q.nonce, &q.echostr],
            )?;
            let frame = cipher::decrypt_message(&q.echostr, &self.keys.encoding_aes_key)?;
            String::from_utf8(frame.msg)
                .map_err(|e| GateError::malformed(format!("echo string is not utf-8: {e}")))
        } else {
            verify_sha1_signature(&q.signature, &[&self.keys.token, &q.timestamp, &q.nonce])?;
            Ok(q.echostr.clone())
        }
    }

    /// Authenticate the request and decode its message fields.
    pub fn parse(&self) -> GateResult<InboundMessage> {
        let q = &self.query;
        if !self.is_encrypted() {
            verify_sha1_signature(&q.signature, &[&self.keys.token, &q.timestamp, &q.nonce])?;
            return Ok(InboundMessage {
                fields: xml::decode(&self.body)?,
                receiver_id: None,
                reply: self.reply_context(None),
            });
        }

        let outer = xml::decode(&self.body)?;
        let encrypt = outer
            .get("Encrypt")
            .filter(|e| !e.is_empty())
            .ok_or_else(|| GateError::malformed("encrypted body has no Encrypt element"))?;
        verify_sha1_signature(
            &q.msg_signature,
            &[&self.keys.token, &q.timestamp, &q.nonce, encrypt],
        )?;

        let frame = cipher::decrypt_message(encrypt, &self.keys.encoding_aes_key)?;
        let receiver_id = String::from_utf8(frame.receiver_id)
            .map_err(|e| GateError::malformed(format!("receiver id is not utf-8: {e}")))?;
        debug!(app_id = %self.keys.app_id, receiver_id = %receiver_id, "message decrypted");

        Ok(InboundMessage {
            fields: xml::decode(&frame.msg)?,
            reply: self.reply_context(Some(receiver_id.clone())),
            receiver_id: Some(receiver_id),
        })
    }

    /// Seal `content` for the wire, addressed to this account's app id.
    pub fn build_reply(&self, content: &str) -> GateResult<String> {
        self.reply_context(None).seal(content, random_frame_prefix())
    }

    fn reply_context(&self, receiver_id: Option<String>) -> ReplyContext {
        ReplyContext {
            encrypted: self.is_encrypted(),
            token: self.keys.token.clone(),
            encoding_aes_key: self.keys.encoding_aes_key.clone(),
            receiver_id: receiver_id.unwrap_or_else(|| self.keys.app_id.clone()),
            timestamp: self.query.timestamp.clone(),
            nonce: self.query.nonce.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReplyContext {
    encrypted: bool,
    token: String,
    encoding_aes_key: String,
    receiver_id: String,
    timestamp: String,
    nonce: String,
}

impl ReplyContext {
    fn seal(&self, content: &str, random: [u8; 16]) -> GateResult<String> {
        if !self.encrypted {
            return Ok(content.to_string());
        }
        let encrypted = cipher::encrypt_message(
            content.as_bytes(),
            &self.receiver_id,
            &self.encoding_aes_key,
            random,
        )?;
        let signature = sha1_signature(&[&self.token, &encrypted, &self.timestamp, &self.nonce]);

        let mut out = XmlMap::new();
        out.insert("Encrypt".into(), encrypted);
        out.insert("MsgSignature".into(), signature);
        out.insert("TimeStamp".into(), self.timestamp.clone());
        out.insert("Nonce".into(), self.nonce.clone());
        xml::encode(&out)
    }
}

/// Decoded callback message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub fields: XmlMap,
    /// Receiver id carried in the encrypted frame; `None` for plaintext.
    pub receiver_id: Option<String>,
    reply: ReplyContext,
}

impl InboundMessage {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn is_encrypted(&self) -> bool {
        self.reply.encrypted
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.get("MsgType")
    }

    pub fn event(&self) -> Option<&str> {
        self.get("Event")
    }

    pub fn from_user(&self) -> Option<&str> {
        self.get("FromUserName")
    }

    pub fn to_user(&self) -> Option<&str> {
        self.get("ToUserName")
    }

    pub fn content(&self) -> Option<&str> {
        self.get("Content")
    }

    pub fn create_time(&self) -> Option<i64> {
        self.get("CreateTime").and_then(|t| t.parse().ok())
    }

    /// Seal `content` as the reply to this message.
    pub fn build_reply(&self, content: &str) -> GateResult<String> {
        self.build_reply_with_random(content, random_frame_prefix())
    }

    pub fn build_reply_with_random(&self, content: &str, random: [u8; 16]) -> GateResult<String> {
        self.reply.seal(content, random)
    }
}
