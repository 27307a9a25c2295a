use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit};
use base64::alphabet;
use base64::engine::{general_purpose, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;

use crate::error::{GateError, GateResult};

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;
/// Length of a decoded message key (AES-256).
pub const MESSAGE_KEY_LEN: usize = 32;
/// Size of the random prefix plus the big-endian length field of a frame.
pub const FRAME_HEADER_LEN: usize = 20;

/// Standard alphabet that tolerates non-zero unused bits in the last symbol,
/// which most 43-character platform keys carry.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Decode the platform's 43-character "EncodingAESKey" into the 32-byte key.
pub fn decode_encoding_aes_key(encoding_key: &str) -> GateResult<Vec<u8>> {
    let key = KEY_ENGINE
        .decode(format!("{encoding_key}="))
        .map_err(|e| GateError::InvalidKey(format!("encoding aes key is not base64: {e}")))?;
    if key.len() != MESSAGE_KEY_LEN {
        return Err(GateError::InvalidKey(format!(
            "encoding aes key decodes to {} bytes, expected {}",
            key.len(),
            MESSAGE_KEY_LEN
        )));
    }
    Ok(key)
}

/// PKCS#7 padding to a multiple of `block`; always appends 1..=block bytes.
pub fn pkcs7_pad(data: &[u8], block: usize) -> Vec<u8> {
    let pad = block - data.len() % block;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

/// Strip PKCS#7 padding, treating a pad count outside `0..=bound` (or longer
/// than the buffer) as "not padded".
pub fn pkcs7_unpad_lenient(data: &[u8], bound: usize) -> &[u8] {
    let Some(&last) = data.last() else {
        return data;
    };
    let pad = last as usize;
    if pad > bound || pad > data.len() {
        return data;
    }
    &data[..data.len() - pad]
}

/// How the ECB path treats the trailing pad byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnpadPolicy {
    /// Trust the final byte as the pad count without validating it.
    /// Never panics: a count larger than the buffer yields an empty slice.
    #[default]
    Trusting,
    /// Require `1..=BLOCK_SIZE` pad bytes that all carry the pad value.
    Strict,
}

pub fn pkcs5_pad(data: &[u8]) -> Vec<u8> {
    pkcs7_pad(data, BLOCK_SIZE)
}

pub fn pkcs5_unpad(data: &[u8], policy: UnpadPolicy) -> GateResult<&[u8]> {
    let Some(&last) = data.last() else {
        return Err(GateError::malformed("cannot unpad empty plaintext"));
    };
    let pad = last as usize;
    match policy {
        UnpadPolicy::Trusting => Ok(&data[..data.len().saturating_sub(pad)]),
        UnpadPolicy::Strict => {
            if pad == 0 || pad > BLOCK_SIZE || pad > data.len() {
                return Err(GateError::malformed(format!("invalid pad length {pad}")));
            }
            let (body, tail) = data.split_at(data.len() - pad);
            if tail.iter().any(|&b| b as usize != pad) {
                return Err(GateError::malformed("inconsistent padding bytes"));
            }
            Ok(body)
        }
    }
}

fn decode_ciphertext(ciphertext_b64: &str) -> GateResult<Vec<u8>> {
    let raw = general_purpose::STANDARD.decode(ciphertext_b64.trim())?;
    if raw.len() < BLOCK_SIZE {
        return Err(GateError::malformed("ciphertext too short"));
    }
    if raw.len() % BLOCK_SIZE != 0 {
        return Err(GateError::malformed(
            "ciphertext is not a multiple of the block size",
        ));
    }
    Ok(raw)
}

fn cbc_encrypt_with<C>(key: &[u8], iv: &[u8], data: &[u8]) -> GateResult<Vec<u8>>
where
    C: BlockEncryptMut + BlockCipher,
    cbc::Encryptor<C>: KeyIvInit + BlockEncryptMut,
{
    let enc = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| GateError::InvalidKey("bad cbc key or iv length".into()))?;
    Ok(enc.encrypt_padded_vec_mut::<NoPadding>(data))
}

fn cbc_decrypt_with<C>(key: &[u8], iv: &[u8], data: &[u8]) -> GateResult<Vec<u8>>
where
    C: BlockDecryptMut + BlockCipher,
    cbc::Decryptor<C>: KeyIvInit + BlockDecryptMut,
{
    let dec = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| GateError::InvalidKey("bad cbc key or iv length".into()))?;
    dec.decrypt_padded_vec_mut::<NoPadding>(data)
        .map_err(|_| GateError::malformed("ciphertext is not block aligned"))
}

fn ecb_encrypt_with<C>(key: &[u8], data: &[u8]) -> GateResult<Vec<u8>>
where
    C: BlockEncryptMut + BlockCipher,
    ecb::Encryptor<C>: KeyInit + BlockEncryptMut,
{
    let enc = ecb::Encryptor::<C>::new_from_slice(key)
        .map_err(|_| GateError::InvalidKey("bad ecb key length".into()))?;
    Ok(enc.encrypt_padded_vec_mut::<NoPadding>(data))
}

fn ecb_decrypt_with<C>(key: &[u8], data: &[u8]) -> GateResult<Vec<u8>>
where
    C: BlockDecryptMut + BlockCipher,
    ecb::Decryptor<C>: KeyInit + BlockDecryptMut,
{
    let dec = ecb::Decryptor::<C>::new_from_slice(key)
        .map_err(|_| GateError::InvalidKey("bad ecb key length".into()))?;
    dec.decrypt_padded_vec_mut::<NoPadding>(data)
        .map_err(|_| GateError::malformed("ciphertext is not block aligned"))
}

fn unsupported_key(len: usize) -> GateError {
    GateError::InvalidKey(format!("aes key must be 16, 24 or 32 bytes, got {len}"))
}

/// AES-CBC encrypt and base64 the result.
///
/// The plaintext is PKCS#7-padded to the key length (not the block size).
/// Without an explicit `iv` the first 16 bytes of the key are used.
pub fn cbc_encrypt(plaintext: &[u8], key: &[u8], iv: Option<&[u8]>) -> GateResult<String> {
    let iv = iv.unwrap_or_else(|| &key[..BLOCK_SIZE.min(key.len())]);
    // AES-192 keys are not block multiples; they fall back to block padding
    let pad_to = if key.len() % BLOCK_SIZE == 0 && !key.is_empty() {
        key.len()
    } else {
        BLOCK_SIZE
    };
    let padded = pkcs7_pad(plaintext, pad_to);
    let raw = match key.len() {
        16 => cbc_encrypt_with::<aes::Aes128>(key, iv, &padded)?,
        24 => cbc_encrypt_with::<aes::Aes192>(key, iv, &padded)?,
        32 => cbc_encrypt_with::<aes::Aes256>(key, iv, &padded)?,
        n => return Err(unsupported_key(n)),
    };
    Ok(general_purpose::STANDARD.encode(raw))
}

/// Base64-decode and AES-CBC decrypt, then strip padding leniently
/// (bounded by the key length).
pub fn cbc_decrypt(ciphertext_b64: &str, key: &[u8], iv: Option<&[u8]>) -> GateResult<Vec<u8>> {
    let raw = decode_ciphertext(ciphertext_b64)?;
    let iv = iv.unwrap_or_else(|| &key[..BLOCK_SIZE.min(key.len())]);
    let plain = match key.len() {
        16 => cbc_decrypt_with::<aes::Aes128>(key, iv, &raw)?,
        24 => cbc_decrypt_with::<aes::Aes192>(key, iv, &raw)?,
        32 => cbc_decrypt_with::<aes::Aes256>(key, iv, &raw)?,
        n => return Err(unsupported_key(n)),
    };
    Ok(pkcs7_unpad_lenient(&plain, key.len()).to_vec())
}

/// AES-ECB encrypt with PKCS#5 padding and base64 the result.
pub fn ecb_encrypt(plaintext: &[u8], key: &[u8]) -> GateResult<String> {
    let padded = pkcs5_pad(plaintext);
    let raw = match key.len() {
        16 => ecb_encrypt_with::<aes::Aes128>(key, &padded)?,
        24 => ecb_encrypt_with::<aes::Aes192>(key, &padded)?,
        32 => ecb_encrypt_with::<aes::Aes256>(key, &padded)?,
        n => return Err(unsupported_key(n)),
    };
    Ok(general_purpose::STANDARD.encode(raw))
}

/// Base64-decode and AES-ECB decrypt, unpadding per `policy`.
pub fn ecb_decrypt(ciphertext_b64: &str, key: &[u8], policy: UnpadPolicy) -> GateResult<Vec<u8>> {
    let raw = decode_ciphertext(ciphertext_b64)?;
    let plain = match key.len() {
        16 => ecb_decrypt_with::<aes::Aes128>(key, &raw)?,
        24 => ecb_decrypt_with::<aes::Aes192>(key, &raw)?,
        32 => ecb_decrypt_with::<aes::Aes256>(key, &raw)?,
        n => return Err(unsupported_key(n)),
    };
    Ok(pkcs5_unpad(&plain, policy)?.to_vec())
}

/// Key for refund notification payloads: lowercase hex MD5 of the payment key,
/// used as raw key bytes.
pub fn refund_key(pay_key: &str) -> String {
    format!("{:x}", md5::compute(pay_key.as_bytes()))
}

/// Plaintext layout of an encrypted message:
/// 16 random bytes, big-endian u32 message length, message, receiver id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaintextFrame {
    pub random: [u8; 16],
    pub msg: Vec<u8>,
    pub receiver_id: Vec<u8>,
}

impl PlaintextFrame {
    pub fn new(random: [u8; 16], msg: impl Into<Vec<u8>>, receiver_id: impl Into<Vec<u8>>) -> Self {
        Self {
            random,
            msg: msg.into(),
            receiver_id: receiver_id.into(),
        }
    }

    pub fn to_bytes(&self) -> GateResult<Vec<u8>> {
        let len = u32::try_from(self.msg.len())
            .map_err(|_| GateError::malformed("message too large for frame"))?;
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.msg.len() + self.receiver_id.len());
        out.extend_from_slice(&self.random);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.msg);
        out.extend_from_slice(&self.receiver_id);
        Ok(out)
    }

    pub fn parse(bytes: &[u8]) -> GateResult<Self> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(GateError::malformed("plaintext frame shorter than header"));
        }
        let mut random = [0u8; 16];
        random.copy_from_slice(&bytes[..16]);
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&bytes[16..FRAME_HEADER_LEN]);
        let msg_len = u32::from_be_bytes(len_buf) as usize;

        let body = &bytes[FRAME_HEADER_LEN..];
        if body.len() < msg_len {
            return Err(GateError::malformed(format!(
                "frame declares {msg_len} message bytes but only {} remain",
                body.len()
            )));
        }
        let (msg, receiver_id) = body.split_at(msg_len);
        Ok(Self {
            random,
            msg: msg.to_vec(),
            receiver_id: receiver_id.to_vec(),
        })
    }
}

/// Frame, encrypt and base64 a message for the given receiver.
pub fn encrypt_message(
    msg: &[u8],
    receiver_id: &str,
    encoding_aes_key: &str,
    random: [u8; 16],
) -> GateResult<String> {
    let key = decode_encoding_aes_key(encoding_aes_key)?;
    let frame = PlaintextFrame::new(random, msg, receiver_id.as_bytes());
    cbc_encrypt(&frame.to_bytes()?, &key, None)
}

/// Decrypt a base64 message payload and parse its frame.
pub fn decrypt_message(ciphertext_b64: &str, encoding_aes_key: &str) -> GateResult<PlaintextFrame> {
    let key = decode_encoding_aes_key(encoding_aes_key)?;
    let plain = cbc_decrypt(ciphertext_b64, &key, None)?;
    PlaintextFrame::parse(&plain)
}
