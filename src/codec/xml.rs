use std::collections::BTreeMap;

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::{GateError, GateResult};

/// Flat key/value view of an `<xml>` document.
pub type XmlMap = BTreeMap<String, String>;

/// Serialize a flat mapping as `<xml><key>value</key>...</xml>`.
///
/// Values are written as escaped text. Element order follows the map's
/// iteration order and carries no meaning.
pub fn encode(map: &XmlMap) -> GateResult<String> {
    let mut out = String::with_capacity(16 + map.len() * 32);
    out.push_str("<xml>");
    for (key, value) in map {
        push_element(&mut out, key, value)?;
    }
    out.push_str("</xml>");
    Ok(out)
}

pub(crate) fn push_element(out: &mut String, key: &str, value: &str) -> GateResult<()> {
    check_name(key)?;
    out.push('<');
    out.push_str(key);
    out.push('>');
    out.push_str(&escape(value));
    out.push_str("</");
    out.push_str(key);
    out.push('>');
    Ok(())
}

pub(crate) fn check_name(key: &str) -> GateResult<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !key.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(GateError::malformed(format!("invalid xml element name {key:?}")))
    }
}

/// Decode the depth-2 children of the root element into a flat map.
///
/// Leaf children become string values (text and CDATA concatenated).
/// A child that has element children of its own is skipped entirely and
/// does not appear in the result.
pub fn decode(bytes: &[u8]) -> GateResult<XmlMap> {
    if bytes.is_empty() {
        return Err(GateError::malformed("xml data is empty"));
    }

    let mut reader = Reader::from_reader(bytes);
    let mut map = XmlMap::new();
    let mut depth = 0usize;
    // None while outside a depth-2 element or once it turned out to have children
    let mut key: Option<String> = None;
    let mut buf = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                depth += 1;
                match depth {
                    2 => {
                        key = Some(element_name(e.local_name().as_ref())?);
                        buf.clear();
                    }
                    3 => {
                        reader.read_to_end(e.name())?;
                        depth -= 1;
                        key = None;
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => match depth + 1 {
                2 => {
                    map.insert(element_name(e.local_name().as_ref())?, String::new());
                }
                3 => key = None,
                _ => {}
            },
            Event::Text(t) => {
                if depth == 2 && key.is_some() {
                    buf.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if depth == 2 && key.is_some() {
                    let raw = c.into_inner();
                    let text = std::str::from_utf8(&raw)
                        .map_err(|e| GateError::malformed(format!("cdata is not utf-8: {e}")))?;
                    buf.push_str(text);
                }
            }
            Event::End(_) => {
                if depth == 2 {
                    if let Some(k) = key.take() {
                        map.insert(k, std::mem::take(&mut buf));
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(map)
}

pub(crate) fn element_name(raw: &[u8]) -> GateResult<String> {
    std::str::from_utf8(raw)
        .map(str::to_string)
        .map_err(|e| GateError::malformed(format!("element name is not utf-8: {e}")))
}
