use std::collections::BTreeMap;

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::xml::{check_name, element_name};
use crate::error::{GateError, GateResult};

/// Element name used to wrap each entry of a sequence.
pub const ITEM_TAG: &str = "item";

/// Deepest element nesting `decode` accepts, root included.
pub const MAX_DEPTH: usize = 32;

/// Value of a nested XML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlValue {
    Text(String),
    Map(BTreeMap<String, XmlValue>),
    /// Rendered as one `<item>` wrapper element per entry.
    List(Vec<XmlValue>),
}

impl XmlValue {
    pub fn text(value: impl Into<String>) -> Self {
        XmlValue::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            XmlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, XmlValue>> {
        match self {
            XmlValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[XmlValue]> {
        match self {
            XmlValue::List(l) => Some(l),
            _ => None,
        }
    }

    /// Look up a direct child of a map value.
    pub fn get(&self, key: &str) -> Option<&XmlValue> {
        self.as_map().and_then(|m| m.get(key))
    }
}

impl From<&str> for XmlValue {
    fn from(value: &str) -> Self {
        XmlValue::Text(value.to_string())
    }
}

impl From<String> for XmlValue {
    fn from(value: String) -> Self {
        XmlValue::Text(value)
    }
}

/// Serialize a nested mapping under a root `<xml>` element.
pub fn encode(root: &BTreeMap<String, XmlValue>) -> GateResult<String> {
    let mut out = String::from("<xml>");
    write_map(&mut out, root)?;
    out.push_str("</xml>");
    Ok(out)
}

fn write_map(out: &mut String, map: &BTreeMap<String, XmlValue>) -> GateResult<()> {
    for (key, value) in map {
        check_name(key)?;
        out.push('<');
        out.push_str(key);
        out.push('>');
        write_value(out, value)?;
        out.push_str("</");
        out.push_str(key);
        out.push('>');
    }
    Ok(())
}

fn write_value(out: &mut String, value: &XmlValue) -> GateResult<()> {
    match value {
        XmlValue::Text(s) => out.push_str(&escape(s.as_str())),
        XmlValue::Map(m) => write_map(out, m)?,
        XmlValue::List(items) => {
            for item in items {
                out.push_str("<item>");
                write_value(out, item)?;
                out.push_str("</item>");
            }
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn into_value(self) -> XmlValue {
        if self.children.is_empty() {
            return XmlValue::Text(self.text);
        }
        if self.children.iter().all(|c| c.name == ITEM_TAG) {
            return XmlValue::List(self.children.into_iter().map(Node::into_value).collect());
        }
        // repeated names other than `item` keep the last occurrence
        XmlValue::Map(
            self.children
                .into_iter()
                .map(|c| (c.name.clone(), c.into_value()))
                .collect(),
        )
    }
}

/// Decode a whole document recursively, returning the children of the root.
///
/// A root without element children decodes to an empty map.
pub fn decode(bytes: &[u8]) -> GateResult<BTreeMap<String, XmlValue>> {
    if bytes.is_empty() {
        return Err(GateError::malformed("xml data is empty"));
    }

    let mut reader = Reader::from_reader(bytes);
    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<Node> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(GateError::malformed(format!(
                        "xml nesting deeper than {MAX_DEPTH} levels"
                    )));
                }
                stack.push(Node {
                    name: element_name(e.local_name().as_ref())?,
                    ..Node::default()
                })
            }
            Event::Empty(e) => {
                let node = Node {
                    name: element_name(e.local_name().as_ref())?,
                    ..Node::default()
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    let raw = c.into_inner();
                    let text = std::str::from_utf8(&raw)
                        .map_err(|e| GateError::malformed(format!("cdata is not utf-8: {e}")))?;
                    top.text.push_str(text);
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| GateError::malformed("unexpected closing tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None => root = Some(node),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(GateError::malformed("unclosed xml element"));
    }
    let root = root.ok_or_else(|| GateError::malformed("xml document has no root element"))?;
    match root.into_value() {
        XmlValue::Map(m) => Ok(m),
        XmlValue::List(items) => Ok(BTreeMap::from([(ITEM_TAG.to_string(), XmlValue::List(items))])),
        XmlValue::Text(_) => Ok(BTreeMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene_info() -> BTreeMap<String, XmlValue> {
        let store = BTreeMap::from([
            ("id".to_string(), XmlValue::text("SZTX001")),
            ("name".to_string(), XmlValue::text("Tencent & Co")),
        ]);
        BTreeMap::from([
            ("appid".to_string(), XmlValue::text("wx123")),
            ("store_info".to_string(), XmlValue::Map(store)),
        ])
    }

    #[test]
    fn test_encode_nested_map() {
        let xml = encode(&scene_info()).unwrap();
        assert_eq!(
            xml,
            "<xml><appid>wx123</appid><store_info><id>SZTX001</id><name>Tencent &amp; Co</name></store_info></xml>"
        );
    }

    #[test]
    fn test_encode_sequence_wraps_each_item() {
        let goods = XmlValue::List(vec![
            XmlValue::Map(BTreeMap::from([("sku".to_string(), XmlValue::text("a"))])),
            XmlValue::Map(BTreeMap::from([("sku".to_string(), XmlValue::text("b"))])),
        ]);
        let root = BTreeMap::from([("goods".to_string(), goods)]);

        let xml = encode(&root).unwrap();
        assert_eq!(
            xml,
            "<xml><goods><item><sku>a</sku></item><item><sku>b</sku></item></goods></xml>"
        );
    }

    #[test]
    fn test_decode_nested_document() {
        let xml = b"<xml><return_code><![CDATA[SUCCESS]]></return_code>\
            <detail><goods><item><sku>a</sku></item><item><sku>b</sku></item></goods></detail></xml>";
        let doc = decode(xml).unwrap();

        assert_eq!(doc["return_code"].as_text(), Some("SUCCESS"));
        let goods = doc["detail"].get("goods").and_then(XmlValue::as_list).unwrap();
        assert_eq!(goods.len(), 2);
        assert_eq!(goods[1].get("sku").and_then(XmlValue::as_text), Some("b"));
    }

    #[test]
    fn test_decode_reverses_encode() {
        let root = scene_info();
        let xml = encode(&root).unwrap();
        assert_eq!(decode(xml.as_bytes()).unwrap(), root);
    }

    #[test]
    fn test_decode_rejects_truncated_document() {
        assert!(decode(b"<xml><a>1</a>").is_err());
        assert!(decode(b"").is_err());
    }

    #[test]
    fn test_decode_depth_limit() {
        let nested = |depth: usize| {
            let mut doc = String::new();
            for i in 0..depth {
                doc.push_str(&format!("<n{i}>"));
            }
            doc.push('x');
            for i in (0..depth).rev() {
                doc.push_str(&format!("</n{i}>"));
            }
            doc
        };

        assert!(decode(nested(MAX_DEPTH).as_bytes()).is_ok());
        assert!(matches!(
            decode(nested(MAX_DEPTH + 1).as_bytes()),
            Err(GateError::MalformedInput(_))
        ));
        assert!(matches!(
            decode(nested(100_000).as_bytes()),
            Err(GateError::MalformedInput(_))
        ));
    }
}
