//! XML codecs for callback bodies and payment payloads.
//!
//! `xml` is the flat, depth-2 codec used for every callback and notification
//! body. `xml_tree` is the recursive variant used when building or reading
//! nested payment documents.

pub mod xml;
pub mod xml_tree;

pub use xml::XmlMap;
pub use xml_tree::XmlValue;
