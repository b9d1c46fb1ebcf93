//! Tag registry mapping wire tags to node kinds.
//!
//! Both codecs construct nodes exclusively through a [`TagRegistry`]. The
//! registry is built once, then shared read-only (usually behind an `Arc`).

use std::collections::HashMap;

use imobile_core::PlistError;

use crate::node::{NodeKind, PlistString, PropertyNode};

/// Binary marker for UTF-16 strings.
const UTF16_STRING_TAG: u8 = 0x6;

/// Maps XML element names and binary tag nibbles to [`NodeKind`]s.
#[derive(Debug, Clone)]
pub struct TagRegistry {
    binary_tags: HashMap<u8, NodeKind>,
    xml_tags: HashMap<String, NodeKind>,
}

impl TagRegistry {
    /// A registry with no registrations.
    pub fn empty() -> Self {
        Self {
            binary_tags: HashMap::new(),
            xml_tags: HashMap::new(),
        }
    }

    /// The registry used by every standard plist.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for kind in [
            NodeKind::Dictionary,
            NodeKind::Integer,
            NodeKind::Real,
            NodeKind::String,
            NodeKind::Array,
            NodeKind::Data,
            NodeKind::Date,
            NodeKind::Uid,
        ] {
            registry.register(kind);
        }
        registry.register_tags("string", 0x5, NodeKind::String);
        registry.register_tags("ustring", UTF16_STRING_TAG, NodeKind::String);
        registry.register_tags("true", 0x0, NodeKind::Boolean);
        registry.register_tags("false", 0x0, NodeKind::Boolean);
        registry
    }

    /// Register a kind under its own binary and XML tags.
    ///
    /// A tag that is already registered keeps its first mapping.
    pub fn register(&mut self, kind: NodeKind) {
        self.binary_tags.entry(kind.binary_tag()).or_insert(kind);
        if let Some(tag) = kind.xml_tag() {
            self.xml_tags.entry(tag.to_string()).or_insert(kind);
        }
    }

    /// Register a kind under explicit tags. First registration wins.
    pub fn register_tags(&mut self, xml_tag: &str, binary_tag: u8, kind: NodeKind) {
        self.xml_tags.entry(xml_tag.to_string()).or_insert(kind);
        self.binary_tags.entry(binary_tag).or_insert(kind);
    }

    pub fn kind_for_binary_tag(&self, tag: u8) -> Option<NodeKind> {
        self.binary_tags.get(&tag).copied()
    }

    pub fn kind_for_xml_tag(&self, tag: &str) -> Option<NodeKind> {
        self.xml_tags.get(tag).copied()
    }

    /// Construct an empty node for an XML element name.
    ///
    /// Boolean elements carry their value in the name, so `true` yields
    /// `Boolean(true)`.
    pub fn create_by_xml_tag(&self, tag: &str) -> Result<PropertyNode, PlistError> {
        let kind = self
            .kind_for_xml_tag(tag)
            .ok_or_else(|| PlistError::UnknownXmlTag(tag.to_string()))?;
        Ok(match kind {
            NodeKind::Boolean => PropertyNode::Boolean(tag == "true"),
            other => PropertyNode::empty(other),
        })
    }

    /// Construct an empty node for a binary marker split into tag and length nibbles.
    ///
    /// Marker `0x00` is Null and `0x0F` is Fill; tag `0x6` is a UTF-16
    /// string. Other markers under tag `0x0` resolve to a Boolean placeholder
    /// that the decoder fills from the low nibble.
    pub fn create_by_binary_tag(&self, tag: u8, length: u8) -> Result<PropertyNode, PlistError> {
        match (tag, length) {
            (0x0, 0x0) => return Ok(PropertyNode::Null),
            (0x0, 0xF) => return Ok(PropertyNode::Fill),
            (UTF16_STRING_TAG, _) => {
                return Ok(PropertyNode::String(PlistString::utf16(String::new())))
            }
            _ => {}
        }
        let kind = self
            .kind_for_binary_tag(tag)
            .ok_or(PlistError::UnknownBinaryTag(tag))?;
        Ok(PropertyNode::empty(kind))
    }

    /// Node for a dictionary key.
    pub fn create_key_element(key: &str) -> PropertyNode {
        PropertyNode::String(PlistString::new(key))
    }

    /// Node for an extended binary length.
    pub fn create_length_element(length: usize) -> PropertyNode {
        PropertyNode::Integer(length as i64)
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
