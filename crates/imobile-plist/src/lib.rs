//! # imobile-plist
//!
//! Property list model and codecs.
//!
//! This crate provides:
//! - The [`PropertyNode`] tree with an insertion-ordered [`Dictionary`]
//! - A [`TagRegistry`] mapping wire tags to node kinds
//! - Binary (`bplist00`) and XML codecs behind a single [`PlistCodec`]

pub mod binary;
pub mod node;
pub mod registry;
pub mod xml;

use std::sync::Arc;

use imobile_core::PlistError;

pub use binary::BinaryCodec;
pub use node::{apple_epoch, Dictionary, NodeKind, PlistString, PropertyNode};
pub use registry::TagRegistry;
pub use crate::xml::XmlCodec;

/// Serialization format of a plist document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlistFormat {
    Binary,
    #[default]
    Xml,
}

impl PlistFormat {
    /// Sniff the format of an encoded document.
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(b"bplist") {
            PlistFormat::Binary
        } else {
            PlistFormat::Xml
        }
    }
}

/// Both codecs over one shared registry.
#[derive(Debug, Clone)]
pub struct PlistCodec {
    registry: Arc<TagRegistry>,
    binary: BinaryCodec,
    xml: XmlCodec,
}

impl PlistCodec {
    pub fn new(registry: Arc<TagRegistry>) -> Self {
        Self {
            binary: BinaryCodec::new(registry.clone()),
            xml: XmlCodec::new(registry.clone()),
            registry,
        }
    }

    /// Codec over [`TagRegistry::standard`].
    pub fn standard() -> Self {
        Self::new(Arc::new(TagRegistry::standard()))
    }

    pub fn registry(&self) -> &Arc<TagRegistry> {
        &self.registry
    }

    pub fn encode(&self, node: &PropertyNode, format: PlistFormat) -> Result<Vec<u8>, PlistError> {
        match format {
            PlistFormat::Binary => self.binary.encode(node),
            PlistFormat::Xml => self.xml.encode(node),
        }
    }

    /// Decode a document, detecting its format from the header.
    pub fn decode(&self, data: &[u8]) -> Result<PropertyNode, PlistError> {
        self.decode_as(data, PlistFormat::detect(data))
    }

    pub fn decode_as(&self, data: &[u8], format: PlistFormat) -> Result<PropertyNode, PlistError> {
        match format {
            PlistFormat::Binary => self.binary.decode(data),
            PlistFormat::Xml => self.xml.decode(data),
        }
    }

    /// Decode a document whose top-level value must be a dictionary.
    pub fn decode_dictionary(&self, data: &[u8]) -> Result<Dictionary, PlistError> {
        match self.decode(data)? {
            PropertyNode::Dictionary(dict) => Ok(dict),
            other => Err(PlistError::InvalidFormat(format!(
                "expected a dictionary, found {}",
                other.kind().name()
            ))),
        }
    }
}

impl Default for PlistCodec {
    fn default() -> Self {
        Self::standard()
    }
}
