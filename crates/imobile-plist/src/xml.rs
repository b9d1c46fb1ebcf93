//! XML property list codec.

use std::io::Write;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use imobile_core::PlistError;
use ::xml::common::XmlVersion;
use ::xml::reader::{EventReader, ParserConfig, XmlEvent as ReaderEvent};
use ::xml::writer::{EmitterConfig, EventWriter, XmlEvent as WriterEvent};

use crate::node::{Dictionary, PlistString, PropertyNode};
use crate::registry::TagRegistry;

const MAX_DEPTH: usize = 128;

/// Encoder and decoder for XML plists.
#[derive(Debug, Clone)]
pub struct XmlCodec {
    registry: Arc<TagRegistry>,
}

/// Element tree built before node construction.
#[derive(Debug)]
struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn new(name: String) -> Self {
        Self {
            name,
            text: String::new(),
            children: Vec::new(),
        }
    }
}

fn xml_error(err: impl std::fmt::Display) -> PlistError {
    PlistError::Xml(err.to_string())
}

impl XmlCodec {
    pub fn new(registry: Arc<TagRegistry>) -> Self {
        Self { registry }
    }

    /// Decode an XML plist document.
    ///
    /// The root element is normally `<plist>` wrapping a single value; a bare
    /// value element is accepted too.
    pub fn decode(&self, data: &[u8]) -> Result<PropertyNode, PlistError> {
        let root = parse_document(data)?;
        if root.name != "plist" {
            return self.element_to_node(root, 0);
        }
        let mut children = root.children.into_iter();
        match (children.next(), children.next()) {
            (Some(value), None) => self.element_to_node(value, 0),
            (None, _) => Err(PlistError::InvalidFormat(
                "empty plist element".to_string(),
            )),
            (Some(_), Some(_)) => Err(PlistError::InvalidFormat(
                "plist element has more than one value".to_string(),
            )),
        }
    }

    /// Encode a tree as an indented XML plist.
    pub fn encode(&self, node: &PropertyNode) -> Result<Vec<u8>, PlistError> {
        let mut out = Vec::new();
        {
            let mut writer = EmitterConfig::new()
                .perform_indent(true)
                .indent_string("\t")
                .create_writer(&mut out);
            writer
                .write(WriterEvent::StartDocument {
                    version: XmlVersion::Version10,
                    encoding: Some("UTF-8"),
                    standalone: None,
                })
                .map_err(xml_error)?;
            writer
                .write(WriterEvent::start_element("plist").attr("version", "1.0"))
                .map_err(xml_error)?;
            write_node(&mut writer, node)?;
            writer
                .write(WriterEvent::end_element())
                .map_err(xml_error)?;
        }
        out.push(b'\n');
        Ok(out)
    }

    fn element_to_node(&self, element: Element, depth: usize) -> Result<PropertyNode, PlistError> {
        if depth > MAX_DEPTH {
            return Err(PlistError::InvalidFormat(format!(
                "nesting deeper than {MAX_DEPTH} levels"
            )));
        }

        let node = self.registry.create_by_xml_tag(&element.name)?;
        match node {
            PropertyNode::Dictionary(_) => {
                let mut dict = Dictionary::with_capacity(element.children.len() / 2);
                let mut children = element.children.into_iter();
                while let Some(key) = children.next() {
                    if key.name != "key" {
                        return Err(PlistError::InvalidFormat(format!(
                            "expected <key> in dict, found <{}>",
                            key.name
                        )));
                    }
                    let value = children.next().ok_or_else(|| {
                        PlistError::InvalidFormat(format!("dict key \"{}\" has no value", key.text))
                    })?;
                    dict.insert(key.text, self.element_to_node(value, depth + 1)?);
                }
                Ok(PropertyNode::Dictionary(dict))
            }
            PropertyNode::Array(_) => {
                let items = element
                    .children
                    .into_iter()
                    .map(|child| self.element_to_node(child, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(PropertyNode::Array(items))
            }
            PropertyNode::String(_) => Ok(PropertyNode::String(PlistString::new(element.text))),
            PropertyNode::Integer(_) => parse_integer(element.text.trim()).map(PropertyNode::Integer),
            PropertyNode::Real(_) => parse_real(element.text.trim()).map(PropertyNode::Real),
            PropertyNode::Boolean(value) => Ok(PropertyNode::Boolean(value)),
            PropertyNode::Data(_) => {
                let compact: String = element
                    .text
                    .chars()
                    .filter(|c| !c.is_ascii_whitespace())
                    .collect();
                general_purpose::STANDARD
                    .decode(compact)
                    .map(PropertyNode::Data)
                    .map_err(|e| PlistError::InvalidFormat(format!("invalid data: {e}")))
            }
            PropertyNode::Date(_) => DateTime::parse_from_rfc3339(element.text.trim())
                .map(|d| PropertyNode::Date(d.with_timezone(&Utc)))
                .map_err(|e| PlistError::InvalidFormat(format!("invalid date: {e}"))),
            other => Err(PlistError::Unsupported(other.kind().name(), "XML")),
        }
    }
}

fn parse_document(data: &[u8]) -> Result<Element, PlistError> {
    let config = ParserConfig::new()
        .ignore_comments(true)
        .cdata_to_characters(true);
    let reader = EventReader::new_with_config(data, config);

    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;
    for event in reader {
        match event.map_err(xml_error)? {
            ReaderEvent::StartElement { name, .. } => {
                if root.is_some() {
                    return Err(PlistError::Xml("content after root element".to_string()));
                }
                if stack.len() > MAX_DEPTH {
                    return Err(PlistError::InvalidFormat(format!(
                        "nesting deeper than {MAX_DEPTH} levels"
                    )));
                }
                stack.push(Element::new(name.local_name));
            }
            ReaderEvent::EndElement { .. } => {
                let element = stack
                    .pop()
                    .ok_or_else(|| PlistError::Xml("unbalanced end element".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            ReaderEvent::Characters(text)
            | ReaderEvent::Whitespace(text)
            | ReaderEvent::CData(text) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            _ => {}
        }
    }
    root.ok_or_else(|| PlistError::Xml("document has no root element".to_string()))
}

fn parse_integer(text: &str) -> Result<i64, PlistError> {
    let invalid = || PlistError::InvalidFormat(format!("invalid integer \"{text}\""));
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map(|v| v as i64).map_err(|_| invalid());
    }
    text.parse::<i64>()
        .or_else(|_| text.parse::<u64>().map(|v| v as i64))
        .map_err(|_| invalid())
}

fn parse_real(text: &str) -> Result<f64, PlistError> {
    match text.to_ascii_lowercase().as_str() {
        "nan" => Ok(f64::NAN),
        "inf" | "infinity" | "+infinity" => Ok(f64::INFINITY),
        "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
        other => other
            .parse::<f64>()
            .map_err(|_| PlistError::InvalidFormat(format!("invalid real \"{text}\""))),
    }
}

fn format_real(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value == f64::INFINITY {
        "+infinity".to_string()
    } else if value == f64::NEG_INFINITY {
        "-infinity".to_string()
    } else {
        value.to_string()
    }
}

fn write_text_element<W: Write>(
    writer: &mut EventWriter<W>,
    name: &str,
    text: &str,
) -> Result<(), PlistError> {
    writer
        .write(WriterEvent::start_element(name))
        .map_err(xml_error)?;
    if !text.is_empty() {
        writer
            .write(WriterEvent::characters(text))
            .map_err(xml_error)?;
    }
    writer.write(WriterEvent::end_element()).map_err(xml_error)
}

fn write_node<W: Write>(writer: &mut EventWriter<W>, node: &PropertyNode) -> Result<(), PlistError> {
    match node {
        PropertyNode::Dictionary(dict) => {
            writer
                .write(WriterEvent::start_element("dict"))
                .map_err(xml_error)?;
            for (key, value) in dict.iter() {
                write_text_element(writer, "key", key)?;
                write_node(writer, value)?;
            }
            writer.write(WriterEvent::end_element()).map_err(xml_error)
        }
        PropertyNode::Array(items) => {
            writer
                .write(WriterEvent::start_element("array"))
                .map_err(xml_error)?;
            for item in items {
                write_node(writer, item)?;
            }
            writer.write(WriterEvent::end_element()).map_err(xml_error)
        }
        PropertyNode::String(s) => write_text_element(writer, "string", s.as_str()),
        PropertyNode::Integer(v) => write_text_element(writer, "integer", &v.to_string()),
        PropertyNode::Real(v) => write_text_element(writer, "real", &format_real(*v)),
        PropertyNode::Boolean(v) => {
            let name = if *v { "true" } else { "false" };
            writer
                .write(WriterEvent::start_element(name))
                .map_err(xml_error)?;
            writer.write(WriterEvent::end_element()).map_err(xml_error)
        }
        PropertyNode::Data(bytes) => {
            write_text_element(writer, "data", &general_purpose::STANDARD.encode(bytes))
        }
        PropertyNode::Date(d) => write_text_element(
            writer,
            "date",
            &d.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        ),
        other => Err(PlistError::Unsupported(other.kind().name(), "XML")),
    }
}
