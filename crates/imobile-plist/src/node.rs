//! Property node data model.
//!
//! A plist document is a tree of [`PropertyNode`] values. The set of variants
//! is closed; consumers match exhaustively and treat a variant they did not
//! expect as an explicit error instead of casting.

use chrono::{DateTime, Duration, SubsecRound, Utc};

/// Seconds between the Unix epoch and the plist reference date (2001-01-01T00:00:00Z).
pub const APPLE_EPOCH_UNIX_SECS: i64 = 978_307_200;

/// The plist reference date.
pub fn apple_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::default() + Duration::seconds(APPLE_EPOCH_UNIX_SECS)
}

/// Discriminant of a [`PropertyNode`], carrying its wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Dictionary,
    Array,
    String,
    Integer,
    Real,
    Boolean,
    Data,
    Date,
    Uid,
    Null,
    Fill,
}

impl NodeKind {
    /// High nibble of the binary object marker.
    ///
    /// `String` reports the ASCII tag; UTF-16 strings use `0x6`.
    pub fn binary_tag(&self) -> u8 {
        match self {
            NodeKind::Null | NodeKind::Boolean | NodeKind::Fill => 0x0,
            NodeKind::Integer => 0x1,
            NodeKind::Real => 0x2,
            NodeKind::Date => 0x3,
            NodeKind::Data => 0x4,
            NodeKind::String => 0x5,
            NodeKind::Uid => 0x8,
            NodeKind::Array => 0xA,
            NodeKind::Dictionary => 0xD,
        }
    }

    /// XML element name, for variants with a fixed one.
    ///
    /// Booleans are spelled `<true/>` or `<false/>` and so have no single tag;
    /// `Uid`, `Null` and `Fill` exist only in binary plists.
    pub fn xml_tag(&self) -> Option<&'static str> {
        match self {
            NodeKind::Dictionary => Some("dict"),
            NodeKind::Array => Some("array"),
            NodeKind::String => Some("string"),
            NodeKind::Integer => Some("integer"),
            NodeKind::Real => Some("real"),
            NodeKind::Data => Some("data"),
            NodeKind::Date => Some("date"),
            NodeKind::Boolean | NodeKind::Uid | NodeKind::Null | NodeKind::Fill => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Dictionary => "Dictionary",
            NodeKind::Array => "Array",
            NodeKind::String => "String",
            NodeKind::Integer => "Integer",
            NodeKind::Real => "Real",
            NodeKind::Boolean => "Boolean",
            NodeKind::Data => "Data",
            NodeKind::Date => "Date",
            NodeKind::Uid => "Uid",
            NodeKind::Null => "Null",
            NodeKind::Fill => "Fill",
        }
    }
}

/// Text value that remembers whether it was stored as UTF-16.
///
/// The flag only steers binary encoding; two strings with the same text are
/// equal regardless of it.
#[derive(Debug, Clone, Default)]
pub struct PlistString {
    value: String,
    is_utf16: bool,
}

impl PlistString {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_utf16: false,
        }
    }

    /// A string flagged for UTF-16 storage.
    pub fn utf16(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_utf16: true,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_utf16(&self) -> bool {
        self.is_utf16
    }

    /// Whether the binary encoder must use UTF-16 for this value.
    pub fn needs_utf16(&self) -> bool {
        self.is_utf16 || !self.value.is_ascii()
    }

    pub fn into_string(self) -> String {
        self.value
    }
}

impl PartialEq for PlistString {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for PlistString {}

impl From<&str> for PlistString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PlistString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Ordered string-keyed mapping.
///
/// Insertion order is preserved and keys are unique: inserting an existing
/// key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dictionary {
    entries: Vec<(String, PropertyNode)>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Insert a value, returning the previous value for the key.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<PropertyNode>,
    ) -> Option<PropertyNode> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&PropertyNode> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut PropertyNode> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove a key, keeping the order of the remaining entries.
    pub fn remove(&mut self, key: &str) -> Option<PropertyNode> {
        let position = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(position).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyNode)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Append every entry of `other`, replacing values of existing keys.
    pub fn extend(&mut self, other: Dictionary) {
        for (key, value) in other {
            self.insert(key, value);
        }
    }
}

impl IntoIterator for Dictionary {
    type Item = (String, PropertyNode);
    type IntoIter = std::vec::IntoIter<(String, PropertyNode)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: Into<String>, V: Into<PropertyNode>> FromIterator<(K, V)> for Dictionary {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dict = Dictionary::new();
        for (key, value) in iter {
            dict.insert(key, value);
        }
        dict
    }
}

/// A plist value.
///
/// Dates hold microsecond precision, the finest the binary format keeps.
/// Equality ignores anything finer.
#[derive(Debug, Clone)]
pub enum PropertyNode {
    Dictionary(Dictionary),
    Array(Vec<PropertyNode>),
    String(PlistString),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Data(Vec<u8>),
    Date(DateTime<Utc>),
    /// Archiver object reference (binary plists only).
    Uid(u64),
    /// Binary-only null marker.
    Null,
    /// Binary-only fill marker.
    Fill,
}

impl PartialEq for PropertyNode {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropertyNode::Dictionary(a), PropertyNode::Dictionary(b)) => a == b,
            (PropertyNode::Array(a), PropertyNode::Array(b)) => a == b,
            (PropertyNode::String(a), PropertyNode::String(b)) => a == b,
            (PropertyNode::Integer(a), PropertyNode::Integer(b)) => a == b,
            (PropertyNode::Real(a), PropertyNode::Real(b)) => a == b,
            (PropertyNode::Boolean(a), PropertyNode::Boolean(b)) => a == b,
            (PropertyNode::Data(a), PropertyNode::Data(b)) => a == b,
            (PropertyNode::Date(a), PropertyNode::Date(b)) => {
                a.timestamp_micros() == b.timestamp_micros()
            }
            (PropertyNode::Uid(a), PropertyNode::Uid(b)) => a == b,
            (PropertyNode::Null, PropertyNode::Null) => true,
            (PropertyNode::Fill, PropertyNode::Fill) => true,
            _ => false,
        }
    }
}

impl PropertyNode {
    /// An empty or zero value of the given kind.
    pub fn empty(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Dictionary => PropertyNode::Dictionary(Dictionary::new()),
            NodeKind::Array => PropertyNode::Array(Vec::new()),
            NodeKind::String => PropertyNode::String(PlistString::default()),
            NodeKind::Integer => PropertyNode::Integer(0),
            NodeKind::Real => PropertyNode::Real(0.0),
            NodeKind::Boolean => PropertyNode::Boolean(false),
            NodeKind::Data => PropertyNode::Data(Vec::new()),
            NodeKind::Date => PropertyNode::Date(apple_epoch()),
            NodeKind::Uid => PropertyNode::Uid(0),
            NodeKind::Null => PropertyNode::Null,
            NodeKind::Fill => PropertyNode::Fill,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            PropertyNode::Dictionary(_) => NodeKind::Dictionary,
            PropertyNode::Array(_) => NodeKind::Array,
            PropertyNode::String(_) => NodeKind::String,
            PropertyNode::Integer(_) => NodeKind::Integer,
            PropertyNode::Real(_) => NodeKind::Real,
            PropertyNode::Boolean(_) => NodeKind::Boolean,
            PropertyNode::Data(_) => NodeKind::Data,
            PropertyNode::Date(_) => NodeKind::Date,
            PropertyNode::Uid(_) => NodeKind::Uid,
            PropertyNode::Null => NodeKind::Null,
            PropertyNode::Fill => NodeKind::Fill,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            PropertyNode::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dictionary(self) -> Option<Dictionary> {
        match self {
            PropertyNode::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PropertyNode]> {
        match self {
            PropertyNode::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            PropertyNode::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PropertyNode::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            PropertyNode::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            PropertyNode::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            PropertyNode::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            PropertyNode::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_uid(&self) -> Option<u64> {
        match self {
            PropertyNode::Uid(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<Dictionary> for PropertyNode {
    fn from(value: Dictionary) -> Self {
        PropertyNode::Dictionary(value)
    }
}

impl From<Vec<PropertyNode>> for PropertyNode {
    fn from(value: Vec<PropertyNode>) -> Self {
        PropertyNode::Array(value)
    }
}

impl From<PlistString> for PropertyNode {
    fn from(value: PlistString) -> Self {
        PropertyNode::String(value)
    }
}

impl From<&str> for PropertyNode {
    fn from(value: &str) -> Self {
        PropertyNode::String(PlistString::new(value))
    }
}

impl From<String> for PropertyNode {
    fn from(value: String) -> Self {
        PropertyNode::String(PlistString::new(value))
    }
}

impl From<i64> for PropertyNode {
    fn from(value: i64) -> Self {
        PropertyNode::Integer(value)
    }
}

impl From<i32> for PropertyNode {
    fn from(value: i32) -> Self {
        PropertyNode::Integer(value.into())
    }
}

impl From<u32> for PropertyNode {
    fn from(value: u32) -> Self {
        PropertyNode::Integer(value.into())
    }
}

impl From<u16> for PropertyNode {
    fn from(value: u16) -> Self {
        PropertyNode::Integer(value.into())
    }
}

impl From<f64> for PropertyNode {
    fn from(value: f64) -> Self {
        PropertyNode::Real(value)
    }
}

impl From<bool> for PropertyNode {
    fn from(value: bool) -> Self {
        PropertyNode::Boolean(value)
    }
}

impl From<Vec<u8>> for PropertyNode {
    fn from(value: Vec<u8>) -> Self {
        PropertyNode::Data(value)
    }
}

impl From<&[u8]> for PropertyNode {
    fn from(value: &[u8]) -> Self {
        PropertyNode::Data(value.to_vec())
    }
}

impl From<DateTime<Utc>> for PropertyNode {
    fn from(value: DateTime<Utc>) -> Self {
        PropertyNode::Date(value.trunc_subsecs(6))
    }
}
