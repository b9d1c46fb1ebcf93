//! Binary property list (`bplist00`) codec.
//!
//! Layout: 8-byte magic, object table, offset table, 32-byte trailer. The
//! trailer holds 5 unused bytes, the sort version, the offset-table entry
//! width, the object-reference width, then the object count, top object
//! index and offset-table position as big-endian `u64`s.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use imobile_core::PlistError;

use crate::node::{Dictionary, PlistString, PropertyNode, APPLE_EPOCH_UNIX_SECS};
use crate::registry::TagRegistry;

pub(crate) const MAGIC: &[u8; 8] = b"bplist00";
const TRAILER_LEN: usize = 32;
const MAX_DEPTH: usize = 128;

/// Encoder and decoder for binary plists.
#[derive(Debug, Clone)]
pub struct BinaryCodec {
    registry: Arc<TagRegistry>,
}

impl BinaryCodec {
    pub fn new(registry: Arc<TagRegistry>) -> Self {
        Self { registry }
    }

    /// Decode a complete binary plist into its top-level node.
    pub fn decode(&self, data: &[u8]) -> Result<PropertyNode, PlistError> {
        let trailer = Trailer::parse(data)?;
        let offsets = trailer.read_offsets(data)?;
        let count = offsets.len();
        let mut reader = ObjectReader {
            data: &data[..trailer.offset_table_start],
            ref_size: trailer.ref_size,
            offsets,
            registry: &self.registry,
            resolved: vec![None; count],
            in_progress: vec![false; count],
        };
        reader.read_object(trailer.top_object, 0)
    }

    /// Encode a tree as a binary plist.
    pub fn encode(&self, node: &PropertyNode) -> Result<Vec<u8>, PlistError> {
        let mut flattener = Flattener::default();
        let top = flattener.flatten(node);
        let objects = flattener.objects;

        let ref_size = min_width((objects.len() - 1) as u64);
        let mut out = MAGIC.to_vec();
        let mut offsets = Vec::with_capacity(objects.len());

        for object in &objects {
            offsets.push(out.len() as u64);
            match object {
                FlatObject::Node(node) => write_scalar(&mut out, node)?,
                FlatObject::Key(node) => write_scalar(&mut out, node)?,
                FlatObject::Array(refs) => {
                    write_marker(&mut out, 0xA, refs.len())?;
                    for r in refs {
                        write_uint(&mut out, *r as u64, ref_size);
                    }
                }
                FlatObject::Dictionary { keys, values } => {
                    write_marker(&mut out, 0xD, keys.len())?;
                    for r in keys.iter().chain(values.iter()) {
                        write_uint(&mut out, *r as u64, ref_size);
                    }
                }
            }
        }

        let offset_table_start = out.len() as u64;
        let offset_size = min_width(offsets.last().copied().unwrap_or(0));
        for offset in &offsets {
            write_uint(&mut out, *offset, offset_size);
        }

        out.extend_from_slice(&[0u8; 6]);
        out.push(offset_size as u8);
        out.push(ref_size as u8);
        out.extend_from_slice(&(objects.len() as u64).to_be_bytes());
        out.extend_from_slice(&(top as u64).to_be_bytes());
        out.extend_from_slice(&offset_table_start.to_be_bytes());
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy)]
struct Trailer {
    offset_size: usize,
    ref_size: usize,
    num_objects: usize,
    top_object: usize,
    offset_table_start: usize,
}

impl Trailer {
    fn parse(data: &[u8]) -> Result<Self, PlistError> {
        if data.len() < MAGIC.len() + TRAILER_LEN {
            return Err(PlistError::InvalidFormat(format!(
                "{} bytes is too short for a binary plist",
                data.len()
            )));
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(PlistError::InvalidFormat(
                "missing bplist00 header".to_string(),
            ));
        }

        let trailer_start = data.len() - TRAILER_LEN;
        let t = &data[trailer_start..];
        let offset_size = t[6] as usize;
        let ref_size = t[7] as usize;
        for (name, width) in [("offset", offset_size), ("reference", ref_size)] {
            if !(1..=8).contains(&width) {
                return Err(PlistError::InvalidFormat(format!(
                    "invalid {name} width {width}"
                )));
            }
        }

        let num_objects = read_uint(&t[8..16]);
        let top_object = read_uint(&t[16..24]);
        let table_start = read_uint(&t[24..32]);

        if num_objects == 0 {
            return Err(PlistError::InvalidFormat("plist has no objects".to_string()));
        }
        if top_object >= num_objects {
            return Err(PlistError::OutOfBounds {
                offset: top_object,
                limit: num_objects,
            });
        }
        let table_end = num_objects
            .checked_mul(offset_size as u64)
            .and_then(|len| len.checked_add(table_start));
        match table_end {
            Some(end) if table_start >= MAGIC.len() as u64 && end <= trailer_start as u64 => {}
            _ => {
                return Err(PlistError::OutOfBounds {
                    offset: table_start,
                    limit: trailer_start as u64,
                })
            }
        }

        // All three fit in usize: they are bounded by data.len().
        Ok(Self {
            offset_size,
            ref_size,
            num_objects: num_objects as usize,
            top_object: top_object as usize,
            offset_table_start: table_start as usize,
        })
    }

    fn read_offsets(&self, data: &[u8]) -> Result<Vec<usize>, PlistError> {
        let table = &data[self.offset_table_start..];
        table
            .chunks_exact(self.offset_size)
            .take(self.num_objects)
            .map(|chunk| {
                let offset = read_uint(chunk);
                if offset < MAGIC.len() as u64 || offset >= self.offset_table_start as u64 {
                    return Err(PlistError::OutOfBounds {
                        offset,
                        limit: self.offset_table_start as u64,
                    });
                }
                Ok(offset as usize)
            })
            .collect()
    }
}

struct ObjectReader<'a> {
    data: &'a [u8],
    ref_size: usize,
    offsets: Vec<usize>,
    registry: &'a TagRegistry,
    resolved: Vec<Option<PropertyNode>>,
    in_progress: Vec<bool>,
}

impl ObjectReader<'_> {
    fn read_object(&mut self, index: usize, depth: usize) -> Result<PropertyNode, PlistError> {
        if index >= self.offsets.len() {
            return Err(PlistError::OutOfBounds {
                offset: index as u64,
                limit: self.offsets.len() as u64,
            });
        }
        if let Some(node) = &self.resolved[index] {
            return Ok(node.clone());
        }
        if self.in_progress[index] {
            return Err(PlistError::InvalidFormat(format!(
                "cyclic reference to object {index}"
            )));
        }
        if depth > MAX_DEPTH {
            return Err(PlistError::InvalidFormat(format!(
                "nesting deeper than {MAX_DEPTH} levels"
            )));
        }

        self.in_progress[index] = true;
        let node = self.parse_object(self.offsets[index], depth)?;
        self.in_progress[index] = false;
        self.resolved[index] = Some(node.clone());
        Ok(node)
    }

    fn parse_object(&mut self, offset: usize, depth: usize) -> Result<PropertyNode, PlistError> {
        let marker = self.slice(offset, 1)?[0];
        let low = marker & 0x0F;
        let pos = offset + 1;

        let node = self.registry.create_by_binary_tag(marker >> 4, low)?;
        match node {
            PropertyNode::Null | PropertyNode::Fill => Ok(node),
            PropertyNode::Boolean(_) => match low {
                0x8 => Ok(PropertyNode::Boolean(false)),
                0x9 => Ok(PropertyNode::Boolean(true)),
                _ => Err(PlistError::InvalidFormat(format!(
                    "invalid marker {marker:#04x}"
                ))),
            },
            PropertyNode::Integer(_) => {
                if low > 4 {
                    return Err(PlistError::InvalidFormat(format!(
                        "invalid integer width exponent {low}"
                    )));
                }
                let bytes = self.slice(pos, 1 << low)?;
                Ok(PropertyNode::Integer(decode_integer(bytes)))
            }
            PropertyNode::Real(_) => match low {
                2 => {
                    let bytes = self.slice(pos, 4)?;
                    let bits = read_uint(bytes) as u32;
                    Ok(PropertyNode::Real(f32::from_bits(bits) as f64))
                }
                3 => {
                    let bytes = self.slice(pos, 8)?;
                    Ok(PropertyNode::Real(f64::from_bits(read_uint(bytes))))
                }
                _ => Err(PlistError::InvalidFormat(format!(
                    "invalid real width exponent {low}"
                ))),
            },
            PropertyNode::Date(_) => {
                if low != 3 {
                    return Err(PlistError::InvalidFormat(format!(
                        "invalid date marker {marker:#04x}"
                    )));
                }
                let bytes = self.slice(pos, 8)?;
                let seconds = f64::from_bits(read_uint(bytes));
                Ok(PropertyNode::Date(date_from_apple_seconds(seconds)?))
            }
            PropertyNode::Data(_) => {
                let (len, start) = self.read_length(low, pos)?;
                Ok(PropertyNode::Data(self.slice(start, len)?.to_vec()))
            }
            PropertyNode::String(s) if s.is_utf16() => {
                let (len, start) = self.read_length(low, pos)?;
                let byte_len = len.checked_mul(2).ok_or(PlistError::OutOfBounds {
                    offset: start as u64,
                    limit: self.data.len() as u64,
                })?;
                let units: Vec<u16> = self
                    .slice(start, byte_len)?
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                let text = String::from_utf16(&units).map_err(|_| {
                    PlistError::InvalidFormat(format!("invalid UTF-16 string at offset {offset}"))
                })?;
                Ok(PropertyNode::String(PlistString::utf16(text)))
            }
            PropertyNode::String(_) => {
                let (len, start) = self.read_length(low, pos)?;
                let text = std::str::from_utf8(self.slice(start, len)?).map_err(|_| {
                    PlistError::InvalidFormat(format!("invalid ASCII string at offset {offset}"))
                })?;
                Ok(PropertyNode::String(PlistString::new(text)))
            }
            PropertyNode::Uid(_) => {
                let width = low as usize + 1;
                if width > 8 {
                    return Err(PlistError::InvalidFormat(format!(
                        "invalid uid width {width}"
                    )));
                }
                Ok(PropertyNode::Uid(read_uint(self.slice(pos, width)?)))
            }
            PropertyNode::Array(_) => {
                let (count, start) = self.read_length(low, pos)?;
                let refs = self.read_refs(start, count)?;
                let mut items = Vec::with_capacity(refs.len());
                for r in refs {
                    items.push(self.read_object(r, depth + 1)?);
                }
                Ok(PropertyNode::Array(items))
            }
            PropertyNode::Dictionary(_) => {
                let (count, start) = self.read_length(low, pos)?;
                let refs = self.read_refs(start, count.saturating_mul(2))?;
                let (key_refs, value_refs) = refs.split_at(count);
                let mut dict = Dictionary::with_capacity(count);
                for (&k, &v) in key_refs.iter().zip(value_refs) {
                    let key = match self.read_object(k, depth + 1)? {
                        PropertyNode::String(s) => s.into_string(),
                        other => {
                            return Err(PlistError::InvalidFormat(format!(
                                "dictionary key must be a string, found {}",
                                other.kind().name()
                            )))
                        }
                    };
                    let value = self.read_object(v, depth + 1)?;
                    dict.insert(key, value);
                }
                Ok(PropertyNode::Dictionary(dict))
            }
        }
    }

    /// Resolve a marker's length nibble, following an extended length if present.
    fn read_length(&self, low: u8, pos: usize) -> Result<(usize, usize), PlistError> {
        if low != 0x0F {
            return Ok((low as usize, pos));
        }
        let marker = self.slice(pos, 1)?[0];
        let exponent = marker & 0x0F;
        match self.registry.create_by_binary_tag(marker >> 4, exponent)? {
            PropertyNode::Integer(_) if exponent <= 3 => {}
            _ => {
                return Err(PlistError::InvalidFormat(format!(
                    "invalid extended length marker {marker:#04x}"
                )))
            }
        }
        let width = 1usize << exponent;
        let value = read_uint(self.slice(pos + 1, width)?);
        let len = usize::try_from(value).map_err(|_| PlistError::OutOfBounds {
            offset: value,
            limit: self.data.len() as u64,
        })?;
        Ok((len, pos + 1 + width))
    }

    fn read_refs(&self, start: usize, count: usize) -> Result<Vec<usize>, PlistError> {
        let byte_len = count
            .checked_mul(self.ref_size)
            .ok_or(PlistError::OutOfBounds {
                offset: start as u64,
                limit: self.data.len() as u64,
            })?;
        Ok(self
            .slice(start, byte_len)?
            .chunks_exact(self.ref_size)
            .map(|chunk| read_uint(chunk) as usize)
            .collect())
    }

    fn slice(&self, pos: usize, len: usize) -> Result<&[u8], PlistError> {
        pos.checked_add(len)
            .filter(|&end| end <= self.data.len())
            .map(|end| &self.data[pos..end])
            .ok_or(PlistError::Truncated {
                offset: pos,
                needed: len,
                available: self.data.len().saturating_sub(pos),
            })
    }
}

/// Big-endian unsigned read of up to 8 bytes.
fn read_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

/// Widths below 8 bytes are unsigned, 8 is signed, 16 keeps the low 8 bytes.
fn decode_integer(bytes: &[u8]) -> i64 {
    match bytes.len() {
        16 => read_uint(&bytes[8..]) as i64,
        _ => read_uint(bytes) as i64,
    }
}

fn date_from_apple_seconds(seconds: f64) -> Result<DateTime<Utc>, PlistError> {
    if !seconds.is_finite() {
        return Err(PlistError::InvalidFormat(format!("invalid date {seconds}")));
    }
    let micros = (seconds * 1_000_000.0).round() as i64;
    micros
        .checked_add(APPLE_EPOCH_UNIX_SECS * 1_000_000)
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .ok_or_else(|| PlistError::InvalidFormat(format!("date {seconds} out of range")))
}

fn date_to_apple_seconds(date: &DateTime<Utc>) -> f64 {
    (date.timestamp_micros() - APPLE_EPOCH_UNIX_SECS * 1_000_000) as f64 / 1_000_000.0
}

/// Smallest of 1, 2, 4 or 8 bytes that holds `value`.
fn min_width(value: u64) -> usize {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFFFF_FFFF => 4,
        _ => 8,
    }
}

fn write_uint(out: &mut Vec<u8>, value: u64, width: usize) {
    out.extend_from_slice(&value.to_be_bytes()[8 - width..]);
}

fn write_integer(out: &mut Vec<u8>, value: i64) {
    let width = if value < 0 { 8 } else { min_width(value as u64) };
    out.push(0x10 | width.trailing_zeros() as u8);
    write_uint(out, value as u64, width);
}

fn write_marker(out: &mut Vec<u8>, tag: u8, len: usize) -> Result<(), PlistError> {
    if len < 0x0F {
        out.push(tag << 4 | len as u8);
        Ok(())
    } else {
        out.push(tag << 4 | 0x0F);
        write_scalar(out, &TagRegistry::create_length_element(len))
    }
}

fn write_scalar(out: &mut Vec<u8>, node: &PropertyNode) -> Result<(), PlistError> {
    match node {
        PropertyNode::Null => out.push(0x00),
        PropertyNode::Fill => out.push(0x0F),
        PropertyNode::Boolean(false) => out.push(0x08),
        PropertyNode::Boolean(true) => out.push(0x09),
        PropertyNode::Integer(v) => write_integer(out, *v),
        PropertyNode::Real(v) => {
            out.push(0x23);
            out.extend_from_slice(&v.to_be_bytes());
        }
        PropertyNode::Date(d) => {
            out.push(0x33);
            out.extend_from_slice(&date_to_apple_seconds(d).to_be_bytes());
        }
        PropertyNode::Data(bytes) => {
            write_marker(out, 0x4, bytes.len())?;
            out.extend_from_slice(bytes);
        }
        PropertyNode::String(s) if s.needs_utf16() => {
            let units: Vec<u16> = s.as_str().encode_utf16().collect();
            write_marker(out, 0x6, units.len())?;
            for unit in units {
                out.extend_from_slice(&unit.to_be_bytes());
            }
        }
        PropertyNode::String(s) => {
            write_marker(out, 0x5, s.as_str().len())?;
            out.extend_from_slice(s.as_str().as_bytes());
        }
        PropertyNode::Uid(v) => {
            let width = min_width(*v);
            out.push(0x80 | (width as u8 - 1));
            write_uint(out, *v, width);
        }
        PropertyNode::Array(_) | PropertyNode::Dictionary(_) => {
            return Err(PlistError::InvalidFormat(
                "container written as a scalar".to_string(),
            ))
        }
    }
    Ok(())
}

enum FlatObject<'a> {
    Node(&'a PropertyNode),
    Key(PropertyNode),
    Array(Vec<usize>),
    Dictionary { keys: Vec<usize>, values: Vec<usize> },
}

/// Assigns object indices depth-first, top object first. Equal strings
/// (including dictionary keys) share one object.
#[derive(Default)]
struct Flattener<'a> {
    objects: Vec<FlatObject<'a>>,
    strings: HashMap<(String, bool), usize>,
}

impl<'a> Flattener<'a> {
    fn flatten(&mut self, node: &'a PropertyNode) -> usize {
        match node {
            PropertyNode::Array(items) => {
                let index = self.reserve();
                let refs = items.iter().map(|item| self.flatten(item)).collect();
                self.objects[index] = FlatObject::Array(refs);
                index
            }
            PropertyNode::Dictionary(dict) => {
                let index = self.reserve();
                let keys = dict.keys().map(|key| self.flatten_key(key)).collect();
                let values = dict.iter().map(|(_, value)| self.flatten(value)).collect();
                self.objects[index] = FlatObject::Dictionary { keys, values };
                index
            }
            PropertyNode::String(s) => {
                let key = (s.as_str().to_string(), s.needs_utf16());
                if let Some(&index) = self.strings.get(&key) {
                    return index;
                }
                let index = self.push(FlatObject::Node(node));
                self.strings.insert(key, index);
                index
            }
            other => self.push(FlatObject::Node(other)),
        }
    }

    fn flatten_key(&mut self, key: &str) -> usize {
        let element = TagRegistry::create_key_element(key);
        let utf16 = matches!(&element, PropertyNode::String(s) if s.needs_utf16());
        let lookup = (key.to_string(), utf16);
        if let Some(&index) = self.strings.get(&lookup) {
            return index;
        }
        let index = self.push(FlatObject::Key(element));
        self.strings.insert(lookup, index);
        index
    }

    fn reserve(&mut self) -> usize {
        self.push(FlatObject::Array(Vec::new()))
    }

    fn push(&mut self, object: FlatObject<'a>) -> usize {
        self.objects.push(object);
        self.objects.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::apple_epoch;
    use chrono::TimeZone;

    fn codec() -> BinaryCodec {
        BinaryCodec::new(Arc::new(TagRegistry::standard()))
    }

    /// Wrap a single encoded object into a complete one-object plist.
    fn single_object(object: &[u8]) -> Vec<u8> {
        let mut data = MAGIC.to_vec();
        data.extend_from_slice(object);
        let table_start = data.len() as u64;
        data.push(8);
        data.extend_from_slice(&[0u8; 6]);
        data.push(1);
        data.push(1);
        data.extend_from_slice(&1u64.to_be_bytes());
        data.extend_from_slice(&0u64.to_be_bytes());
        data.extend_from_slice(&table_start.to_be_bytes());
        data
    }

    /// Plist of `count` arrays, each holding the next, ending in an empty one.
    fn array_chain(count: usize) -> Vec<u8> {
        let mut data = MAGIC.to_vec();
        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            offsets.push(data.len() as u16);
            if i + 1 < count {
                data.push(0xA1);
                data.extend_from_slice(&((i + 1) as u16).to_be_bytes());
            } else {
                data.push(0xA0);
            }
        }
        let table_start = data.len() as u64;
        for offset in offsets {
            data.extend_from_slice(&offset.to_be_bytes());
        }
        data.extend_from_slice(&[0u8; 6]);
        data.push(2);
        data.push(2);
        data.extend_from_slice(&(count as u64).to_be_bytes());
        data.extend_from_slice(&0u64.to_be_bytes());
        data.extend_from_slice(&table_start.to_be_bytes());
        data
    }

    mod decode {
        use super::*;

        #[test]
        fn scalars() {
            let codec = codec();
            assert_eq!(codec.decode(&single_object(&[0x09])).unwrap(), PropertyNode::Boolean(true));
            assert_eq!(codec.decode(&single_object(&[0x08])).unwrap(), PropertyNode::Boolean(false));
            assert_eq!(codec.decode(&single_object(&[0x00])).unwrap(), PropertyNode::Null);
            assert_eq!(codec.decode(&single_object(&[0x0F])).unwrap(), PropertyNode::Fill);
            assert_eq!(
                codec.decode(&single_object(&[0x11, 0x01, 0x2C])).unwrap(),
                PropertyNode::Integer(300)
            );
            assert_eq!(
                codec.decode(&single_object(&[0x53, b'a', b'b', b'c'])).unwrap(),
                PropertyNode::from("abc")
            );
            assert_eq!(
                codec.decode(&single_object(&[0x81, 0x01, 0x00])).unwrap(),
                PropertyNode::Uid(256)
            );
        }

        #[test]
        fn eight_byte_integers_are_signed() {
            let mut object = vec![0x13];
            object.extend_from_slice(&(-2i64).to_be_bytes());
            assert_eq!(codec().decode(&single_object(&object)).unwrap(), PropertyNode::Integer(-2));
        }

        #[test]
        fn sixteen_byte_integers_keep_low_bytes() {
            let mut object = vec![0x14];
            object.extend_from_slice(&[0u8; 8]);
            object.extend_from_slice(&42u64.to_be_bytes());
            assert_eq!(codec().decode(&single_object(&object)).unwrap(), PropertyNode::Integer(42));
        }

        #[test]
        fn four_byte_reals() {
            let mut object = vec![0x22];
            object.extend_from_slice(&1.5f32.to_be_bytes());
            assert_eq!(codec().decode(&single_object(&object)).unwrap(), PropertyNode::Real(1.5));
        }

        #[test]
        fn dates_are_offsets_from_reference_date() {
            let mut object = vec![0x33];
            object.extend_from_slice(&60.0f64.to_be_bytes());
            let expected = apple_epoch() + chrono::Duration::seconds(60);
            assert_eq!(
                codec().decode(&single_object(&object)).unwrap(),
                PropertyNode::Date(expected)
            );
        }

        #[test]
        fn utf16_strings() {
            let object = [0x62, 0x00, b'h', 0x00, 0xE9];
            let node = codec().decode(&single_object(&object)).unwrap();
            assert_eq!(node.as_string(), Some("h\u{e9}"));
            match node {
                PropertyNode::String(s) => assert!(s.is_utf16()),
                other => panic!("unexpected node {other:?}"),
            }
        }

        #[test]
        fn extended_length_matches_inline_length() {
            let inline = codec().decode(&single_object(&[0x53, b'x', b'y', b'z'])).unwrap();
            let extended = codec()
                .decode(&single_object(&[0x5F, 0x10, 0x03, b'x', b'y', b'z']))
                .unwrap();
            assert_eq!(inline, extended);
        }

        #[test]
        fn shared_objects_decode_to_equal_subtrees() {
            // array [obj1, obj1] where obj1 = "s"
            let mut data = MAGIC.to_vec();
            data.extend_from_slice(&[0xA2, 0x01, 0x01]);
            data.extend_from_slice(&[0x51, b's']);
            let table_start = data.len() as u64;
            data.extend_from_slice(&[8, 11]);
            data.extend_from_slice(&[0u8; 6]);
            data.extend_from_slice(&[1, 1]);
            data.extend_from_slice(&2u64.to_be_bytes());
            data.extend_from_slice(&0u64.to_be_bytes());
            data.extend_from_slice(&table_start.to_be_bytes());

            let node = codec().decode(&data).unwrap();
            assert_eq!(
                node,
                PropertyNode::Array(vec![PropertyNode::from("s"), PropertyNode::from("s")])
            );
        }
    }

    mod malformed {
        use super::*;

        #[test]
        fn unknown_tag_is_reported() {
            assert_eq!(
                codec().decode(&single_object(&[0xC0])).unwrap_err(),
                PlistError::UnknownBinaryTag(0xC)
            );
            assert_eq!(
                codec().decode(&single_object(&[0x70])).unwrap_err(),
                PlistError::UnknownBinaryTag(0x7)
            );
        }

        #[test]
        fn bad_magic() {
            let mut data = single_object(&[0x09]);
            data[0] = b'x';
            assert!(matches!(
                codec().decode(&data),
                Err(PlistError::InvalidFormat(_))
            ));
        }

        #[test]
        fn too_short() {
            assert!(matches!(
                codec().decode(b"bplist00"),
                Err(PlistError::InvalidFormat(_))
            ));
        }

        #[test]
        fn invalid_widths() {
            let mut data = single_object(&[0x09]);
            let len = data.len();
            data[len - 26] = 0;
            assert!(matches!(
                codec().decode(&data),
                Err(PlistError::InvalidFormat(_))
            ));
        }

        #[test]
        fn top_object_out_of_range() {
            let mut data = single_object(&[0x09]);
            let len = data.len();
            data[len - 9] = 5;
            assert!(matches!(
                codec().decode(&data),
                Err(PlistError::OutOfBounds { .. })
            ));
        }

        #[test]
        fn truncated_string() {
            assert!(matches!(
                codec().decode(&single_object(&[0x55, b'a'])),
                Err(PlistError::Truncated { .. })
            ));
        }

        #[test]
        fn deep_nesting_is_rejected() {
            assert!(matches!(
                codec().decode(&array_chain(300)),
                Err(PlistError::InvalidFormat(_))
            ));
        }

        #[test]
        fn nesting_within_limit_decodes() {
            let mut node = codec().decode(&array_chain(100)).unwrap();
            let mut levels = 1;
            while let PropertyNode::Array(mut items) = node {
                match items.pop() {
                    Some(inner) => {
                        node = inner;
                        levels += 1;
                    }
                    None => break,
                }
            }
            assert_eq!(levels, 100);
        }

        #[test]
        fn self_referencing_array() {
            assert!(matches!(
                codec().decode(&single_object(&[0xA1, 0x00])),
                Err(PlistError::InvalidFormat(_))
            ));
        }

        #[test]
        fn non_string_dictionary_key() {
            // dict { 1 => 1 }
            let mut data = MAGIC.to_vec();
            data.extend_from_slice(&[0xD1, 0x01, 0x01]);
            data.extend_from_slice(&[0x10, 0x01]);
            let table_start = data.len() as u64;
            data.extend_from_slice(&[8, 11]);
            data.extend_from_slice(&[0u8; 6]);
            data.extend_from_slice(&[1, 1]);
            data.extend_from_slice(&2u64.to_be_bytes());
            data.extend_from_slice(&0u64.to_be_bytes());
            data.extend_from_slice(&table_start.to_be_bytes());

            assert!(matches!(
                codec().decode(&data),
                Err(PlistError::InvalidFormat(_))
            ));
        }

        #[test]
        fn invalid_boolean_marker() {
            assert!(matches!(
                codec().decode(&single_object(&[0x05])),
                Err(PlistError::InvalidFormat(_))
            ));
        }
    }

    mod encode {
        use super::*;

        fn sample_tree() -> PropertyNode {
            let mut inner = Dictionary::new();
            inner.insert("Negative", -5i64);
            inner.insert("Big", i64::MAX);
            inner.insert("Pi", 3.25f64);
            inner.insert("Blob", vec![0u8; 40]);
            inner.insert("Unicode", "caf\u{e9}");
            inner.insert(
                "When",
                Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            );

            let mut root = Dictionary::new();
            root.insert("Request", "GetValue");
            root.insert("Label", "imobile-rs");
            root.insert("Flags", vec![PropertyNode::from(true), PropertyNode::from(false)]);
            root.insert("Inner", inner);
            root.insert("Ref", PropertyNode::Uid(3));
            root.insert("Long", "a".repeat(100));
            PropertyNode::Dictionary(root)
        }

        #[test]
        fn round_trips_mixed_tree() {
            let codec = codec();
            let tree = sample_tree();
            let encoded = codec.encode(&tree).unwrap();
            assert!(encoded.starts_with(MAGIC));
            assert_eq!(codec.decode(&encoded).unwrap(), tree);
        }

        #[test]
        fn sub_microsecond_dates_round_trip() {
            let codec = codec();
            let precise = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
            let tree = PropertyNode::Array(vec![PropertyNode::Date(precise)]);

            let decoded = codec.encode(&tree).and_then(|b| codec.decode(&b)).unwrap();
            assert_eq!(decoded, tree);
            let date = decoded.as_array().unwrap()[0].as_date().unwrap();
            assert_eq!(date.timestamp_subsec_nanos(), 123_456_000);
        }

        #[test]
        fn preserves_key_order() {
            let codec = codec();
            let decoded = codec.encode(&sample_tree()).and_then(|b| codec.decode(&b)).unwrap();
            let keys: Vec<&str> = decoded.as_dictionary().unwrap().keys().collect();
            assert_eq!(keys, vec!["Request", "Label", "Flags", "Inner", "Ref", "Long"]);
        }

        #[test]
        fn equal_strings_share_an_object() {
            let tree = PropertyNode::Array(vec![
                PropertyNode::from("same"),
                PropertyNode::from("same"),
                PropertyNode::from("same"),
            ]);
            let encoded = codec().encode(&tree).unwrap();
            let trailer = &encoded[encoded.len() - TRAILER_LEN..];
            assert_eq!(read_uint(&trailer[8..16]), 2);
        }

        #[test]
        fn integers_use_smallest_width() {
            let encoded = codec().encode(&PropertyNode::Integer(200)).unwrap();
            assert_eq!(&encoded[8..10], &[0x10, 200]);

            let encoded = codec().encode(&PropertyNode::Integer(70_000)).unwrap();
            assert_eq!(encoded[8], 0x12);

            let encoded = codec().encode(&PropertyNode::Integer(-1)).unwrap();
            assert_eq!(encoded[8], 0x13);
        }

        #[test]
        fn long_lengths_use_extended_marker() {
            let encoded = codec().encode(&PropertyNode::Data(vec![7u8; 20])).unwrap();
            assert_eq!(&encoded[8..11], &[0x4F, 0x10, 20]);
        }

        #[test]
        fn many_objects_widen_references() {
            let items: Vec<PropertyNode> = (0..300i64).map(PropertyNode::Integer).collect();
            let tree = PropertyNode::Array(items);
            let codec = codec();
            let encoded = codec.encode(&tree).unwrap();
            let trailer = &encoded[encoded.len() - TRAILER_LEN..];
            assert_eq!(trailer[7], 2);
            assert_eq!(codec.decode(&encoded).unwrap(), tree);
        }

        #[test]
        fn utf16_flag_survives_round_trip() {
            let codec = codec();
            let tree = PropertyNode::String(PlistString::utf16("ascii"));
            let decoded = codec.decode(&codec.encode(&tree).unwrap()).unwrap();
            match decoded {
                PropertyNode::String(s) => assert!(s.is_utf16()),
                other => panic!("unexpected node {other:?}"),
            }
        }

        #[test]
        fn binary_only_markers_round_trip() {
            let codec = codec();
            let tree = PropertyNode::Array(vec![PropertyNode::Null, PropertyNode::Fill]);
            assert_eq!(codec.decode(&codec.encode(&tree).unwrap()).unwrap(), tree);
        }
    }
}
