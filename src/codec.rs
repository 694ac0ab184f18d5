//! Tag-type-length-value message codec.
//!
//! Every node is an 8-byte header (`tag << 8 | type`, then the value
//! length, both big-endian) followed by the value, zero-padded to a
//! multiple of 8 bytes. Struct values are the concatenated encodings of
//! their children, so a message is a tree.

// Lengths are bounded by the encode limit before any narrowing cast
#![allow(clippy::cast_possible_truncation)]

use thiserror::Error;

/// Size of a node header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum struct nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 32;

/// Errors from encoding or decoding a message tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("message truncated")]
    Truncated,

    #[error("unknown value type {0}")]
    BadType(u32),

    #[error("invalid length {len} for {kind:?} value")]
    BadLength { kind: Kind, len: u32 },

    #[error("message too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("message nested deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("expected exactly one message, found {0}")]
    NodeCount(usize),
}

/// A 24-bit message tag.
///
/// Tag meanings belong to the protocol layer; the codec carries any value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u32);

impl Tag {
    /// Largest representable tag.
    pub const MAX: u32 = 0x00ff_ffff;

    /// Create a tag, rejecting values that do not fit in 24 bits.
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        if raw > Self::MAX {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw & Self::MAX)
    }

    /// The numeric tag value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

/// Wire type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Kind {
    Int = 1,
    Long = 2,
    Bool = 3,
    Text = 4,
    Raw = 5,
    Struct = 6,
}

impl Kind {
    const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Int),
            2 => Some(Self::Long),
            3 => Some(Self::Bool),
            4 => Some(Self::Text),
            5 => Some(Self::Raw),
            6 => Some(Self::Struct),
            _ => None,
        }
    }

    const fn valid_len(self, len: u32) -> bool {
        match self {
            Self::Int | Self::Bool => len == 4,
            Self::Long => len == 8,
            Self::Struct => len % 8 == 0,
            Self::Text | Self::Raw => true,
        }
    }
}

/// A node value. Only `Struct` has children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Bool(bool),
    Text(Vec<u8>),
    Raw(Vec<u8>),
    Struct(Vec<Tlv>),
}

impl Value {
    /// The wire type of this value.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Self::Int(_) => Kind::Int,
            Self::Long(_) => Kind::Long,
            Self::Bool(_) => Kind::Bool,
            Self::Text(_) => Kind::Text,
            Self::Raw(_) => Kind::Raw,
            Self::Struct(_) => Kind::Struct,
        }
    }

    /// Unpadded value length as written in the header.
    fn len(&self) -> usize {
        match self {
            Self::Int(_) | Self::Bool(_) => 4,
            Self::Long(_) => 8,
            Self::Text(bytes) | Self::Raw(bytes) => bytes.len(),
            Self::Struct(children) => children.iter().map(Tlv::encoded_len).sum(),
        }
    }
}

/// One node of a message tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tag: Tag,
    pub value: Value,
}

const fn round8(len: usize) -> usize {
    (len + 7) & !7
}

impl Tlv {
    #[must_use]
    pub const fn new(tag: Tag, value: Value) -> Self {
        Self { tag, value }
    }

    #[must_use]
    pub const fn int(tag: Tag, v: i32) -> Self {
        Self::new(tag, Value::Int(v))
    }

    #[must_use]
    pub const fn long(tag: Tag, v: i64) -> Self {
        Self::new(tag, Value::Long(v))
    }

    #[must_use]
    pub const fn bool(tag: Tag, v: bool) -> Self {
        Self::new(tag, Value::Bool(v))
    }

    #[must_use]
    pub fn text(tag: Tag, v: impl Into<Vec<u8>>) -> Self {
        Self::new(tag, Value::Text(v.into()))
    }

    #[must_use]
    pub fn raw(tag: Tag, v: impl Into<Vec<u8>>) -> Self {
        Self::new(tag, Value::Raw(v.into()))
    }

    /// An empty struct node; add children with [`Tlv::with`].
    #[must_use]
    pub const fn structure(tag: Tag) -> Self {
        Self::new(tag, Value::Struct(Vec::new()))
    }

    /// Append a child. Has no effect on non-struct nodes.
    #[must_use]
    pub fn with(mut self, child: Self) -> Self {
        if let Value::Struct(children) = &mut self.value {
            children.push(child);
        }
        self
    }

    /// Append a child if present.
    #[must_use]
    pub fn with_opt(self, child: Option<Self>) -> Self {
        match child {
            Some(child) => self.with(child),
            None => self,
        }
    }

    /// Children of a struct node; empty for scalars.
    #[must_use]
    pub fn children(&self) -> &[Self] {
        match &self.value {
            Value::Struct(children) => children,
            _ => &[],
        }
    }

    /// First child with the given tag.
    #[must_use]
    pub fn child(&self, tag: Tag) -> Option<&Self> {
        self.children().iter().find(|c| c.tag == tag)
    }

    #[must_use]
    pub const fn as_int(&self) -> Option<i32> {
        match self.value {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_long(&self) -> Option<i64> {
        match self.value {
            Value::Long(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self.value {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Bytes of a text or raw node.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Text(v) | Value::Raw(v) => Some(v),
            _ => None,
        }
    }

    /// Total encoded size of this node including header and padding.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + round8(self.value.len())
    }

    /// Encode the tree, failing without output if it exceeds `limit` bytes.
    pub fn encode(&self, limit: usize) -> Result<Vec<u8>, CodecError> {
        let size = self.encoded_len();
        let limit = limit.min(u32::MAX as usize);
        if size > limit {
            return Err(CodecError::TooLarge { size, limit });
        }
        let mut out = Vec::with_capacity(size);
        self.write_into(&mut out);
        Ok(out)
    }

    fn write_into(&self, out: &mut Vec<u8>) {
        let len = self.value.len();
        let word = (self.tag.get() << 8) | self.value.kind() as u32;
        out.extend_from_slice(&word.to_be_bytes());
        out.extend_from_slice(&(len as u32).to_be_bytes());

        let start = out.len();
        match &self.value {
            Value::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Bool(v) => out.extend_from_slice(&u32::from(*v).to_be_bytes()),
            Value::Long(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Text(bytes) | Value::Raw(bytes) => out.extend_from_slice(bytes),
            Value::Struct(children) => {
                for child in children {
                    child.write_into(out);
                }
            }
        }
        out.resize(start + round8(len), 0);
    }
}

/// Decode a buffer into the list of sibling nodes it contains.
pub fn decode(input: &[u8]) -> Result<Vec<Tlv>, CodecError> {
    decode_at_depth(input, 0)
}

/// Decode a buffer that must hold exactly one top-level node.
pub fn decode_message(input: &[u8]) -> Result<Tlv, CodecError> {
    let mut nodes = decode(input)?;
    match nodes.len() {
        1 => nodes.pop().ok_or(CodecError::NodeCount(0)),
        n => Err(CodecError::NodeCount(n)),
    }
}

fn decode_at_depth(mut input: &[u8], depth: usize) -> Result<Vec<Tlv>, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep);
    }
    let mut nodes = Vec::new();
    while !input.is_empty() {
        let (node, rest) = decode_node(input, depth)?;
        nodes.push(node);
        input = rest;
    }
    Ok(nodes)
}

fn read_u32(bytes: &[u8]) -> Result<u32, CodecError> {
    bytes
        .get(..4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(u32::from_be_bytes)
        .ok_or(CodecError::Truncated)
}

fn decode_node(input: &[u8], depth: usize) -> Result<(Tlv, &[u8]), CodecError> {
    let header = input.get(..HEADER_SIZE).ok_or(CodecError::Truncated)?;
    let word = read_u32(header)?;
    let len = read_u32(&header[4..])?;

    let kind = Kind::from_code(word & 0xff).ok_or(CodecError::BadType(word & 0xff))?;
    if !kind.valid_len(len) {
        return Err(CodecError::BadLength { kind, len });
    }

    let len = len as usize;
    let end = HEADER_SIZE
        .checked_add(round8(len))
        .ok_or(CodecError::Truncated)?;
    let body = input.get(HEADER_SIZE..end).ok_or(CodecError::Truncated)?;
    let body = &body[..len];

    let value = match kind {
        Kind::Int => Value::Int(i32::from_be_bytes(read_u32(body)?.to_be_bytes())),
        Kind::Bool => Value::Bool(read_u32(body)? != 0),
        Kind::Long => {
            let bytes = <[u8; 8]>::try_from(body).map_err(|_| CodecError::Truncated)?;
            Value::Long(i64::from_be_bytes(bytes))
        }
        Kind::Text => Value::Text(body.to_vec()),
        Kind::Raw => Value::Raw(body.to_vec()),
        Kind::Struct => Value::Struct(decode_at_depth(body, depth + 1)?),
    };

    let node = Tlv {
        tag: Tag::from_raw(word >> 8),
        value,
    };
    Ok((node, &input[end..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Tag = Tag::from_raw(1);
    const B: Tag = Tag::from_raw(2);
    const C: Tag = Tag::from_raw(0x00ab_cdef);

    fn sample() -> Tlv {
        Tlv::structure(A)
            .with(Tlv::int(B, -7))
            .with(Tlv::long(B, 1 << 40))
            .with(Tlv::bool(C, true))
            .with(Tlv::text(B, "hello"))
            .with(Tlv::raw(B, vec![0u8, 1, 2]))
            .with(Tlv::structure(C).with(Tlv::int(A, 42)))
    }

    #[test]
    fn test_round_trip() {
        let msg = sample();
        let bytes = msg.encode(usize::MAX).unwrap();
        assert_eq!(bytes.len(), msg.encoded_len());
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_int_layout() {
        let bytes = Tlv::int(A, 0x0102_0304).encode(64).unwrap();
        assert_eq!(
            bytes,
            vec![0, 0, 1, 1, 0, 0, 0, 4, 1, 2, 3, 4, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_text_padding() {
        let bytes = Tlv::text(B, "abcdefghi").encode(64).unwrap();
        // header + 9 bytes padded to 16
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 9]);
        assert!(bytes[17..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_struct() {
        let bytes = Tlv::structure(A).encode(64).unwrap();
        assert_eq!(bytes, vec![0, 0, 1, 6, 0, 0, 0, 0]);
        assert_eq!(decode_message(&bytes).unwrap(), Tlv::structure(A));
    }

    #[test]
    fn test_encode_over_limit() {
        let msg = Tlv::raw(A, vec![b'x'; 100]);
        let err = msg.encode(64).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { size: 112, limit: 64 }));
    }

    #[test]
    fn test_every_strict_prefix_fails() {
        let bytes = sample().encode(usize::MAX).unwrap();
        for cut in 0..bytes.len() {
            assert!(
                decode_message(&bytes[..cut]).is_err(),
                "prefix of {cut} bytes decoded"
            );
        }
    }

    #[test]
    fn test_rejects_bad_type() {
        let mut bytes = Tlv::int(A, 1).encode(64).unwrap();
        bytes[3] = 7;
        assert_eq!(decode(&bytes).unwrap_err(), CodecError::BadType(7));
        bytes[3] = 0;
        assert_eq!(decode(&bytes).unwrap_err(), CodecError::BadType(0));
    }

    #[test]
    fn test_rejects_bad_scalar_lengths() {
        let mut bytes = Tlv::int(A, 1).encode(64).unwrap();
        bytes[7] = 8;
        assert!(matches!(
            decode(&bytes).unwrap_err(),
            CodecError::BadLength { kind: Kind::Int, len: 8 }
        ));

        let mut bytes = Tlv::long(A, 1).encode(64).unwrap();
        bytes[7] = 4;
        assert!(matches!(
            decode(&bytes).unwrap_err(),
            CodecError::BadLength { kind: Kind::Long, len: 4 }
        ));
    }

    #[test]
    fn test_rejects_unaligned_struct() {
        let mut bytes = Tlv::structure(A).with(Tlv::int(B, 1)).encode(64).unwrap();
        bytes[7] = 12;
        assert!(matches!(
            decode(&bytes).unwrap_err(),
            CodecError::BadLength { kind: Kind::Struct, .. }
        ));
    }

    #[test]
    fn test_struct_with_partial_child() {
        // struct claims 8 bytes of children but holds only a header fragment
        let bytes = [0, 0, 1, 6, 0, 0, 0, 8, 0, 0, 2, 1, 0, 0, 0, 4];
        assert_eq!(decode(&bytes).unwrap_err(), CodecError::Truncated);
    }

    #[test]
    fn test_siblings_in_order() {
        let mut bytes = Tlv::int(A, 1).encode(64).unwrap();
        bytes.extend(Tlv::text(B, "x").encode(64).unwrap());
        let nodes = decode(&bytes).unwrap();
        assert_eq!(nodes, vec![Tlv::int(A, 1), Tlv::text(B, "x")]);
        assert_eq!(decode_message(&bytes).unwrap_err(), CodecError::NodeCount(2));
    }

    #[test]
    fn test_unknown_tags_decode() {
        let bytes = Tlv::int(C, 5).encode(64).unwrap();
        assert_eq!(decode_message(&bytes).unwrap().tag.get(), 0x00ab_cdef);
    }

    #[test]
    fn test_nesting_limit() {
        let mut msg = Tlv::structure(A);
        for _ in 0..=MAX_DEPTH {
            msg = Tlv::structure(A).with(msg);
        }
        let bytes = msg.encode(usize::MAX).unwrap();
        assert_eq!(decode(&bytes).unwrap_err(), CodecError::TooDeep);
    }

    #[test]
    fn test_tag_range() {
        assert!(Tag::new(Tag::MAX).is_some());
        assert!(Tag::new(Tag::MAX + 1).is_none());
    }

    #[test]
    fn test_accessors() {
        let msg = sample();
        assert_eq!(msg.child(B).and_then(Tlv::as_int), Some(-7));
        assert_eq!(msg.child(C).and_then(Tlv::as_bool), Some(true));
        assert!(msg.child(Tag::from_raw(99)).is_none());
        assert!(Tlv::int(A, 1).children().is_empty());
    }
}
