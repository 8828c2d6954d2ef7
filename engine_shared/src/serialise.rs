//! Type-flag driven serialisation.
//!
//! A [`TypeFlag`] pairs a value kind with a constraint that picks the
//! smallest wire representation that can hold it (narrowest unsigned
//! integer width, 32- vs 64-bit float, length-prefix width for strings and
//! lists). Everything that needs to go on the wire — attribute values, RPC
//! arguments, bitfields — goes through a `TypeFlag`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::bitfield::BitField;
use crate::replicable::ReplicableId;

/// A packed attribute or RPC argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    BitField(BitField),
    List(Vec<AttrValue>),
    Replicable(Option<ReplicableId>),
}

impl AttrValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            AttrValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// Smallest integer width that can hold values up to `max_value` (or
/// governed directly by `max_bits`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
    U8,
    U16,
    U32,
    U64,
}

impl IntWidth {
    pub fn from_max_value(max_value: u64) -> Self {
        if max_value <= u8::MAX as u64 {
            IntWidth::U8
        } else if max_value <= u16::MAX as u64 {
            IntWidth::U16
        } else if max_value <= u32::MAX as u64 {
            IntWidth::U32
        } else {
            IntWidth::U64
        }
    }

    pub fn from_max_bits(max_bits: u8) -> Self {
        Self::from_max_value(if max_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << max_bits) - 1
        })
    }

    pub fn byte_width(self) -> usize {
        match self {
            IntWidth::U8 => 1,
            IntWidth::U16 => 2,
            IntWidth::U32 => 4,
            IntWidth::U64 => 8,
        }
    }

    fn pack(self, value: u64, buf: &mut BytesMut) {
        match self {
            IntWidth::U8 => buf.put_u8(value as u8),
            IntWidth::U16 => buf.put_u16(value as u16),
            IntWidth::U32 => buf.put_u32(value as u32),
            IntWidth::U64 => buf.put_u64(value),
        }
    }

    fn unpack(self, data: &[u8]) -> Result<(u64, usize), DecodeErr> {
        let width = self.byte_width();
        if data.len() < width {
            return Err(DecodeErr::Truncated);
        }
        let mut slice = &data[..width];
        let value = match self {
            IntWidth::U8 => slice.get_u8() as u64,
            IntWidth::U16 => slice.get_u16() as u64,
            IntWidth::U32 => slice.get_u32() as u64,
            IntWidth::U64 => slice.get_u64(),
        };
        Ok((value, width))
    }
}

/// Constraints attached to a [`TypeFlag`]; the fields that apply depend on
/// the flag's value kind.
#[derive(Debug, Clone, Default)]
pub struct Constraint {
    pub max_value: Option<u64>,
    pub max_bits: Option<u8>,
    pub max_precision: bool,
    pub max_length: Option<usize>,
    pub fields: Option<usize>,
    pub element_flag: Option<Box<TypeFlag>>,
}

impl Constraint {
    pub fn with_max_value(max_value: u64) -> Self {
        Self {
            max_value: Some(max_value),
            ..Default::default()
        }
    }

    pub fn with_max_bits(max_bits: u8) -> Self {
        Self {
            max_bits: Some(max_bits),
            ..Default::default()
        }
    }

    pub fn with_fields(fields: usize) -> Self {
        Self {
            fields: Some(fields),
            ..Default::default()
        }
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length: Some(max_length),
            ..Default::default()
        }
    }

    pub fn list_of(element: TypeFlag, max_length: Option<usize>) -> Self {
        Self {
            max_length,
            element_flag: Some(Box::new(element)),
            ..Default::default()
        }
    }
}

/// Value kind a [`TypeFlag`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Bool,
    UInt,
    Float,
    Str,
    Bytes,
    BitField,
    List,
    Replicable,
}

/// A `(concrete type, constraint map)` pair that fully determines how a
/// value is packed onto the wire.
#[derive(Debug, Clone)]
pub struct TypeFlag {
    pub kind: TypeKind,
    pub constraint: Constraint,
}

impl TypeFlag {
    pub fn bool_flag() -> Self {
        Self {
            kind: TypeKind::Bool,
            constraint: Constraint::default(),
        }
    }

    pub fn uint(constraint: Constraint) -> Self {
        Self {
            kind: TypeKind::UInt,
            constraint,
        }
    }

    pub fn float(max_precision: bool) -> Self {
        Self {
            kind: TypeKind::Float,
            constraint: Constraint {
                max_precision,
                ..Default::default()
            },
        }
    }

    pub fn string(max_length: usize) -> Self {
        Self {
            kind: TypeKind::Str,
            constraint: Constraint::with_max_length(max_length),
        }
    }

    pub fn bytes(max_length: usize) -> Self {
        Self {
            kind: TypeKind::Bytes,
            constraint: Constraint::with_max_length(max_length),
        }
    }

    pub fn bitfield(fields: usize) -> Self {
        Self {
            kind: TypeKind::BitField,
            constraint: Constraint::with_fields(fields),
        }
    }

    pub fn list(element: TypeFlag, max_length: Option<usize>) -> Self {
        Self {
            kind: TypeKind::List,
            constraint: Constraint::list_of(element, max_length),
        }
    }

    pub fn replicable() -> Self {
        Self {
            kind: TypeKind::Replicable,
            constraint: Constraint::default(),
        }
    }

    /// The integer width this flag resolves to. Only meaningful for
    /// `UInt`/length-prefix-bearing kinds.
    fn int_width(&self) -> IntWidth {
        if let Some(max_value) = self.constraint.max_value {
            IntWidth::from_max_value(max_value)
        } else if let Some(max_bits) = self.constraint.max_bits {
            IntWidth::from_max_bits(max_bits)
        } else {
            IntWidth::U32
        }
    }

    fn length_prefix_width(&self) -> IntWidth {
        match self.constraint.max_length {
            Some(max_len) => IntWidth::from_max_value(max_len as u64),
            None => IntWidth::U32,
        }
    }

    /// Packs `value` into `buf`, appending bytes.
    pub fn pack(&self, value: &AttrValue, buf: &mut BytesMut) -> Result<(), DecodeErr> {
        match (self.kind, value) {
            (TypeKind::Bool, AttrValue::Bool(b)) => {
                buf.put_u8(if *b { 1 } else { 0 });
                Ok(())
            }
            (TypeKind::UInt, AttrValue::UInt(v)) => {
                self.int_width().pack(*v, buf);
                Ok(())
            }
            (TypeKind::Float, AttrValue::Float(v)) => {
                if self.constraint.max_precision {
                    buf.put_f64(*v);
                } else {
                    buf.put_f32(*v as f32);
                }
                Ok(())
            }
            (TypeKind::Str, AttrValue::Str(s)) => {
                let bytes = s.as_bytes();
                self.length_prefix_width().pack(bytes.len() as u64, buf);
                buf.put_slice(bytes);
                Ok(())
            }
            (TypeKind::Bytes, AttrValue::Bytes(b)) => {
                self.length_prefix_width().pack(b.len() as u64, buf);
                buf.put_slice(b);
                Ok(())
            }
            (TypeKind::BitField, AttrValue::BitField(bf)) => {
                buf.put_slice(&bf.to_bytes());
                Ok(())
            }
            (TypeKind::List, AttrValue::List(items)) => {
                let element = self
                    .constraint
                    .element_flag
                    .as_ref()
                    .expect("list TypeFlag missing element_flag");
                self.length_prefix_width().pack(items.len() as u64, buf);
                for item in items {
                    element.pack(item, buf)?;
                }
                Ok(())
            }
            (TypeKind::Replicable, AttrValue::Replicable(id)) => {
                buf.put_u8(id.map(|i| i.0).unwrap_or(0));
                buf.put_u8(if id.is_some() { 1 } else { 0 });
                Ok(())
            }
            _ => Err(DecodeErr::KindMismatch),
        }
    }

    /// Unpacks a value from the front of `data`, returning the value and
    /// the number of bytes consumed.
    pub fn unpack_from(&self, data: &[u8]) -> Result<(AttrValue, usize), DecodeErr> {
        match self.kind {
            TypeKind::Bool => {
                if data.is_empty() {
                    return Err(DecodeErr::Truncated);
                }
                Ok((AttrValue::Bool(data[0] != 0), 1))
            }
            TypeKind::UInt => {
                let (value, width) = self.int_width().unpack(data)?;
                Ok((AttrValue::UInt(value), width))
            }
            TypeKind::Float => {
                if self.constraint.max_precision {
                    if data.len() < 8 {
                        return Err(DecodeErr::Truncated);
                    }
                    let mut slice = &data[..8];
                    Ok((AttrValue::Float(slice.get_f64()), 8))
                } else {
                    if data.len() < 4 {
                        return Err(DecodeErr::Truncated);
                    }
                    let mut slice = &data[..4];
                    Ok((AttrValue::Float(slice.get_f32() as f64), 4))
                }
            }
            TypeKind::Str => {
                let width = self.length_prefix_width();
                let (len, prefix_len) = width.unpack(data)?;
                let len = len as usize;
                let rest = &data[prefix_len..];
                if rest.len() < len {
                    return Err(DecodeErr::Truncated);
                }
                let s = std::str::from_utf8(&rest[..len])
                    .map_err(|_| DecodeErr::Utf8)?
                    .to_string();
                Ok((AttrValue::Str(s), prefix_len + len))
            }
            TypeKind::Bytes => {
                let width = self.length_prefix_width();
                let (len, prefix_len) = width.unpack(data)?;
                let len = len as usize;
                let rest = &data[prefix_len..];
                if rest.len() < len {
                    return Err(DecodeErr::Truncated);
                }
                Ok((AttrValue::Bytes(rest[..len].to_vec()), prefix_len + len))
            }
            TypeKind::BitField => {
                let fields = self.constraint.fields.unwrap_or(0);
                let byte_len = BitField::byte_len_for(fields);
                if data.len() < byte_len {
                    return Err(DecodeErr::Truncated);
                }
                let bf = BitField::from_bytes(&data[..byte_len], fields);
                Ok((AttrValue::BitField(bf), byte_len))
            }
            TypeKind::List => {
                let element = self
                    .constraint
                    .element_flag
                    .as_ref()
                    .expect("list TypeFlag missing element_flag");
                let width = self.length_prefix_width();
                let (len, mut offset) = width.unpack(data)?;
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    let (item, read) = element.unpack_from(&data[offset..])?;
                    items.push(item);
                    offset += read;
                }
                Ok((AttrValue::List(items), offset))
            }
            TypeKind::Replicable => {
                if data.len() < 2 {
                    return Err(DecodeErr::Truncated);
                }
                let id = if data[1] != 0 {
                    Some(ReplicableId(data[0]))
                } else {
                    None
                };
                Ok((AttrValue::Replicable(id), 2))
            }
        }
    }

    /// Byte width this flag will occupy for a given value (used to decide
    /// how far a cursor should advance without re-unpacking).
    pub fn packed_size(&self, value: &AttrValue) -> usize {
        let mut buf = BytesMut::new();
        let _ = self.pack(value, &mut buf);
        buf.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErr {
    Truncated,
    KindMismatch,
    Utf8,
}

impl std::fmt::Display for DecodeErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeErr::Truncated => write!(f, "truncated data"),
            DecodeErr::KindMismatch => write!(f, "value does not match TypeFlag kind"),
            DecodeErr::Utf8 => write!(f, "invalid utf8"),
        }
    }
}

impl std::error::Error for DecodeErr {}

/// Packs a single length-prefixed string using a `u16` length (used for the
/// handshake failure payload: two length-prefixed strings).
pub fn pack_short_string(s: &str, buf: &mut BytesMut) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Unpacks a `u16`-length-prefixed string, returning it and bytes consumed.
pub fn unpack_short_string(data: &[u8]) -> Result<(String, usize), DecodeErr> {
    if data.len() < 2 {
        return Err(DecodeErr::Truncated);
    }
    let mut len_slice = &data[..2];
    let len = len_slice.get_u16() as usize;
    if data.len() < 2 + len {
        return Err(DecodeErr::Truncated);
    }
    let s = std::str::from_utf8(&data[2..2 + len])
        .map_err(|_| DecodeErr::Utf8)?
        .to_string();
    Ok((s, 2 + len))
}

pub fn encode_bytes_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_width_selects_smallest() {
        assert_eq!(IntWidth::from_max_value(200), IntWidth::U8);
        assert_eq!(IntWidth::from_max_value(60000), IntWidth::U16);
        assert_eq!(IntWidth::from_max_value(5_000_000_000), IntWidth::U64);
    }

    #[test]
    fn uint_roundtrip() {
        let flag = TypeFlag::uint(Constraint::with_max_value(1000));
        let mut buf = BytesMut::new();
        flag.pack(&AttrValue::UInt(42), &mut buf).unwrap();
        assert_eq!(buf.len(), 2);
        let (value, read) = flag.unpack_from(&buf).unwrap();
        assert_eq!(value, AttrValue::UInt(42));
        assert_eq!(read, 2);
    }

    #[test]
    fn string_roundtrip() {
        let flag = TypeFlag::string(32);
        let mut buf = BytesMut::new();
        flag.pack(&AttrValue::Str("hello".into()), &mut buf).unwrap();
        let (value, read) = flag.unpack_from(&buf).unwrap();
        assert_eq!(value, AttrValue::Str("hello".into()));
        assert_eq!(read, buf.len());
    }

    #[test]
    fn list_roundtrip() {
        let flag = TypeFlag::list(TypeFlag::uint(Constraint::with_max_value(255)), None);
        let mut buf = BytesMut::new();
        let items = AttrValue::List(vec![AttrValue::UInt(1), AttrValue::UInt(2), AttrValue::UInt(3)]);
        flag.pack(&items, &mut buf).unwrap();
        let (value, _) = flag.unpack_from(&buf).unwrap();
        assert_eq!(value, items);
    }

    #[test]
    fn short_string_roundtrip() {
        let mut buf = BytesMut::new();
        pack_short_string("AuthenticationFailed", &mut buf);
        let (s, read) = unpack_short_string(&buf).unwrap();
        assert_eq!(s, "AuthenticationFailed");
        assert_eq!(read, buf.len());
    }
}
