//! Bit-packed presence masks and the flag serialiser.
//!
//! [`BitField`] is a fixed-width bit vector, byte-padded on the wire.
//! [`FlagSerialiser`] packs a named, ordered field list into
//! `[contents][nones?][payload...][booleans?]`, matching the design
//! notes' bit-for-bit layout (sentinels at the top two content bits).

use std::collections::HashMap;
use std::ops::{Index, IndexMut};

use bytes::BytesMut;

use crate::serialise::{AttrValue, DecodeErr, TypeFlag};

/// A fixed-length vector of bits, stored one-bit-per-bool for simplicity and
/// packed LSB-first into bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    bits: Vec<bool>,
}

impl BitField {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn clear(&mut self) {
        for bit in &mut self.bits {
            *bit = false;
        }
    }

    /// True if any bit is set.
    pub fn any(&self) -> bool {
        self.bits.iter().any(|b| *b)
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.bits.iter().copied()
    }

    pub fn byte_len_for(fields: usize) -> usize {
        (fields + 7) / 8
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::byte_len_for(self.bits.len())];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        out
    }

    pub fn from_bytes(data: &[u8], len: usize) -> Self {
        let mut bits = vec![false; len];
        for (i, bit) in bits.iter_mut().enumerate() {
            let byte = data.get(i / 8).copied().unwrap_or(0);
            *bit = (byte & (1 << (i % 8))) != 0;
        }
        Self { bits }
    }

    /// Overwrites this field's bits from wire data in place (used for
    /// `unpack_merge`).
    pub fn merge_from_bytes(&mut self, data: &[u8]) {
        for (i, bit) in self.bits.iter_mut().enumerate() {
            let byte = data.get(i / 8).copied().unwrap_or(0);
            *bit = (byte & (1 << (i % 8))) != 0;
        }
    }
}

impl Index<usize> for BitField {
    type Output = bool;
    fn index(&self, index: usize) -> &bool {
        &self.bits[index]
    }
}

impl IndexMut<usize> for BitField {
    fn index_mut(&mut self, index: usize) -> &mut bool {
        &mut self.bits[index]
    }
}

/// One field of a [`FlagSerialiser`]'s ordered field list.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub type_flag: TypeFlag,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, type_flag: TypeFlag) -> Self {
        Self {
            name: name.into(),
            type_flag,
        }
    }

    fn is_bool(&self) -> bool {
        matches!(self.type_flag.kind, crate::serialise::TypeKind::Bool)
    }
}

/// Packs/unpacks a named, ordered set of fields as:
/// `[contents bitmask][none bitmask?][non-bool payload...][bool bitmask?]`
pub struct FlagSerialiser {
    non_bool: Vec<FieldSpec>,
    bool_fields: Vec<FieldSpec>,
    total: usize,
}

const NONE_BIT_OFFSET: usize = 1; // content_bits[total + 1]
const BOOL_BIT_OFFSET: usize = 0; // content_bits[total]

impl FlagSerialiser {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        let (bool_fields, non_bool): (Vec<_>, Vec<_>) = fields.into_iter().partition(|f| f.is_bool());
        let total = non_bool.len() + bool_fields.len();
        Self {
            non_bool,
            bool_fields,
            total,
        }
    }

    fn content_len(&self) -> usize {
        self.total + 2
    }

    /// Packs a sparse map of field name -> value (missing keys are simply
    /// not included in the output; present keys may map to `None`).
    pub fn pack(&self, values: &HashMap<String, Option<AttrValue>>) -> Vec<u8> {
        let mut content_bits = BitField::new(self.content_len());
        let mut none_bits = BitField::new(self.total);
        let mut payload = BytesMut::new();

        for (index, field) in self.non_bool.iter().enumerate() {
            let Some(value) = values.get(&field.name) else {
                continue;
            };
            content_bits[index] = true;
            match value {
                None => none_bits[index] = true,
                Some(v) => {
                    let _ = field.type_flag.pack(v, &mut payload);
                }
            }
        }

        let bool_offset = self.non_bool.len();
        let mut bool_bits = BitField::new(self.bool_fields.len());
        let mut any_bool_present = false;
        for (index, field) in self.bool_fields.iter().enumerate() {
            let Some(value) = values.get(&field.name) else {
                continue;
            };
            any_bool_present = true;
            let content_index = bool_offset + index;
            content_bits[content_index] = true;
            match value {
                None => none_bits[content_index] = true,
                Some(v) => bool_bits[index] = v.as_bool().unwrap_or(false),
            }
        }

        let mut tail = BytesMut::new();
        if any_bool_present {
            tail.extend_from_slice(&bool_bits.to_bytes());
            content_bits[self.total + BOOL_BIT_OFFSET] = true;
        }

        let mut out = Vec::new();
        if none_bits.any() {
            out.extend_from_slice(&none_bits.to_bytes());
            content_bits[self.total + NONE_BIT_OFFSET] = true;
        }

        let mut result = content_bits.to_bytes();
        if !out.is_empty() {
            result.extend_from_slice(&out);
        }
        result.extend_from_slice(&payload);
        result.extend_from_slice(&tail);
        result
    }

    /// Unpacks a payload, optionally merging into `previous` values for
    /// fields whose serialiser benefits from in-place merge (BitFields).
    /// Returns `(field_name, value)` pairs for every field present in the
    /// message, plus the number of bytes consumed.
    pub fn unpack(
        &self,
        data: &[u8],
        previous: Option<&HashMap<String, AttrValue>>,
    ) -> Result<(Vec<(String, Option<AttrValue>)>, usize), DecodeErr> {
        let content_byte_len = BitField::byte_len_for(self.content_len());
        if data.len() < content_byte_len {
            return Err(DecodeErr::Truncated);
        }
        let content_bits = BitField::from_bytes(&data[..content_byte_len], self.content_len());
        let mut offset = content_byte_len;

        let has_none = content_bits[self.total + NONE_BIT_OFFSET];
        let has_bool = content_bits[self.total + BOOL_BIT_OFFSET];

        let none_bits = if has_none {
            let none_byte_len = BitField::byte_len_for(self.total);
            if data.len() < offset + none_byte_len {
                return Err(DecodeErr::Truncated);
            }
            let bits = BitField::from_bytes(&data[offset..offset + none_byte_len], self.total);
            offset += none_byte_len;
            bits
        } else {
            BitField::new(self.total)
        };

        let mut results = Vec::new();

        for (index, field) in self.non_bool.iter().enumerate() {
            if !content_bits[index] {
                continue;
            }
            if none_bits[index] {
                results.push((field.name.clone(), None));
                continue;
            }

            let remaining = &data[offset..];
            if let Some(prev_map) = previous {
                if let Some(AttrValue::BitField(existing)) = prev_map.get(&field.name) {
                    if matches!(field.type_flag.kind, crate::serialise::TypeKind::BitField) {
                        let mut merged = existing.clone();
                        let byte_len = BitField::byte_len_for(merged.len());
                        if remaining.len() < byte_len {
                            return Err(DecodeErr::Truncated);
                        }
                        merged.merge_from_bytes(&remaining[..byte_len]);
                        offset += byte_len;
                        results.push((field.name.clone(), Some(AttrValue::BitField(merged))));
                        continue;
                    }
                }
            }

            let (value, read) = field.type_flag.unpack_from(remaining)?;
            offset += read;
            results.push((field.name.clone(), Some(value)));
        }

        if has_bool && !self.bool_fields.is_empty() {
            let bool_byte_len = BitField::byte_len_for(self.bool_fields.len());
            if data.len() < offset + bool_byte_len {
                return Err(DecodeErr::Truncated);
            }
            let bool_bits = BitField::from_bytes(&data[offset..offset + bool_byte_len], self.bool_fields.len());
            offset += bool_byte_len;

            let bool_offset = self.non_bool.len();
            for (index, field) in self.bool_fields.iter().enumerate() {
                let content_index = bool_offset + index;
                if !content_bits[content_index] {
                    continue;
                }
                if none_bits[content_index] {
                    results.push((field.name.clone(), None));
                } else {
                    results.push((field.name.clone(), Some(AttrValue::Bool(bool_bits[index]))));
                }
            }
        }

        Ok((results, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialise::Constraint;

    fn fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("health", TypeFlag::uint(Constraint::with_max_value(200))),
            FieldSpec::new("name", TypeFlag::string(64)),
            FieldSpec::new("alive", TypeFlag::bool_flag()),
            FieldSpec::new("crouching", TypeFlag::bool_flag()),
        ]
    }

    #[test]
    fn empty_changeset_emits_no_fields() {
        let flag_ser = FlagSerialiser::new(fields());
        let values = HashMap::new();
        let packed = flag_ser.pack(&values);
        let (unpacked, read) = flag_ser.unpack(&packed, None).unwrap();
        assert!(unpacked.is_empty());
        assert_eq!(read, packed.len());
    }

    #[test]
    fn roundtrip_with_none_and_booleans() {
        let flag_ser = FlagSerialiser::new(fields());
        let mut values = HashMap::new();
        values.insert("health".to_string(), Some(AttrValue::UInt(75)));
        values.insert("name".to_string(), None);
        values.insert("alive".to_string(), Some(AttrValue::Bool(true)));
        values.insert("crouching".to_string(), Some(AttrValue::Bool(false)));

        let packed = flag_ser.pack(&values);
        let (unpacked, read) = flag_ser.unpack(&packed, None).unwrap();
        assert_eq!(read, packed.len());

        let as_map: HashMap<_, _> = unpacked.into_iter().collect();
        assert_eq!(as_map.get("health"), Some(&Some(AttrValue::UInt(75))));
        assert_eq!(as_map.get("name"), Some(&None));
        assert_eq!(as_map.get("alive"), Some(&Some(AttrValue::Bool(true))));
        assert_eq!(as_map.get("crouching"), Some(&Some(AttrValue::Bool(false))));
    }

    #[test]
    fn partial_field_set_only_includes_present_keys() {
        let flag_ser = FlagSerialiser::new(fields());
        let mut values = HashMap::new();
        values.insert("health".to_string(), Some(AttrValue::UInt(10)));

        let packed = flag_ser.pack(&values);
        let (unpacked, _) = flag_ser.unpack(&packed, None).unwrap();
        assert_eq!(unpacked.len(), 1);
        assert_eq!(unpacked[0].0, "health");
    }
}
