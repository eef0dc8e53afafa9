/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Binary property list (`bplist00`) reader and writer, covering the object
//! types AirPlay messages actually use: dicts, arrays, strings, data,
//! integers, booleans and reals.

use crate::error::{PlistError, PlistResult};

const MAGIC: &[u8; 8] = b"bplist00";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Real(f64),
    String(String),
    Data(Vec<u8>),
    Array(Vec<Value>),
    Dict(Vec<(String, Value)>),
}

impl Value {
    pub fn dict() -> Value {
        Value::Dict(Vec::new())
    }

    pub fn insert(&mut self, key: &str, value: Value) -> &mut Self {
        if let Value::Dict(entries) = self {
            entries.push((key.to_owned(), value));
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Integer(i) => Some(*i as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Value::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

pub fn is_binary_plist(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] == MAGIC
}

// ---------------------------------------------------------------------------
// reader

struct Reader<'a> {
    bytes: &'a [u8],
    offset_table: Vec<usize>,
    ref_size: usize,
    depth: usize,
}

pub fn parse(bytes: &[u8]) -> PlistResult<Value> {
    if !is_binary_plist(bytes) {
        return Err(PlistError::BadMagic);
    }
    if bytes.len() < MAGIC.len() + 32 {
        return Err(PlistError::Malformed("truncated trailer".to_owned()));
    }

    let trailer = &bytes[bytes.len() - 32..];
    let offset_int_size = trailer[6] as usize;
    let ref_size = trailer[7] as usize;
    let num_objects = u64::from_be_bytes(trailer[8..16].try_into().expect("8 bytes")) as usize;
    let top_object = u64::from_be_bytes(trailer[16..24].try_into().expect("8 bytes")) as usize;
    let table_offset = u64::from_be_bytes(trailer[24..32].try_into().expect("8 bytes")) as usize;

    if offset_int_size == 0 || ref_size == 0 || num_objects == 0 {
        return Err(PlistError::Malformed("empty object table".to_owned()));
    }
    let table_end = table_offset
        .checked_add(num_objects * offset_int_size)
        .ok_or_else(|| PlistError::Malformed("offset table overflow".to_owned()))?;
    if table_end > bytes.len() - 32 {
        return Err(PlistError::Malformed("offset table out of range".to_owned()));
    }

    let mut offset_table = Vec::with_capacity(num_objects);
    for i in 0..num_objects {
        let start = table_offset + i * offset_int_size;
        offset_table.push(read_sized_uint(&bytes[start..start + offset_int_size]) as usize);
    }

    if top_object >= offset_table.len() {
        return Err(PlistError::Malformed("top object out of range".to_owned()));
    }

    let mut reader = Reader {
        bytes,
        offset_table,
        ref_size,
        depth: 0,
    };
    reader.read_object(top_object)
}

fn read_sized_uint(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in bytes {
        value = (value << 8) | b as u64;
    }
    value
}

impl Reader<'_> {
    fn read_object(&mut self, index: usize) -> PlistResult<Value> {
        if self.depth > 32 {
            return Err(PlistError::Malformed("nesting too deep".to_owned()));
        }
        let offset = *self
            .offset_table
            .get(index)
            .ok_or_else(|| PlistError::Malformed(format!("object ref {index} out of range")))?;
        let marker = *self
            .bytes
            .get(offset)
            .ok_or_else(|| PlistError::Malformed("object offset out of range".to_owned()))?;

        let object_type = marker >> 4;
        let info = (marker & 0x0F) as usize;

        match object_type {
            0x0 => match marker {
                0x08 => Ok(Value::Boolean(false)),
                0x09 => Ok(Value::Boolean(true)),
                _ => Err(PlistError::UnsupportedType(marker)),
            },
            // integer, 2^info bytes big endian
            0x1 => {
                let len = 1usize << info;
                let bytes = self.slice(offset + 1, len)?;
                Ok(Value::Integer(read_sized_uint(bytes) as i64))
            }
            0x2 => match info {
                2 => {
                    let bytes = self.slice(offset + 1, 4)?;
                    Ok(Value::Real(
                        f32::from_be_bytes(bytes.try_into().expect("4 bytes")) as f64,
                    ))
                }
                3 => {
                    let bytes = self.slice(offset + 1, 8)?;
                    Ok(Value::Real(f64::from_be_bytes(
                        bytes.try_into().expect("8 bytes"),
                    )))
                }
                _ => Err(PlistError::UnsupportedType(marker)),
            },
            0x4 => {
                let (len, data_offset) = self.length_and_offset(offset, info)?;
                Ok(Value::Data(self.slice(data_offset, len)?.to_vec()))
            }
            0x5 => {
                let (len, data_offset) = self.length_and_offset(offset, info)?;
                let bytes = self.slice(data_offset, len)?;
                Ok(Value::String(
                    String::from_utf8_lossy(bytes).into_owned(),
                ))
            }
            0x6 => {
                let (len, data_offset) = self.length_and_offset(offset, info)?;
                let bytes = self.slice(data_offset, len * 2)?;
                let utf16: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Ok(Value::String(String::from_utf16_lossy(&utf16)))
            }
            0xA => {
                let (len, refs_offset) = self.length_and_offset(offset, info)?;
                let mut array = Vec::with_capacity(len);
                self.depth += 1;
                for i in 0..len {
                    let r = self.object_ref(refs_offset + i * self.ref_size)?;
                    array.push(self.read_object(r)?);
                }
                self.depth -= 1;
                Ok(Value::Array(array))
            }
            0xD => {
                let (len, refs_offset) = self.length_and_offset(offset, info)?;
                let mut dict = Vec::with_capacity(len);
                self.depth += 1;
                for i in 0..len {
                    let key_ref = self.object_ref(refs_offset + i * self.ref_size)?;
                    let value_ref =
                        self.object_ref(refs_offset + (len + i) * self.ref_size)?;
                    let key = match self.read_object(key_ref)? {
                        Value::String(s) => s,
                        other => {
                            return Err(PlistError::Malformed(format!(
                                "non-string dict key: {other:?}"
                            )));
                        }
                    };
                    dict.push((key, self.read_object(value_ref)?));
                }
                self.depth -= 1;
                Ok(Value::Dict(dict))
            }
            _ => Err(PlistError::UnsupportedType(marker)),
        }
    }

    /// Collection/string lengths of 15 and more are carried in a following
    /// integer object.
    fn length_and_offset(&self, offset: usize, info: usize) -> PlistResult<(usize, usize)> {
        if info != 0x0F {
            return Ok((info, offset + 1));
        }
        let int_marker = *self
            .bytes
            .get(offset + 1)
            .ok_or_else(|| PlistError::Malformed("truncated length".to_owned()))?;
        if int_marker >> 4 != 0x1 {
            return Err(PlistError::Malformed("bad length marker".to_owned()));
        }
        let len_bytes = 1usize << (int_marker & 0x0F);
        let len = read_sized_uint(self.slice(offset + 2, len_bytes)?) as usize;
        Ok((len, offset + 2 + len_bytes))
    }

    fn object_ref(&self, offset: usize) -> PlistResult<usize> {
        Ok(read_sized_uint(self.slice(offset, self.ref_size)?) as usize)
    }

    fn slice(&self, offset: usize, len: usize) -> PlistResult<&[u8]> {
        self.bytes
            .get(offset..offset + len)
            .ok_or_else(|| PlistError::Malformed("object data out of range".to_owned()))
    }
}

// ---------------------------------------------------------------------------
// writer

pub fn serialize(value: &Value) -> Vec<u8> {
    let mut objects = Vec::new();
    flatten(value, &mut objects);

    let ref_size = ref_int_size(objects.len() as u64);
    let mut body = Vec::from(&MAGIC[..]);
    let mut offsets = Vec::with_capacity(objects.len());

    for object in &objects {
        offsets.push(body.len() as u64);
        write_object(object, ref_size, &mut body);
    }

    let table_offset = body.len() as u64;
    let offset_int_size = ref_int_size(table_offset);
    for offset in &offsets {
        write_sized_uint(*offset, offset_int_size, &mut body);
    }

    body.extend_from_slice(&[0u8; 6]);
    body.push(offset_int_size as u8);
    body.push(ref_size as u8);
    body.extend_from_slice(&(objects.len() as u64).to_be_bytes());
    body.extend_from_slice(&0u64.to_be_bytes());
    body.extend_from_slice(&table_offset.to_be_bytes());
    body
}

/// Flattened object list in parent-first order. The root ends up at index
/// zero, matching the trailer's top object. No object reuse.
enum Flat {
    Leaf(Value),
    Array(Vec<usize>),
    Dict(Vec<(usize, usize)>),
}

fn flatten(value: &Value, objects: &mut Vec<Flat>) -> usize {
    let index = objects.len();
    match value {
        Value::Array(items) => {
            objects.push(Flat::Array(Vec::new()));
            let refs: Vec<usize> = items.iter().map(|v| flatten(v, objects)).collect();
            objects[index] = Flat::Array(refs);
        }
        Value::Dict(entries) => {
            objects.push(Flat::Dict(Vec::new()));
            let refs: Vec<(usize, usize)> = entries
                .iter()
                .map(|(k, v)| {
                    let key_index = objects.len();
                    objects.push(Flat::Leaf(Value::String(k.clone())));
                    let value_index = flatten(v, objects);
                    (key_index, value_index)
                })
                .collect();
            objects[index] = Flat::Dict(refs);
        }
        leaf => objects.push(Flat::Leaf(leaf.clone())),
    }
    index
}

fn write_object(object: &Flat, ref_size: usize, out: &mut Vec<u8>) {
    match object {
        Flat::Leaf(Value::Boolean(false)) => out.push(0x08),
        Flat::Leaf(Value::Boolean(true)) => out.push(0x09),
        Flat::Leaf(Value::Integer(i)) => {
            let value = *i as u64;
            if value <= u8::MAX as u64 {
                out.push(0x10);
                out.push(value as u8);
            } else if value <= u16::MAX as u64 {
                out.push(0x11);
                out.extend_from_slice(&(value as u16).to_be_bytes());
            } else if value <= u32::MAX as u64 {
                out.push(0x12);
                out.extend_from_slice(&(value as u32).to_be_bytes());
            } else {
                out.push(0x13);
                out.extend_from_slice(&value.to_be_bytes());
            }
        }
        Flat::Leaf(Value::Real(r)) => {
            out.push(0x23);
            out.extend_from_slice(&r.to_be_bytes());
        }
        Flat::Leaf(Value::Data(data)) => {
            write_marker(0x4, data.len(), out);
            out.extend_from_slice(data);
        }
        Flat::Leaf(Value::String(s)) => {
            if s.is_ascii() {
                write_marker(0x5, s.len(), out);
                out.extend_from_slice(s.as_bytes());
            } else {
                let utf16: Vec<u16> = s.encode_utf16().collect();
                write_marker(0x6, utf16.len(), out);
                for unit in utf16 {
                    out.extend_from_slice(&unit.to_be_bytes());
                }
            }
        }
        Flat::Leaf(Value::Array(_)) | Flat::Leaf(Value::Dict(_)) => {
            unreachable!("containers are flattened")
        }
        Flat::Array(refs) => {
            write_marker(0xA, refs.len(), out);
            for r in refs {
                write_sized_uint(*r as u64, ref_size, out);
            }
        }
        Flat::Dict(refs) => {
            write_marker(0xD, refs.len(), out);
            for (k, _) in refs {
                write_sized_uint(*k as u64, ref_size, out);
            }
            for (_, v) in refs {
                write_sized_uint(*v as u64, ref_size, out);
            }
        }
    }
}

fn write_marker(object_type: u8, len: usize, out: &mut Vec<u8>) {
    if len < 15 {
        out.push((object_type << 4) | len as u8);
    } else {
        out.push((object_type << 4) | 0x0F);
        if len <= u8::MAX as usize {
            out.push(0x10);
            out.push(len as u8);
        } else if len <= u16::MAX as usize {
            out.push(0x11);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(0x12);
            out.extend_from_slice(&(len as u32).to_be_bytes());
        }
    }
}

fn write_sized_uint(value: u64, size: usize, out: &mut Vec<u8>) {
    for i in (0..size).rev() {
        out.push((value >> (8 * i)) as u8);
    }
}

fn ref_int_size(max_value: u64) -> usize {
    match max_value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFFFF_FFFF => 4,
        _ => 8,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> Value {
        let mut streams_entry = Value::dict();
        streams_entry
            .insert("type", Value::Integer(103))
            .insert("dataPort", Value::Integer(40_123))
            .insert("controlPort", Value::Integer(40_124))
            .insert("audioBufferSize", Value::Integer(8 * 1024 * 1024));
        let mut root = Value::dict();
        root.insert("eventPort", Value::Integer(40_125))
            .insert("timingPort", Value::Integer(0))
            .insert("timingProtocol", Value::String("PTP".to_owned()))
            .insert("shk", Value::Data(vec![0xAB; 32]))
            .insert("groupContainsGroupLeader", Value::Boolean(true))
            .insert("rate", Value::Real(1.0))
            .insert("streams", Value::Array(vec![streams_entry]));
        root
    }

    #[test]
    fn round_trip() {
        let original = sample();
        let bytes = serialize(&original);
        assert!(is_binary_plist(&bytes));
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn lookups_work_after_round_trip() {
        let parsed = parse(&serialize(&sample())).unwrap();
        assert_eq!(parsed.get("timingProtocol").and_then(Value::as_str), Some("PTP"));
        assert_eq!(parsed.get("eventPort").and_then(Value::as_u64), Some(40_125));
        assert_eq!(
            parsed.get("groupContainsGroupLeader").and_then(Value::as_bool),
            Some(true)
        );
        let streams = parsed.get("streams").and_then(Value::as_array).unwrap();
        assert_eq!(streams[0].get("type").and_then(Value::as_u64), Some(103));
        assert_eq!(
            parsed.get("shk").and_then(Value::as_data).map(<[u8]>::len),
            Some(32)
        );
    }

    #[test]
    fn long_collections_use_extended_lengths() {
        let mut root = Value::dict();
        root.insert(
            "items",
            Value::Array((0..40).map(Value::Integer).collect()),
        )
        .insert("blob", Value::Data(vec![7u8; 300]))
        .insert(
            "name",
            Value::String("a string comfortably longer than fifteen characters".to_owned()),
        );
        let parsed = parse(&serialize(&root)).unwrap();
        assert_eq!(parsed, root);
    }

    #[test]
    fn non_plist_is_rejected() {
        assert!(matches!(parse(b"not a plist"), Err(PlistError::BadMagic)));
        assert!(parse(b"bplist00").is_err());
    }

    #[test]
    fn unicode_strings_survive() {
        let mut root = Value::dict();
        root.insert("name", Value::String("Küche 🎵".to_owned()));
        let parsed = parse(&serialize(&root)).unwrap();
        assert_eq!(
            parsed.get("name").and_then(Value::as_str),
            Some("Küche 🎵")
        );
    }
}
