//! Attribute B-tree keys (HFS+ extended attributes).
//!
//! Only the structural layer is supported: key decoding and ordering, so the
//! checker can verify the attributes tree like any other. Attribute payloads
//! are never interpreted.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::cmp::Ordering;

use crate::error::{HfsError, Result};

/// Attribute key: (CNID, name, start block). The start block is nonzero
/// only for attributes large enough to spill into extent-based storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeKey {
    pub cnid: u32,
    pub start_block: u32,
    /// Attribute name as UTF-16 code units.
    pub name: Vec<u16>,
}

impl AttributeKey {
    /// Attribute keys order by CNID, then name (binary), then start block.
    pub fn compare(&self, other: &AttributeKey) -> Ordering {
        self.cnid
            .cmp(&other.cnid)
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.start_block.cmp(&other.start_block))
    }
}

/// Parse an attribute key from raw record bytes.
/// Layout: keyLength, padding, CNID, startBlock, nameLength, UTF-16 name.
pub fn parse_attribute_key(record: &[u8]) -> Result<(AttributeKey, usize)> {
    if record.len() < 14 {
        return Err(HfsError::InvalidBTree("attribute key too short".into()));
    }
    let key_length = BigEndian::read_u16(&record[0..]) as usize;
    let cnid = BigEndian::read_u32(&record[4..]);
    let start_block = BigEndian::read_u32(&record[8..]);
    let name_length = BigEndian::read_u16(&record[12..]) as usize;

    let name_end = 14 + name_length * 2;
    if name_end > record.len() || 12 + name_length * 2 != key_length {
        return Err(HfsError::InvalidBTree(format!(
            "attribute key inconsistent: key_length={}, name_length={}",
            key_length, name_length
        )));
    }
    let name = crate::unicode::utf16be_to_units(&record[14..name_end]);
    Ok((AttributeKey { cnid, start_block, name }, 2 + key_length))
}

/// Encode an attribute key (length prefix included).
pub fn encode_attribute_key(key: &AttributeKey) -> Vec<u8> {
    let key_length = 12 + key.name.len() * 2;
    let mut out = Vec::with_capacity(2 + key_length);
    out.write_u16::<BigEndian>(key_length as u16).unwrap();
    out.write_u16::<BigEndian>(0).unwrap(); // padding
    out.write_u32::<BigEndian>(key.cnid).unwrap();
    out.write_u32::<BigEndian>(key.start_block).unwrap();
    out.write_u16::<BigEndian>(key.name.len() as u16).unwrap();
    out.extend_from_slice(&crate::unicode::units_to_utf16be(&key.name));
    out
}

/// Order two raw attribute records by key.
pub fn compare_attribute_records(a: &[u8], b: &[u8]) -> Ordering {
    match (parse_attribute_key(a), parse_attribute_key(b)) {
        (Ok((ka, _)), Ok((kb, _))) => ka.compare(&kb),
        (Err(_), Ok(_)) => Ordering::Less,
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Err(_)) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unicode::string_to_units;

    #[test]
    fn test_key_roundtrip() {
        let key = AttributeKey {
            cnid: 22,
            start_block: 0,
            name: string_to_units("com.apple.FinderInfo"),
        };
        let encoded = encode_attribute_key(&key);
        let (back, payload) = parse_attribute_key(&encoded).unwrap();
        assert_eq!(back, key);
        assert_eq!(payload, encoded.len());
    }

    #[test]
    fn test_ordering_cnid_then_name_then_block() {
        let a = AttributeKey { cnid: 5, start_block: 0, name: string_to_units("zz") };
        let b = AttributeKey { cnid: 6, start_block: 0, name: string_to_units("aa") };
        assert_eq!(a.compare(&b), Ordering::Less);

        let c = AttributeKey { cnid: 6, start_block: 9, name: string_to_units("aa") };
        assert_eq!(b.compare(&c), Ordering::Less);

        let d = AttributeKey { cnid: 6, start_block: 0, name: string_to_units("ab") };
        assert_eq!(c.compare(&d), Ordering::Less);
    }

    #[test]
    fn test_record_comparator_on_encoded_bytes() {
        let mut first = encode_attribute_key(&AttributeKey {
            cnid: 4,
            start_block: 0,
            name: string_to_units("alpha"),
        });
        first.extend_from_slice(&[0u8; 4]);
        let mut second = encode_attribute_key(&AttributeKey {
            cnid: 4,
            start_block: 0,
            name: string_to_units("beta"),
        });
        second.extend_from_slice(&[0u8; 4]);
        assert_eq!(compare_attribute_records(&first, &second), Ordering::Less);
    }
}
