//! Sparse key index for SSTable record lookup.
//!
//! The index holds `(key, file offset)` pairs for a subset of a table's
//! records, in ascending key order. Point lookups binary-search it for the
//! greatest indexed key at or below the target and scan forward from there;
//! range scans use the smallest indexed key at or above the start bound.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Result;

/// The sparse index for one SSTable: `(key, record offset)` pairs sorted by
/// key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    entries: Vec<(Vec<u8>, u64)>,
}

impl Index {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends an entry. Callers push keys in ascending order.
    pub fn push(&mut self, key: Vec<u8>, offset: u64) {
        self.entries.push((key, offset));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.entries.first().map(|(key, _)| key.as_slice())
    }

    pub fn first_offset(&self) -> Option<u64> {
        self.entries.first().map(|(_, offset)| *offset)
    }

    /// Greatest entry whose key is <= `key`, found by binary search. This is
    /// the record a point lookup starts scanning from; None means the key
    /// sorts before every indexed record.
    pub fn find(&self, key: &[u8]) -> Option<u64> {
        match self
            .entries
            .binary_search_by(|(entry_key, _)| entry_key.as_slice().cmp(key))
        {
            Ok(idx) => Some(self.entries[idx].1),
            Err(0) => None,
            Err(idx) => Some(self.entries[idx - 1].1),
        }
    }

    /// Smallest entry whose key is >= `key`; the starting record for a
    /// bounded scan. None means every indexed key sorts before `key`.
    pub fn seek(&self, key: &[u8]) -> Option<u64> {
        match self
            .entries
            .binary_search_by(|(entry_key, _)| entry_key.as_slice().cmp(key))
        {
            Ok(idx) => Some(self.entries[idx].1),
            Err(idx) => self.entries.get(idx).map(|(_, offset)| *offset),
        }
    }

    /// Serializes the index as repeated `klen: u32 | key | offset: u64`,
    /// big-endian.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        for (key, offset) in &self.entries {
            buffer.write_u32::<BigEndian>(key.len() as u32)?;
            buffer.extend_from_slice(key);
            buffer.write_u64::<BigEndian>(*offset)?;
        }
        Ok(buffer)
    }

    /// Parses an encoded index. Trailing bytes that do not form a complete
    /// `klen | key | offset` triple are ignored, so a file truncated
    /// mid-index still opens.
    pub fn parse(buffer: &[u8]) -> Self {
        let mut cursor = Cursor::new(buffer);
        let mut entries = Vec::new();

        loop {
            let key_len = match cursor.read_u32::<BigEndian>() {
                Ok(len) => len as usize,
                Err(_) => break,
            };

            let pos = cursor.position() as usize;
            if pos + key_len > buffer.len() {
                break;
            }
            let key = buffer[pos..pos + key_len].to_vec();
            cursor.set_position((pos + key_len) as u64);

            let offset = match cursor.read_u64::<BigEndian>() {
                Ok(offset) => offset,
                Err(_) => break,
            };

            entries.push((key, offset));
        }

        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_index() -> Index {
        let mut index = Index::new();
        index.push(b"apple".to_vec(), 8);
        index.push(b"banana".to_vec(), 100);
        index.push(b"cherry".to_vec(), 200);
        index
    }

    #[test]
    fn test_find_exact_match() {
        let index = create_test_index();
        assert_eq!(index.find(b"banana"), Some(100));
    }

    #[test]
    fn test_find_between_entries() {
        let index = create_test_index();
        assert_eq!(index.find(b"apricot"), Some(8));
        assert_eq!(index.find(b"blueberry"), Some(100));
    }

    #[test]
    fn test_find_smaller_than_all() {
        let index = create_test_index();
        assert_eq!(index.find(b"ant"), None);
    }

    #[test]
    fn test_find_larger_than_all() {
        let index = create_test_index();
        assert_eq!(index.find(b"date"), Some(200));
    }

    #[test]
    fn test_find_empty_index() {
        let index = Index::new();
        assert_eq!(index.find(b"any"), None);
    }

    #[test]
    fn test_seek() {
        let index = create_test_index();
        assert_eq!(index.seek(b"a"), Some(8));
        assert_eq!(index.seek(b"apple"), Some(8));
        assert_eq!(index.seek(b"apricot"), Some(100));
        assert_eq!(index.seek(b"cherry"), Some(200));
        assert_eq!(index.seek(b"date"), None);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let original = create_test_index();
        let buffer = original.encode().expect("Failed to encode index");
        let parsed = Index::parse(&buffer);
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_empty_serialization_roundtrip() {
        let original = Index::new();
        let buffer = original.encode().expect("Failed to encode index");
        assert_eq!(Index::parse(&buffer), original);
    }

    #[test]
    fn test_parse_ignores_truncated_tail() {
        let index = create_test_index();
        let mut buffer = index.encode().expect("Failed to encode index");
        // A partial fourth entry: klen and half a key, no offset.
        buffer.extend_from_slice(&[0, 0, 0, 4, b'd', b'a']);

        let parsed = Index::parse(&buffer);
        assert_eq!(parsed, index);
    }

    #[test]
    fn test_parse_truncated_inside_offset() {
        let index = create_test_index();
        let mut buffer = index.encode().expect("Failed to encode index");
        buffer.extend_from_slice(&[0, 0, 0, 1, b'd', 0, 0, 0]); // offset cut short

        let parsed = Index::parse(&buffer);
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn test_first_entry_accessors() {
        let index = create_test_index();
        assert_eq!(index.first_key(), Some(b"apple".as_slice()));
        assert_eq!(index.first_offset(), Some(8));

        let empty = Index::new();
        assert_eq!(empty.first_key(), None);
        assert_eq!(empty.first_offset(), None);
    }
}
