pub mod lsm;

use crate::error::{Error, Result};

/// The capability set shared by every DB shape in the crate: point lookup,
/// membership test, blind write, blind delete, and ordered range scan.
pub trait Store {
    /// The iterator returned by range_scan().
    type ScanIter<'a>: ScanIterator + 'a
    where
        Self: 'a;

    /// Retrieves the value for a given key. Returns `KeyNotFound` when the
    /// key is absent or shadowed by a tombstone.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Returns true if the store contains the given key.
    fn has(&self, key: &[u8]) -> Result<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(Error::KeyNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Inserts or updates a key-value pair. Overwrites any previous value
    /// for the key; a store is not a multi-map.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Deletes the value for the given key. Returns `KeyNotFound` when the
    /// key is absent.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Iterates over all key-value pairs with `start <= key <= limit` in
    /// ascending key order. `limit = None` scans to the end of the store.
    fn range_scan<'a>(&'a self, start: &[u8], limit: Option<&[u8]>)
        -> Result<Self::ScanIter<'a>>;
}

/// Cursor-style iterator over key-value pairs.
///
/// A freshly constructed iterator is already positioned on its first element
/// (or exhausted when the range is empty), so `key()`/`value()` describe the
/// current pair without a prior `next()`.
pub trait ScanIterator {
    /// Advances to the next pair and reports whether the new position is
    /// valid. Calling `next` on an exhausted iterator stays exhausted.
    fn next(&mut self) -> bool;

    /// The current key, or None when exhausted.
    fn key(&self) -> Option<&[u8]>;

    /// The current value, or None when exhausted.
    fn value(&self) -> Option<&[u8]>;

    /// Any error collected while advancing. Exhaustion is not an error.
    fn error(&self) -> Option<&Error>;
}

/// Drains a scan iterator into owned pairs, surfacing any iteration error.
pub fn collect_pairs<I: ScanIterator>(mut iter: I) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut pairs = Vec::new();
    loop {
        match (iter.key(), iter.value()) {
            (Some(k), Some(v)) => pairs.push((k.to_vec(), v.to_vec())),
            _ => break,
        }
        if !iter.next() {
            break;
        }
    }
    if let Some(e) = iter.error() {
        return Err(e.clone());
    }
    Ok(pairs)
}
