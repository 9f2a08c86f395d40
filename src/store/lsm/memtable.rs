//! In-memory write buffer over the skip list.
//!
//! The memtable is the freshest tier of the store: every write lands here
//! after its WAL append, and every read probes here first. Deletions are
//! recorded as tombstone nodes so they shadow older SSTable entries until a
//! compaction drops them.
//!
//! The running `size` is the sum of `key.len() + value.len()` over all
//! current entries, live and tombstone alike; the engine compares it against
//! the configured limit to decide when to flush.

use super::skiplist::{Marker, NodeId, SkipList};
use crate::error::{Error, Result};
use crate::store::ScanIterator;

#[derive(Debug, Default)]
pub struct Memtable {
    list: SkipList,
    size: usize,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            list: SkipList::new(),
            size: 0,
        }
    }

    /// Sum of key and value bytes currently buffered.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Returns the live value for `key`. A tombstoned key reports
    /// `KeyNotFound` just like an absent one.
    pub fn get(&self, key: &[u8]) -> Result<&[u8]> {
        match self.list.search(key) {
            Some(id) if self.list.marker(id) == Marker::Live => Ok(self.list.value(id)),
            _ => Err(Error::KeyNotFound),
        }
    }

    /// Raw probe that distinguishes a tombstoned key from an absent one.
    /// The engine needs the difference to know when to stop searching
    /// older tiers.
    pub(crate) fn entry(&self, key: &[u8]) -> Option<(&[u8], Marker)> {
        self.list
            .search(key)
            .map(|id| (self.list.value(id), self.list.marker(id)))
    }

    /// Inserts or overwrites a live entry.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        match self.list.insert(key, value.to_vec(), Marker::Live) {
            None => self.size += key.len() + value.len(),
            Some((old_value, _)) => {
                self.size = self.size - old_value.len() + value.len();
            }
        }
        Ok(())
    }

    /// Records a logical deletion. The tombstone's empty value still counts
    /// its key bytes toward `size`.
    pub fn insert_tombstone(&mut self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        match self.list.insert(key, Vec::new(), Marker::Tombstone) {
            None => self.size += key.len(),
            Some((old_value, _)) => self.size -= old_value.len(),
        }
        Ok(())
    }

    /// Live entries with `start <= key <= limit` in ascending order,
    /// tombstones skipped. `limit = None` scans to the end.
    pub fn range_scan(&self, start: &[u8], limit: Option<&[u8]>) -> Result<MemtableScan> {
        self.scan(Some(start), limit, false)
    }

    /// Every entry including tombstones, ascending from the first key with
    /// no upper bound. Used by flush and compaction.
    pub fn full_scan(&self) -> MemtableScan {
        MemtableScan::new(&self.list, None, None, true)
    }

    /// Bounded scan with explicit control over tombstone visibility. The
    /// engine's merge layer needs tombstones to flow through so a memtable
    /// deletion shadows SSTable-resident values.
    pub(crate) fn scan(
        &self,
        start: Option<&[u8]>,
        limit: Option<&[u8]>,
        include_tombstones: bool,
    ) -> Result<MemtableScan> {
        if let (Some(start), Some(limit)) = (start, limit) {
            if limit < start {
                return Err(Error::InvalidRange);
            }
        }
        Ok(MemtableScan::new(&self.list, start, limit, include_tombstones))
    }
}

/// Cursor over a memtable's entries in ascending key order.
pub struct MemtableScan<'a> {
    list: &'a SkipList,
    cur: Option<NodeId>,
    limit: Option<Vec<u8>>,
    include_tombstones: bool,
}

impl<'a> MemtableScan<'a> {
    fn new(
        list: &'a SkipList,
        start: Option<&[u8]>,
        limit: Option<&[u8]>,
        include_tombstones: bool,
    ) -> Self {
        let cur = match start {
            Some(start) => list.search_closest(start),
            None => list.first(),
        };
        let mut scan = Self {
            list,
            cur,
            limit: limit.map(|l| l.to_vec()),
            include_tombstones,
        };
        scan.settle();
        scan
    }

    /// Moves the cursor forward until it rests on a yieldable node: inside
    /// the limit and, unless tombstones are wanted, live.
    fn settle(&mut self) {
        while let Some(id) = self.cur {
            if let Some(limit) = &self.limit {
                if self.list.key(id) > limit.as_slice() {
                    self.cur = None;
                    return;
                }
            }
            if !self.include_tombstones && self.list.marker(id) == Marker::Tombstone {
                self.cur = self.list.next(id);
                continue;
            }
            return;
        }
    }
}

impl ScanIterator for MemtableScan<'_> {
    fn next(&mut self) -> bool {
        if let Some(id) = self.cur {
            self.cur = self.list.next(id);
            self.settle();
        }
        self.cur.is_some()
    }

    fn key(&self) -> Option<&[u8]> {
        self.cur.map(|id| self.list.key(id))
    }

    fn value(&self) -> Option<&[u8]> {
        self.cur.map(|id| self.list.value(id))
    }

    fn error(&self) -> Option<&Error> {
        None
    }
}
