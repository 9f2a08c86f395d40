//! Immutable on-disk sorted tables.
//!
//! An SSTable is written once, by a memtable flush or a compaction, and then
//! only ever read. The file layout, big-endian throughout:
//!
//! ```text
//! +--------------------+
//! | dir_offset: u64    |  bytes [0..8)
//! +--------------------+
//! | DATA records       |  klen: u32 | key | vlen: u32 | val
//! | (key-ascending)    |  val omitted when vlen == 0 (tombstone)
//! +--------------------+
//! | INDEX entries      |  klen: u32 | key | offset: u64
//! | (key-ascending)    |  bytes [dir_offset..EOF)
//! +--------------------+
//! ```
//!
//! The index is sparse: the first record is always indexed, and after that a
//! record is indexed only once the accumulated key+value bytes since the
//! last indexed record would exceed the configured distance. Lookups land on
//! the nearest indexed record and scan forward a bounded number of bytes.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::store::ScanIterator;

use super::index::Index;

/// Size of the `dir_offset` header.
const HEADER_SIZE: u64 = 8;

/// A table under construction. Records arrive in ascending key order and
/// accumulate in memory; `finalize` writes the file and reopens it for
/// reads.
pub struct WritableTable {
    file: File,
    path: PathBuf,
    data: Vec<u8>,
    index: Index,
    index_distance: usize,
    since_last_index: usize,
}

impl WritableTable {
    /// Creates the table file at `path`.
    pub fn create(path: impl Into<PathBuf>, index_distance: usize) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            file,
            path,
            data: Vec::new(),
            index: Index::new(),
            index_distance,
            since_last_index: 0,
        })
    }

    /// Appends one record. A tombstone is an empty `value`. Keys must arrive
    /// in ascending order; the flush and compaction iterators guarantee it.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let kv_size = key.len() + value.len();
        let offset = HEADER_SIZE + self.data.len() as u64;

        if self.data.is_empty() || self.since_last_index + kv_size > self.index_distance {
            self.index.push(key.to_vec(), offset);
            self.since_last_index = 0;
        } else {
            self.since_last_index += kv_size;
        }

        self.data.write_u32::<BigEndian>(key.len() as u32)?;
        self.data.extend_from_slice(key);
        self.data.write_u32::<BigEndian>(value.len() as u32)?;
        if !value.is_empty() {
            self.data.extend_from_slice(value);
        }
        Ok(())
    }

    /// Writes header, data and index to disk and reopens the table for
    /// reads.
    pub fn finalize(mut self) -> Result<ReadableTable> {
        let dir_offset = HEADER_SIZE + self.data.len() as u64;

        self.file.write_u64::<BigEndian>(dir_offset)?;
        self.file.write_all(&self.data)?;
        self.file.write_all(&self.index.encode()?)?;
        self.file.flush()?;
        self.file.sync_all()?;

        ReadableTable::open(self.path)
    }
}

/// A finalized table open for reads. Holds one file handle for its
/// lifetime; lookups and scans duplicate the handle for their own cursor.
#[derive(Debug)]
pub struct ReadableTable {
    file: File,
    path: PathBuf,
    index: Index,
    dir_offset: u64,
}

impl ReadableTable {
    /// Opens a table file and loads its sparse index into memory. A file
    /// truncated inside the index still opens; the partial tail entry is
    /// dropped.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        let dir_offset = file.read_u64::<BigEndian>()?;
        if dir_offset < HEADER_SIZE || dir_offset > file_size {
            return Err(Error::Io(format!(
                "sstable {:?}: directory offset {} outside file of {} bytes",
                path, dir_offset, file_size
            )));
        }

        let mut index_data = Vec::with_capacity((file_size - dir_offset) as usize);
        file.seek(SeekFrom::Start(dir_offset))?;
        file.read_to_end(&mut index_data)?;
        let index = Index::parse(&index_data);

        Ok(Self {
            file,
            path,
            index,
            dir_offset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Smallest indexed key; the table's starting key.
    pub fn first_key(&self) -> Option<&[u8]> {
        self.index.first_key()
    }

    /// Point lookup. Returns the stored value as-is: an empty value is a
    /// tombstone and the caller decides what that means.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let start = match self.index.find(key) {
            Some(offset) => offset,
            None => return Ok(None),
        };

        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(start))?;
        let mut offset = start;

        while offset < self.dir_offset {
            let record = match read_record(&mut reader)? {
                Some(record) => record,
                None => break,
            };
            offset += record.encoded_len();

            if record.key == key {
                return Ok(Some(record.value));
            }
            if record.key.as_slice() > key {
                break;
            }
        }
        Ok(None)
    }

    /// Bounded scan over `start <= key <= limit`. `start = None` begins at
    /// the first record; `limit = None` runs to the end of the data
    /// section.
    pub fn scan(&self, start: Option<&[u8]>, limit: Option<&[u8]>) -> Result<TableScan> {
        if let (Some(start), Some(limit)) = (start, limit) {
            if limit < start {
                return Err(Error::InvalidRange);
            }
        }

        let offset = match start {
            Some(start) => self.index.seek(start),
            None => self.index.first_offset(),
        };

        let reader = self.file.try_clone()?;
        let mut scan = TableScan {
            reader,
            offset: offset.unwrap_or(self.dir_offset),
            dir_offset: self.dir_offset,
            limit: limit.map(|l| l.to_vec()),
            current: None,
            err: None,
        };
        scan.advance();
        Ok(scan)
    }
}

struct RawRecord {
    key: Vec<u8>,
    value: Vec<u8>,
}

impl RawRecord {
    fn encoded_len(&self) -> u64 {
        let value_len = if self.value.is_empty() {
            0
        } else {
            self.value.len() as u64
        };
        4 + self.key.len() as u64 + 4 + value_len
    }
}

/// Parses one data record at the reader's cursor. EOF at the first byte
/// reports None; the data section is bounded by `dir_offset` so EOF inside a
/// record means the file is damaged.
fn read_record(reader: &mut File) -> Result<Option<RawRecord>> {
    let key_len = match reader.read_u32::<BigEndian>() {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut key = vec![0u8; key_len];
    reader.read_exact(&mut key)?;

    let value_len = reader.read_u32::<BigEndian>()? as usize;
    let mut value = vec![0u8; value_len];
    if value_len > 0 {
        reader.read_exact(&mut value)?;
    }

    Ok(Some(RawRecord { key, value }))
}

/// Cursor over a table's records in key order. Re-seeks before every read
/// so interleaved lookups on the shared handle cannot derail it.
pub struct TableScan {
    reader: File,
    offset: u64,
    dir_offset: u64,
    limit: Option<Vec<u8>>,
    current: Option<(Vec<u8>, Vec<u8>)>,
    err: Option<Error>,
}

impl TableScan {
    fn advance(&mut self) {
        self.current = None;
        if self.err.is_some() || self.offset >= self.dir_offset {
            return;
        }

        if let Err(e) = self.reader.seek(SeekFrom::Start(self.offset)) {
            self.err = Some(e.into());
            return;
        }
        let record = match read_record(&mut self.reader) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                self.err = Some(e);
                return;
            }
        };
        self.offset += record.encoded_len();

        if let Some(limit) = &self.limit {
            if record.key.as_slice() > limit.as_slice() {
                return;
            }
        }
        self.current = Some((record.key, record.value));
    }
}

impl ScanIterator for TableScan {
    fn next(&mut self) -> bool {
        if self.current.is_some() {
            self.advance();
        }
        self.current.is_some()
    }

    fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(k, _)| k.as_slice())
    }

    fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|(_, v)| v.as_slice())
    }

    fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_INDEX_DISTANCE;
    use crate::store::collect_pairs;
    use crate::tmpfs::NamedTempFile;

    fn build_table(entries: &[(&[u8], &[u8])]) -> (NamedTempFile, ReadableTable) {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let mut table = WritableTable::create(temp_file.path(), DEFAULT_INDEX_DISTANCE)
            .expect("Failed to create writable table");
        for (key, value) in entries {
            table.add(key, value).expect("Failed to add record");
        }
        let readable = table.finalize().expect("Failed to finalize table");
        (temp_file, readable)
    }

    #[test]
    fn test_write_and_get() {
        let (_guard, table) = build_table(&[
            (b"apple", b"fruit"),
            (b"application", b"software"),
            (b"banana", b"fruit"),
            (b"band", b"music"),
            (b"bandana", b"clothing"),
        ]);

        for (key, value) in [
            (b"apple".as_slice(), b"fruit".as_slice()),
            (b"application".as_slice(), b"software".as_slice()),
            (b"banana".as_slice(), b"fruit".as_slice()),
            (b"band".as_slice(), b"music".as_slice()),
            (b"bandana".as_slice(), b"clothing".as_slice()),
        ] {
            let found = table
                .get(key)
                .expect("Error during read")
                .expect("Key not found");
            assert_eq!(found, value, "Value mismatch for key {:?}", key);
        }
    }

    #[test]
    fn test_get_nonexistent_key() {
        let (_guard, table) = build_table(&[(b"apple", b"fruit"), (b"banana", b"fruit")]);

        assert_eq!(table.get(b"cherry").expect("Error during read"), None);
        assert_eq!(table.get(b"aaa").expect("Error during read"), None);
        assert_eq!(table.get(b"applf").expect("Error during read"), None);
    }

    #[test]
    fn test_get_scans_past_unindexed_records() {
        // With a large index distance only the first record is indexed, so
        // every other lookup must walk forward from it.
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let mut table =
            WritableTable::create(temp_file.path(), 1 << 20).expect("Failed to create table");
        for i in 0..50 {
            let key = format!("key_{:03}", i);
            let value = format!("value_{:03}", i);
            table.add(key.as_bytes(), value.as_bytes()).expect("Failed to add");
        }
        let table = table.finalize().expect("Failed to finalize table");

        assert_eq!(
            table
                .get(b"key_042")
                .expect("Error during read")
                .expect("Key not found"),
            b"value_042"
        );
        assert_eq!(table.get(b"key_0425").expect("Error during read"), None);
    }

    #[test]
    fn test_tombstone_returned_as_empty_value() {
        let (_guard, table) = build_table(&[(b"alive", b"yes"), (b"dead", b"")]);

        let value = table
            .get(b"dead")
            .expect("Error during read")
            .expect("Tombstone record must be found");
        assert!(value.is_empty());
    }

    #[test]
    fn test_header_and_layout() {
        let (guard, _table) = build_table(&[(b"k", b"v")]);

        let bytes = std::fs::read(guard.path()).expect("Failed to read table file");
        // dir_offset = 8 header + one 10-byte record.
        assert_eq!(&bytes[0..8], &18u64.to_be_bytes());
        // Record: klen | key | vlen | val.
        assert_eq!(&bytes[8..18], &[0, 0, 0, 1, b'k', 0, 0, 0, 1, b'v']);
        // Index: one entry pointing at the first record.
        assert_eq!(&bytes[18..22], &[0, 0, 0, 1]);
        assert_eq!(bytes[22], b'k');
        assert_eq!(&bytes[23..31], &8u64.to_be_bytes());
        assert_eq!(bytes.len(), 31);
    }

    #[test]
    fn test_sparse_index_first_record_always_indexed() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..20)
            .map(|i| {
                (
                    format!("key_{:02}", i).into_bytes(),
                    format!("value_{:02}", i).into_bytes(),
                )
            })
            .collect();

        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let mut table = WritableTable::create(temp_file.path(), DEFAULT_INDEX_DISTANCE)
            .expect("Failed to create table");
        for (key, value) in &entries {
            table.add(key, value).expect("Failed to add");
        }
        let table = table.finalize().expect("Failed to finalize table");

        // The first index entry points at the first record, right after the
        // header.
        assert_eq!(table.first_key(), Some(b"key_00".as_slice()));
        assert_eq!(table.index.first_offset(), Some(8));
        // Sparse: more than one entry, fewer than one per record.
        assert!(table.index.len() > 1);
        assert!(table.index.len() < entries.len());
    }

    #[test]
    fn test_full_scan() {
        let (_guard, table) = build_table(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);

        let scan = table.scan(None, None).expect("Failed to create scan");
        let pairs = collect_pairs(scan).expect("Scan failed");
        assert_eq!(
            pairs,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec())
            ]
        );
    }

    #[test]
    fn test_full_scan_includes_tombstones() {
        let (_guard, table) = build_table(&[(b"a", b"1"), (b"b", b""), (b"c", b"3")]);

        let scan = table.scan(None, None).expect("Failed to create scan");
        let pairs = collect_pairs(scan).expect("Scan failed");
        assert_eq!(pairs[1], (b"b".to_vec(), Vec::new()));
    }

    #[test]
    fn test_range_scan() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
            .map(|i| {
                (
                    format!("key_{:03}", i).into_bytes(),
                    format!("value_{:03}", i).into_bytes(),
                )
            })
            .collect();

        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let mut table = WritableTable::create(temp_file.path(), DEFAULT_INDEX_DISTANCE)
            .expect("Failed to create table");
        for (key, value) in &entries {
            table.add(key, value).expect("Failed to add");
        }
        let table = table.finalize().expect("Failed to finalize table");

        let scan = table
            .scan(Some(b"key_010"), Some(b"key_020"))
            .expect("Failed to create scan");
        let pairs = collect_pairs(scan).expect("Scan failed");

        assert_eq!(pairs.len(), 11);
        assert_eq!(pairs[0].0, b"key_010");
        assert_eq!(pairs[10].0, b"key_020");
        for window in pairs.windows(2) {
            assert!(window[0].0 < window[1].0, "keys must be strictly increasing");
        }
    }

    #[test]
    fn test_range_scan_empty_when_start_past_end() {
        let (_guard, table) = build_table(&[(b"a", b"1"), (b"b", b"2")]);

        let scan = table.scan(Some(b"x"), None).expect("Failed to create scan");
        assert!(scan.key().is_none());
    }

    #[test]
    fn test_range_scan_empty_when_first_key_past_limit() {
        let (_guard, table) = build_table(&[(b"m", b"1")]);

        let scan = table
            .scan(Some(b"a"), Some(b"c"))
            .expect("Failed to create scan");
        assert!(scan.key().is_none());
    }

    #[test]
    fn test_range_scan_invalid_range() {
        let (_guard, table) = build_table(&[(b"a", b"1")]);
        assert!(matches!(
            table.scan(Some(b"z"), Some(b"a")),
            Err(Error::InvalidRange)
        ));
    }

    #[test]
    fn test_scan_initial_position() {
        let (_guard, table) = build_table(&[(b"a", b"1"), (b"b", b"2")]);

        let scan = table.scan(None, None).expect("Failed to create scan");
        assert_eq!(scan.key(), Some(b"a".as_slice()));
        assert_eq!(scan.value(), Some(b"1".as_slice()));
        assert!(scan.error().is_none());
    }

    #[test]
    fn test_exhausted_scan_stays_exhausted() {
        let (_guard, table) = build_table(&[(b"a", b"1")]);

        let mut scan = table.scan(None, None).expect("Failed to create scan");
        assert_eq!(scan.key(), Some(b"a".as_slice()));
        assert!(!scan.next());
        assert!(!scan.next());
        assert!(scan.key().is_none());
        assert!(scan.error().is_none());
    }

    #[test]
    fn test_open_tolerates_truncated_index() {
        // Values wider than the index distance, so every record gets its
        // own index entry.
        let (guard, table) = build_table(&[
            (b"a", b"0123456789abcdef"),
            (b"b", b"0123456789abcdef"),
            (b"c", b"0123456789abcdef"),
        ]);
        assert_eq!(table.index.len(), 3);
        drop(table);

        // Chop two bytes off the index tail; the file must still open with
        // the surviving entries.
        let len = std::fs::metadata(guard.path()).expect("Failed to stat").len();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(guard.path())
            .expect("Failed to reopen");
        file.set_len(len - 2).expect("Failed to truncate");
        drop(file);

        let table = ReadableTable::open(guard.path()).expect("Truncated index must still open");
        assert_eq!(table.index.len(), 2);
        assert_eq!(
            table.get(b"a").expect("Error during read"),
            Some(b"0123456789abcdef".to_vec())
        );
        // The record whose index entry was lost is still reachable by the
        // forward scan from the previous entry.
        assert_eq!(
            table.get(b"c").expect("Error during read"),
            Some(b"0123456789abcdef".to_vec())
        );
    }

    #[test]
    fn test_open_rejects_bad_dir_offset() {
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        std::fs::write(temp_file.path(), u64::MAX.to_be_bytes()).expect("Failed to write");

        assert!(ReadableTable::open(temp_file.path()).is_err());
    }

    #[test]
    fn test_roundtrip_preserves_order_and_content() {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..256)
            .map(|i| {
                (
                    format!("key_{:04}", i).into_bytes(),
                    vec![i as u8; (i % 13) + 1],
                )
            })
            .collect();

        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let mut table = WritableTable::create(temp_file.path(), DEFAULT_INDEX_DISTANCE)
            .expect("Failed to create table");
        for (key, value) in &entries {
            table.add(key, value).expect("Failed to add");
        }
        let table = table.finalize().expect("Failed to finalize table");

        let scan = table.scan(None, None).expect("Failed to create scan");
        let pairs = collect_pairs(scan).expect("Scan failed");
        assert_eq!(pairs, entries);
    }
}
