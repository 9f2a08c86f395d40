//! Write-ahead log: the durability substrate for the memtable.
//!
//! Every mutation is appended here before it touches the memtable, so a
//! crash-then-replay reconstructs the exact logical sequence. The log is a
//! bare record stream with positional boundaries; there are no framing
//! delimiters or checksums.
//!
//! # Record format
//!
//! ```text
//! +---------+-----------+-------+-----------+-------+
//! | op: u8  | klen: u32 |  key  | vlen: u32 |  val  |
//! +---------+-----------+-------+-----------+-------+
//! ```
//!
//! All integers are big-endian. `op` is 0 for PUT and 1 for DELETE; the
//! value bytes are omitted entirely when `vlen == 0`, which is how DELETE
//! records are written. The minimum record size is therefore 9 bytes.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Mutation kind carried by a log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOp {
    Put = 0,
    Delete = 1,
}

impl LogOp {
    fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(LogOp::Put),
            1 => Ok(LogOp::Delete),
            other => Err(Error::BadOp(other)),
        }
    }
}

/// One logical mutation as recorded in the log. DELETE records carry an
/// empty value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub op: LogOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Append-only record log with linear replay.
#[derive(Debug)]
pub struct Wal {
    file: File,
    path: PathBuf,
}

impl Wal {
    /// Opens the log at `path`, creating it if absent. The write cursor is
    /// positioned at end-of-file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log file in bytes.
    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |meta| meta.len())
    }

    /// Serializes one record and appends it at the write cursor.
    pub fn append(&mut self, key: &[u8], value: &[u8], op: LogOp) -> Result<()> {
        let mut record = Vec::with_capacity(9 + key.len() + value.len());
        record.write_u8(op as u8)?;
        record.write_u32::<BigEndian>(key.len() as u32)?;
        record.extend_from_slice(key);
        record.write_u32::<BigEndian>(value.len() as u32)?;
        if !value.is_empty() {
            record.extend_from_slice(value);
        }
        self.file.write_all(&record)?;
        Ok(())
    }

    /// Returns an iterator over the log's records in write order, reading
    /// through an independent handle so the write cursor is untouched.
    pub fn replay(&self) -> Result<ReplayIterator> {
        ReplayIterator::new(&self.path)
    }

    /// Truncates the log to zero length and rewinds the write cursor.
    pub fn truncate_and_rewind(&mut self) -> Result<()> {
        self.truncate_to(0)
    }

    /// Truncates the log to `len` bytes and parks the write cursor there.
    /// Used to discard a torn tail record after a crash.
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        self.file.seek(SeekFrom::Start(len))?;
        Ok(())
    }

    /// Forces buffered file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Sequential reader over the log's records.
pub struct ReplayIterator {
    reader: BufReader<File>,
    offset: u64,
}

impl ReplayIterator {
    fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            offset: 0,
        })
    }

    /// Byte offset just past the last successfully parsed record: the
    /// length of the log's clean prefix.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Parses one record. Clean EOF at a record boundary yields `None`; EOF
    /// anywhere inside a record is a `ShortRecord`.
    fn read_record(reader: &mut impl Read) -> Result<Option<LogRecord>> {
        let op_byte = match reader.read_u8() {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let op = LogOp::from_u8(op_byte)?;

        let key_len = Self::read_len(reader)? as usize;
        let mut key = vec![0u8; key_len];
        Self::read_exact_or_short(reader, &mut key)?;

        let value_len = Self::read_len(reader)? as usize;
        let mut value = vec![0u8; value_len];
        Self::read_exact_or_short(reader, &mut value)?;

        Ok(Some(LogRecord { op, key, value }))
    }

    fn read_len(reader: &mut impl Read) -> Result<u32> {
        match reader.read_u32::<BigEndian>() {
            Ok(len) => Ok(len),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ShortRecord),
            Err(e) => Err(e.into()),
        }
    }

    fn read_exact_or_short(reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
        match reader.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::ShortRecord),
            Err(e) => Err(e.into()),
        }
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match Self::read_record(&mut self.reader) {
            Ok(Some(record)) => {
                self.offset += 9 + record.key.len() as u64 + record.value.len() as u64;
                Some(Ok(record))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
