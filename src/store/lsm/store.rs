//! LSM store orchestration.
//!
//! `LsmStore` owns one directory and wires the tiers together:
//!
//! ```text
//! <dir>/log              write-ahead log
//! <dir>/sst<N>           level-0 tables, one per memtable flush
//! <dir>/compact/sst<N>   level-1 tables, disjoint ranges, size-capped
//! <dir>/compacttemp/     staging for an in-progress compaction
//! ```
//!
//! A write appends to the WAL and then lands in the memtable. When the
//! memtable would outgrow its limit the store flushes it to a fresh level-0
//! table and truncates the WAL; when level-0 itself has grown past its limit
//! the flush escalates to a compaction that merges every tier into a new set
//! of level-1 tables, swapped in by a directory rename.
//!
//! The engine is single-threaded: one logical owner, all operations running
//! to completion on the caller's thread.

use std::fs;
use std::path::{Path, PathBuf};

use super::iterator::{MergeIterator, Source};
use super::memtable::Memtable;
use super::skiplist::Marker;
use super::sstable::{ReadableTable, WritableTable};
use super::wal::{LogOp, Wal};
use crate::config::LsmConfig;
use crate::error::{Error, Result};
use crate::store::{ScanIterator, Store};

const WAL_FILE: &str = "log";
const SST_PREFIX: &str = "sst";
const COMPACT_DIR: &str = "compact";
const COMPACT_TEMP_DIR: &str = "compacttemp";

/// Single-process, ordered key-value store over an LSM tree.
pub struct LsmStore {
    config: LsmConfig,
    wal: Wal,
    memtable: Memtable,
    /// Level-0 tables, oldest first. Reads walk them newest-to-oldest.
    level0: Vec<ReadableTable>,
    /// Level-1 tables, ascending by starting key, ranges disjoint.
    level1: Vec<ReadableTable>,
}

impl LsmStore {
    /// Opens the store at `dir` with default configuration.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(LsmConfig::new(dir))
    }

    /// Opens the store with the given configuration. Replay of the WAL is
    /// not automatic; call [`replay`](Self::replay) to reapply logged
    /// mutations.
    pub fn open_with_config(config: LsmConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        if config.create_new {
            wipe_dir(&config.dir)?;
            tracing::info!(dir = %config.dir.display(), "wiped existing store directory");
        }

        let wal = Wal::open(config.dir.join(WAL_FILE))?;
        let level0 = load_level0(&config.dir)?;
        let level1 = load_level1(&config.dir.join(COMPACT_DIR))?;

        tracing::info!(
            dir = %config.dir.display(),
            level0 = level0.len(),
            level1 = level1.len(),
            "opened store"
        );

        Ok(Self {
            config,
            wal,
            memtable: Memtable::new(),
            level0,
            level1,
        })
    }

    /// Reapplies every record in the WAL as a fresh mutation, in write
    /// order. A torn record at the tail of the log marks the end of the
    /// usable log and is discarded; everything parsed before it is
    /// authoritative. Other replay errors surface with partial progress
    /// already applied.
    pub fn replay(&mut self) -> Result<()> {
        // Replayed mutations re-append to the log, so the record set must be
        // drained in full before any are applied.
        let mut records = Vec::new();
        let mut replay_iter = self.wal.replay()?;
        let mut clean_prefix = None;
        for record in replay_iter.by_ref() {
            match record {
                Ok(record) => records.push(record),
                Err(Error::ShortRecord) => {
                    clean_prefix = Some(replay_iter.offset());
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(clean_prefix) = clean_prefix {
            // A torn record marks the end of the usable log; cut it off so
            // later appends land on a parseable boundary.
            self.wal.truncate_to(clean_prefix)?;
            tracing::warn!(
                recovered = records.len(),
                clean_prefix,
                "torn record at log tail, discarded"
            );
        }

        let count = records.len();
        for record in records {
            match record.op {
                LogOp::Put => self.put(&record.key, &record.value)?,
                LogOp::Delete => match self.delete(&record.key) {
                    // A replayed delete of an absent key is a no-op: the log
                    // records intent, not outcome.
                    Ok(()) | Err(Error::KeyNotFound) => {}
                    Err(e) => return Err(e),
                },
            }
        }

        tracing::info!(records = count, "replayed write-ahead log");
        Ok(())
    }

    /// Syncs the WAL and releases the store's file handles.
    pub fn close(self) -> Result<()> {
        self.wal.sync()?;
        Ok(())
    }

    /// Writes the memtable out as a fresh level-0 table. A no-op when the
    /// memtable is empty.
    fn flush_memtable(&mut self) -> Result<()> {
        if self.memtable.is_empty() {
            return Ok(());
        }

        let path = self.next_sstable_path()?;
        let mut table = WritableTable::create(&path, self.config.index_distance)?;

        let mut scan = self.memtable.full_scan();
        loop {
            match (scan.key(), scan.value()) {
                (Some(key), Some(value)) => table.add(key, value)?,
                _ => break,
            }
            if !scan.next() {
                break;
            }
        }

        let table = table.finalize()?;
        tracing::info!(
            path = %path.display(),
            entries = self.memtable.len(),
            bytes = self.memtable.size(),
            "flushed memtable to level-0"
        );
        self.level0.push(table);
        Ok(())
    }

    /// Truncates the WAL and installs a fresh memtable. Runs after a flush
    /// or compaction has made the buffered mutations durable elsewhere.
    fn reset_memtable(&mut self) -> Result<()> {
        self.wal.truncate_and_rewind()?;
        self.memtable = Memtable::new();
        Ok(())
    }

    /// Merges the memtable and every table of both levels into a new set of
    /// size-capped level-1 tables, staged in a sibling directory and made
    /// live by a rename. Level-0 files are deleted afterwards.
    fn compact(&mut self) -> Result<()> {
        let temp_dir = self.config.dir.join(COMPACT_TEMP_DIR);
        if temp_dir.exists() {
            fs::remove_dir_all(&temp_dir)?;
        }
        fs::create_dir_all(&temp_dir)?;

        let inputs = 1 + self.level0.len() + self.level1.len();
        let mut outputs = 0usize;
        {
            let mut sources: Vec<Source> = Vec::with_capacity(inputs);
            sources.push(Box::new(self.memtable.full_scan()));
            for table in self.level0.iter().rev() {
                sources.push(Box::new(table.scan(None, None)?));
            }
            for table in &self.level1 {
                sources.push(Box::new(table.scan(None, None)?));
            }
            let mut merge = MergeIterator::new(sources, false);

            let mut writer: Option<WritableTable> = None;
            let mut payload = 0usize;
            loop {
                let (key, value) = match (merge.key(), merge.value()) {
                    (Some(key), Some(value)) => (key, value),
                    _ => break,
                };

                // Every tier participates in this merge, so a winning
                // tombstone has already shadowed everything it ever will.
                if value.is_empty() {
                    if !merge.next() {
                        break;
                    }
                    continue;
                }

                let record = key.len() + value.len();
                let rotate = match &writer {
                    Some(_) => payload + record > self.config.level1_target_bytes,
                    None => true,
                };
                if rotate {
                    if let Some(finished) = writer.take() {
                        finished.finalize()?;
                    }
                    outputs += 1;
                    let path = temp_dir.join(format!("{}{}", SST_PREFIX, outputs));
                    writer = Some(WritableTable::create(path, self.config.index_distance)?);
                    payload = 0;
                }
                if let Some(writer) = writer.as_mut() {
                    writer.add(key, value)?;
                }
                payload += record;

                if !merge.next() {
                    break;
                }
            }
            if let Some(e) = merge.error() {
                return Err(e.clone());
            }
            if let Some(finished) = writer.take() {
                finished.finalize()?;
            }
        }

        // The swap is atomic at the directory level: no reader observes a
        // partially written output set.
        let live_dir = self.config.dir.join(COMPACT_DIR);
        if live_dir.exists() {
            fs::remove_dir_all(&live_dir)?;
        }
        fs::rename(&temp_dir, &live_dir)?;

        for table in self.level0.drain(..) {
            let path = table.path().to_path_buf();
            drop(table);
            fs::remove_file(&path)?;
        }
        self.level1 = load_level1(&live_dir)?;

        tracing::info!(
            inputs,
            outputs,
            level1 = self.level1.len(),
            "compaction complete"
        );
        Ok(())
    }

    /// Picks the next unused level-0 filename: `sst<N>` where N is one more
    /// than the number of directory entries already named `sst*`.
    fn next_sstable_path(&self) -> Result<PathBuf> {
        let mut count = 0;
        for entry in fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(SST_PREFIX) {
                count += 1;
            }
        }
        Ok(self.config.dir.join(format!("{}{}", SST_PREFIX, count + 1)))
    }
}

impl Store for LsmStore {
    type ScanIter<'a>
        = MergeIterator<'a>
    where
        Self: 'a;

    /// The newest observation wins: memtable, then level-0 newest-to-oldest,
    /// then level-1. A tombstone in any tier ends the search.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        match self.memtable.entry(key) {
            Some((value, Marker::Live)) => return Ok(value.to_vec()),
            Some((_, Marker::Tombstone)) => return Err(Error::KeyNotFound),
            None => {}
        }

        for table in self.level0.iter().rev().chain(self.level1.iter()) {
            match table.get(key)? {
                Some(value) if value.is_empty() => return Err(Error::KeyNotFound),
                Some(value) => return Ok(value),
                None => {}
            }
        }

        Err(Error::KeyNotFound)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if value.is_empty() {
            return Err(Error::EmptyValue);
        }
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }

        let delta = key.len() + value.len();
        if self.memtable.size() + delta > self.config.memtable_limit {
            if self.level0.len() > self.config.level0_limit {
                self.compact()?;
            } else {
                self.flush_memtable()?;
            }
            self.reset_memtable()?;
        }

        // WAL before memtable: the durability contract.
        self.wal.append(key, value, LogOp::Put)?;
        self.memtable.put(key, value)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        // The intent is logged before the existence check; the log is a
        // superset of durable state and replay treats spurious deletes as
        // no-ops.
        self.wal.append(key, &[], LogOp::Delete)?;

        match self.get(key) {
            Ok(_) => self.memtable.insert_tombstone(key),
            Err(e) => Err(e),
        }
    }

    /// Merge across every tier with tombstone suppression: a deletion in a
    /// newer tier hides the key even where older tables still carry values.
    fn range_scan<'a>(&'a self, start: &[u8], limit: Option<&[u8]>)
        -> Result<MergeIterator<'a>> {
        if let Some(limit) = limit {
            if limit < start {
                return Err(Error::InvalidRange);
            }
        }

        let mut sources: Vec<Source<'a>> =
            Vec::with_capacity(1 + self.level0.len() + self.level1.len());
        sources.push(Box::new(self.memtable.scan(Some(start), limit, true)?));
        for table in self.level0.iter().rev() {
            sources.push(Box::new(table.scan(Some(start), limit)?));
        }
        for table in &self.level1 {
            sources.push(Box::new(table.scan(Some(start), limit)?));
        }

        Ok(MergeIterator::new(sources, true))
    }
}

/// Removes everything inside `dir`, including the compaction subdirectory.
fn wipe_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Opens the level-0 tables in `dir`, ordered oldest first by their
/// filename number.
fn load_level0(dir: &Path) -> Result<Vec<ReadableTable>> {
    let mut numbered = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(n) = name
            .strip_prefix(SST_PREFIX)
            .and_then(|suffix| suffix.parse::<u64>().ok())
        {
            numbered.push((n, entry.path()));
        }
    }
    numbered.sort_by_key(|(n, _)| *n);

    numbered
        .into_iter()
        .map(|(_, path)| ReadableTable::open(path))
        .collect()
}

/// Opens the level-1 tables under the compaction directory, ordered by
/// starting key. Absent directory means an empty level.
fn load_level1(compact_dir: &Path) -> Result<Vec<ReadableTable>> {
    if !compact_dir.exists() {
        return Ok(Vec::new());
    }

    let mut tables = Vec::new();
    for entry in fs::read_dir(compact_dir)? {
        let entry = entry?;
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(SST_PREFIX)
        {
            tables.push(ReadableTable::open(entry.path())?);
        }
    }
    tables.sort_by(|a, b| a.first_key().cmp(&b.first_key()));
    Ok(tables)
}
