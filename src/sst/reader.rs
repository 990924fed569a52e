//! Table reading, sized for verification.
//!
//! The full read path (point gets, seeks, block caching) lives with the
//! engine; this reader decodes exactly what the builder's tests and the
//! post-build verification step need: the footer, the metaindex, per-block
//! CRC validation with decompression, the filter segment, the counter
//! block, and a full-table record iterator.

use std::path::Path;

use bytes::Bytes;
use memmap2::Mmap;

use crate::coding;
use crate::counters::{PerfCounter, SstCounterSnapshot};
use crate::internal_key::InternalKey;
use crate::options::Options;
use crate::sst::block::{Block, BlockIter};
use crate::sst::filter::FilterBlockReader;
use crate::sst::{
    unmask_crc, BlockHandle, Compression, Footer, TableError, BLOCK_TRAILER_SIZE,
    COUNTER_BLOCK_NAME, FOOTER_SIZE,
};

pub struct TableReader {
    mmap: Mmap,
    index: Block,
    filter: Option<FilterBlockReader>,
    counters: Option<SstCounterSnapshot>,
}

impl TableReader {
    pub fn open(path: impl AsRef<Path>, options: &Options) -> Result<Self, TableError> {
        let file = std::fs::File::open(path.as_ref())?;
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < FOOTER_SIZE {
            return Err(TableError::Corruption("file too small"));
        }
        let footer = Footer::decode_from(&mmap[mmap.len() - FOOTER_SIZE..])?;

        let index = Block::new(read_block_contents(&mmap, footer.index)?)?;
        let metaindex = Block::new(read_block_contents(&mmap, footer.metaindex)?)?;

        let mut filter = None;
        let mut counters = None;
        for entry in metaindex.iter() {
            let (name, handle_bytes) = entry?;
            let (handle, _) = BlockHandle::decode_from(&handle_bytes)?;
            if name.as_ref() == COUNTER_BLOCK_NAME.as_bytes() {
                let contents = read_block_contents(&mmap, handle)?;
                counters = Some(SstCounterSnapshot::decode_from(&contents)?);
            } else if let Some(policy) = &options.filter_policy {
                let expected = format!("filter.{}", policy.name());
                if name.as_ref() == expected.as_bytes() {
                    let contents = read_block_contents(&mmap, handle)?;
                    filter = Some(FilterBlockReader::new(policy.clone(), contents)?);
                }
            }
        }

        crate::counters::perf().inc(PerfCounter::TableOpened);
        Ok(Self {
            mmap,
            index,
            filter,
            counters,
        })
    }

    /// The decoded per-table counter block, when the table carries one.
    pub fn counters(&self) -> Option<&SstCounterSnapshot> {
        self.counters.as_ref()
    }

    /// Index entries in file order: `(shortened_key, handle)`.
    pub fn index_entries(&self) -> Result<Vec<(Bytes, BlockHandle)>, TableError> {
        let mut entries = Vec::new();
        for entry in self.index.iter() {
            let (key, handle_bytes) = entry?;
            let (handle, _) = BlockHandle::decode_from(&handle_bytes)?;
            entries.push((key, handle));
        }
        Ok(entries)
    }

    /// Probe the filter for the data block at `block_offset`. Tables
    /// without a filter match everything.
    pub fn filter_matches(&self, block_offset: u64, user_key: &[u8]) -> bool {
        match &self.filter {
            Some(filter) => {
                let matches = filter.key_may_match(block_offset, user_key);
                if !matches {
                    crate::counters::perf().inc(PerfCounter::BlockFiltered);
                }
                matches
            }
            None => true,
        }
    }

    /// Verify and decode one data block.
    pub fn read_block(&self, handle: BlockHandle) -> Result<Block, TableError> {
        crate::counters::perf().inc(PerfCounter::BlockRead);
        Block::new(read_block_contents(&self.mmap, handle)?)
    }

    /// Iterate every record in the table, in storage order.
    pub fn iter(&self) -> TableIter<'_> {
        TableIter {
            reader: self,
            index_iter: self.index.iter(),
            entries: Vec::new(),
            entry_pos: 0,
            failed: false,
        }
    }

    /// Walk the whole table, verifying every block. This is the post-build
    /// verification used by the table cache.
    pub fn verify(&self) -> Result<u64, TableError> {
        let mut records = 0u64;
        for entry in self.iter() {
            entry?;
            records += 1;
        }
        Ok(records)
    }
}

/// Slice one block out of the file, check its masked CRC over
/// `payload || type`, and undo compression.
fn read_block_contents(mmap: &Mmap, handle: BlockHandle) -> Result<Vec<u8>, TableError> {
    let start = handle.offset as usize;
    let payload_end = start + handle.size as usize;
    let end = payload_end + BLOCK_TRAILER_SIZE;
    if end > mmap.len() {
        return Err(TableError::Corruption("block handle out of bounds"));
    }

    let payload = &mmap[start..payload_end];
    let type_byte = mmap[payload_end];
    let stored_crc = unmask_crc(coding::decode_fixed32(&mmap[payload_end + 1..end]));
    let actual_crc = crc32c::crc32c_append(crc32c::crc32c(payload), &[type_byte]);
    if stored_crc != actual_crc {
        return Err(TableError::Corruption("block checksum mismatch"));
    }

    match Compression::from_u8(type_byte)? {
        Compression::None => Ok(payload.to_vec()),
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(payload)
            .map_err(|_| TableError::Corruption("snappy decompression failed")),
    }
}

/// Streams `(InternalKey, value)` records across all data blocks.
pub struct TableIter<'a> {
    reader: &'a TableReader,
    index_iter: BlockIter<'a>,
    entries: Vec<(InternalKey, Bytes)>,
    entry_pos: usize,
    failed: bool,
}

impl TableIter<'_> {
    fn next_record(&mut self) -> Result<Option<(InternalKey, Bytes)>, TableError> {
        loop {
            if self.entry_pos < self.entries.len() {
                let record = self.entries[self.entry_pos].clone();
                self.entry_pos += 1;
                return Ok(Some(record));
            }

            match self.index_iter.next() {
                Some(entry) => {
                    let (_, handle_bytes) = entry?;
                    let (handle, _) = BlockHandle::decode_from(&handle_bytes)?;
                    let block = self.reader.read_block(handle)?;
                    self.entries.clear();
                    for entry in block.iter() {
                        let (key, value) = entry?;
                        let ikey = InternalKey::decode(&key)
                            .map_err(|_| TableError::Corruption("bad internal key"))?;
                        self.entries.push((ikey, value));
                    }
                    self.entry_pos = 0;
                }
                None => return Ok(None),
            }
        }
    }
}

impl Iterator for TableIter<'_> {
    type Item = Result<(InternalKey, Bytes), TableError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
