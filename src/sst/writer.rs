//! The serial table writer.
//!
//! Owns everything that must advance in file order: the output file and its
//! running offset, the index block, the filter builder, the per-table
//! counters, and the latched status. The parallel pipeline funnels every
//! block through [`TableWriter::begin_block`] /
//! [`TableWriter::append_index`] strictly FIFO; compression happens
//! elsewhere and out of order.
//!
//! The first error encountered latches; all subsequent operations become
//! no-ops returning the latched status, and the footer is never written for
//! a failed table.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::counters::{PerfCounter, SstCounter, SstCounters};
use crate::options::Options;
use crate::sst::block::BlockBuilder;
use crate::sst::file::{ReservedRegion, TableFile};
use crate::sst::filter::{FilterBlockBuilder, InternalFilterPolicy};
use crate::sst::{
    mask_crc, BlockHandle, Compression, Footer, TableError, BLOCK_TRAILER_SIZE, COUNTER_BLOCK_NAME,
};
use crate::{coding, counters};

/// Apply the per-block compression policy: keep the compressed form only if
/// it saves at least 12.5%, otherwise store raw and count the abort.
/// Returns the replacement payload (None when the raw bytes stand) and the
/// type byte actually used.
pub(crate) fn compress_block(
    raw: &[u8],
    requested: Compression,
    sst_counters: &SstCounters,
) -> (Option<Vec<u8>>, Compression) {
    match requested {
        Compression::None => (None, Compression::None),
        Compression::Snappy => {
            let compressed = snap::raw::Encoder::new().compress_vec(raw);
            match compressed {
                Ok(compressed) if compressed.len() < raw.len() - raw.len() / 8 => {
                    (Some(compressed), Compression::Snappy)
                }
                _ => {
                    sst_counters.inc(SstCounter::CompressAborted);
                    counters::perf().inc(PerfCounter::CompressionAborted);
                    (None, Compression::None)
                }
            }
        }
    }
}

/// CRC32C over `payload || type_byte`, unmasked.
pub(crate) fn block_crc(payload: &[u8], comp_type: Compression) -> u32 {
    let crc = crc32c::crc32c(payload);
    crc32c::crc32c_append(crc, &[comp_type as u8])
}

pub struct TableWriter {
    file: TableFile,
    /// Next free byte; advanced only on the serial write path.
    offset: u64,
    index_block: BlockBuilder,
    filter: Option<FilterBlockBuilder>,
    filter_name: Option<&'static str>,
    counters: Arc<SstCounters>,
    compression: Compression,
    status: Option<TableError>,
    failed: Arc<AtomicBool>,
    closed: bool,
}

impl TableWriter {
    pub fn new(file: TableFile, options: &Options, sst_counters: Arc<SstCounters>) -> Self {
        let (filter, filter_name) = match &options.filter_policy {
            Some(policy) => (
                Some(FilterBlockBuilder::new(Arc::new(InternalFilterPolicy::new(
                    policy.clone(),
                )))),
                Some(policy.name()),
            ),
            None => (None, None),
        };
        Self {
            file,
            offset: 0,
            // Index keys are far apart; prefix compression buys nothing.
            index_block: BlockBuilder::new(1),
            filter,
            filter_name,
            counters: sst_counters,
            compression: options.compression,
            status: None,
            failed: Arc::new(AtomicBool::new(false)),
            closed: false,
        }
    }

    pub fn ok(&self) -> bool {
        self.status.is_none()
    }

    pub fn status(&self) -> Result<(), TableError> {
        match &self.status {
            None => Ok(()),
            Some(err) => Err(err.clone()),
        }
    }

    /// Latch the first error; later errors are dropped.
    pub fn latch(&mut self, err: TableError) {
        if self.status.is_none() {
            self.status = Some(err);
            self.failed.store(true, Ordering::Release);
        }
    }

    /// Cheap failure flag shared with the producer so it can stop early
    /// without taking this writer's lock.
    pub fn failed_flag(&self) -> Arc<AtomicBool> {
        self.failed.clone()
    }

    pub fn counters(&self) -> &SstCounters {
        &self.counters
    }

    pub fn file_size(&self) -> u64 {
        self.offset
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Reserve file space for one block of `payload_len` bytes plus its
    /// trailer and advance the running offset. The returned handle locates
    /// the block for the index.
    pub fn begin_block(
        &mut self,
        payload_len: usize,
    ) -> Result<(ReservedRegion, BlockHandle), TableError> {
        self.status()?;
        let total = (payload_len + BLOCK_TRAILER_SIZE) as u64;
        let region = match self.file.reserve(total) {
            Ok(region) => region,
            Err(err) => {
                self.latch(err.clone());
                return Err(err);
            }
        };
        debug_assert_eq!(region.offset(), self.offset);
        let handle = BlockHandle {
            offset: self.offset,
            size: payload_len as u64,
        };
        self.offset += total;
        Ok((region, handle))
    }

    /// Flush one block's staged filter keys and anchor the next filter
    /// group at the current (post-block) offset. Called in producer order
    /// from the serial write phase.
    pub fn apply_filter(&mut self, lengths: &[usize], packed_keys: &[u8]) {
        if let Some(filter) = &mut self.filter {
            filter.add_keys(lengths, packed_keys);
            filter.start_block(self.offset);
        }
    }

    pub fn append_index(&mut self, shortened_key: &[u8], handle: &BlockHandle) {
        self.index_block.add(shortened_key, &handle.encode_to_vec());
        self.counters.inc(SstCounter::IndexKeys);
    }

    /// Write a block applying the compression policy. Used for the meta
    /// blocks emitted at finish; data blocks go through the pipeline.
    fn write_block(&mut self, contents: &[u8]) -> Result<BlockHandle, TableError> {
        let (replacement, comp_type) = compress_block(contents, self.compression, &self.counters);
        match replacement {
            Some(compressed) => self.write_raw_block(&compressed, comp_type),
            None => self.write_raw_block(contents, comp_type),
        }
    }

    /// Write `payload` and its 5-byte trailer synchronously at the current
    /// offset.
    pub fn write_raw_block(
        &mut self,
        payload: &[u8],
        comp_type: Compression,
    ) -> Result<BlockHandle, TableError> {
        let (mut region, handle) = self.begin_block(payload.len())?;
        let crc = block_crc(payload, comp_type);
        let result = region.append(payload).and_then(|()| {
            let mut trailer = Vec::with_capacity(BLOCK_TRAILER_SIZE);
            trailer.push(comp_type as u8);
            coding::put_fixed32(&mut trailer, mask_crc(crc));
            region.append(&trailer)
        });
        if let Err(err) = result {
            self.latch(err.clone());
            return Err(err);
        }
        Ok(handle)
    }

    /// Write the filter block, the counter block, the metaindex, the index
    /// block, and the footer; then trim the file. No data may be added
    /// afterwards.
    pub fn finish(&mut self) -> Result<(), TableError> {
        debug_assert!(!self.closed);
        self.closed = true;
        self.status()?;

        let filter_handle = match (self.filter.take(), self.filter_name) {
            (Some(mut filter), Some(name)) => {
                let contents = filter.finish().to_vec();
                // Filter data is probed in place; never compressed.
                Some((name, self.write_raw_block(&contents, Compression::None)?))
            }
            _ => None,
        };

        let mut counter_payload = Vec::new();
        self.counters.encode_to(&mut counter_payload);
        let counter_handle = self.write_raw_block(&counter_payload, Compression::None)?;

        // Metaindex entries must be in key order: "counters..." < "filter...".
        let mut metaindex = BlockBuilder::new(1);
        metaindex.add(
            COUNTER_BLOCK_NAME.as_bytes(),
            &counter_handle.encode_to_vec(),
        );
        if let Some((name, handle)) = filter_handle {
            let key = format!("filter.{name}");
            metaindex.add(key.as_bytes(), &handle.encode_to_vec());
        }
        let metaindex_payload = metaindex.finish().to_vec();
        let metaindex_handle = self.write_block(&metaindex_payload)?;

        let index_payload = self.index_block.finish().to_vec();
        let index_handle = self.write_block(&index_payload)?;

        let footer = Footer {
            metaindex: metaindex_handle,
            index: index_handle,
        };
        let footer_bytes = footer.encode_to_vec();
        let region = self.file.reserve(footer_bytes.len() as u64);
        let result = region.and_then(|mut region| {
            debug_assert_eq!(region.offset(), self.offset);
            region.append(&footer_bytes)
        });
        if let Err(err) = result {
            self.latch(err.clone());
            return Err(err);
        }
        self.offset += footer_bytes.len() as u64;

        if let Err(err) = self.file.finalize() {
            self.latch(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Close without a footer. The caller is expected to unlink the file.
    pub fn abandon(&mut self) {
        self.closed = true;
    }

    pub fn sync(&self) -> Result<(), TableError> {
        self.file.sync()
    }
}
