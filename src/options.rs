//! Build configuration recognized by the table builder.

use std::sync::Arc;

use crate::sst::filter::FilterPolicy;
use crate::sst::Compression;

#[derive(Clone)]
pub struct Options {
    /// Soft cap for a data block's uncompressed payload.
    pub block_size: usize,

    /// Records between absolute (non-prefix-compressed) keys inside a block.
    pub restart_interval: usize,

    pub compression: Compression,

    /// When set, a filter block keyed by data-block offset is emitted and
    /// referenced from the metaindex as `filter.<name>`.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// Hint for the writable file's preallocation chunk.
    pub write_buffer_size: usize,

    /// Number of block slots in the pipeline ring.
    pub ring_size: usize,

    /// Number of compression/write worker threads.
    pub worker_count: usize,

    /// Level of the output file. Informational; reserved for cross-builder
    /// prioritization.
    pub priority_level: u8,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024,
            restart_interval: 16,
            compression: Compression::Snappy,
            filter_policy: None,
            write_buffer_size: 4 * 1024 * 1024,
            ring_size: 4,
            worker_count: 2,
            priority_level: 0,
        }
    }
}
