//! Filter blocks.
//!
//! A filter block holds one filter per 2 KiB window of data-block file
//! offsets, so a reader can probe "might this block contain the key" from
//! the block's handle alone. Layout:
//!
//! ```text
//! [filter 0]
//! [filter 1]
//! ...
//! [fixed32 filter_offset] * num_filters
//! [fixed32 offset_array_start]
//! [u8 base_lg]                        (window = 1 << base_lg)
//! ```
//!
//! Filter contents are opaque to the block format; they are produced and
//! probed by a pluggable [`FilterPolicy`].

use std::sync::Arc;

use crate::coding;
use crate::sst::TableError;

/// Probabilistic membership filter over a set of keys.
pub trait FilterPolicy: Send + Sync {
    /// Name recorded in the metaindex as `filter.<name>`. Changing the
    /// scheme means changing the name.
    fn name(&self) -> &'static str;

    /// Build a filter for `keys`. Must accept an empty slice.
    fn create_filter(&self, keys: &[&[u8]]) -> Vec<u8>;

    /// May return false positives, never false negatives for keys the
    /// filter was built from.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// Bloom filter policy with a fixed false-positive target.
pub struct BloomFilterPolicy {
    fp_rate: f64,
}

/// Keys hashed into the bloom filter are salted with a fixed seed so filter
/// bits are stable across processes.
const BLOOM_SEED: [u8; 32] = *b"sstpipe.bloom.filter.seed.00001\0";

impl BloomFilterPolicy {
    pub fn new(fp_rate: f64) -> Self {
        Self { fp_rate }
    }
}

impl Default for BloomFilterPolicy {
    fn default() -> Self {
        Self::new(0.01)
    }
}

impl FilterPolicy for BloomFilterPolicy {
    fn name(&self) -> &'static str {
        "sstpipe.BloomFilter"
    }

    fn create_filter(&self, keys: &[&[u8]]) -> Vec<u8> {
        if keys.is_empty() {
            return Vec::new();
        }
        let mut bloom: bloomfilter::Bloom<Vec<u8>> =
            bloomfilter::Bloom::new_for_fp_rate_with_seed(keys.len(), self.fp_rate, &BLOOM_SEED);
        for key in keys {
            bloom.set(&key.to_vec());
        }
        bincode::serialize(&bloom).unwrap_or_default()
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        if filter.is_empty() {
            return false;
        }
        match bincode::deserialize::<bloomfilter::Bloom<Vec<u8>>>(filter) {
            Ok(bloom) => bloom.check(&key.to_vec()),
            // Unreadable filters fail open: a false positive is safe.
            Err(_) => true,
        }
    }
}

/// Adapter that strips the 8-byte internal-key tag before delegating, so
/// filters built from the keys handed to the table builder match reader
/// probes by user key.
pub struct InternalFilterPolicy {
    user: Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    pub fn new(user: Arc<dyn FilterPolicy>) -> Self {
        Self { user }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &'static str {
        self.user.name()
    }

    fn create_filter(&self, keys: &[&[u8]]) -> Vec<u8> {
        let stripped: Vec<&[u8]> = keys
            .iter()
            .map(|k| if k.len() >= 8 { &k[..k.len() - 8] } else { *k })
            .collect();
        self.user.create_filter(&stripped)
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        let user_key = if key.len() >= 8 {
            &key[..key.len() - 8]
        } else {
            key
        };
        self.user.key_may_match(user_key, filter)
    }
}

const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

/// Accumulates per-block key sets and emits the filter segment.
///
/// `start_block` / `add_keys` are called only from the serial write phase,
/// in producer order, so the offset -> filter-group mapping is
/// deterministic.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    // Flattened staged keys for the current group.
    keys: Vec<u8>,
    starts: Vec<usize>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        Self {
            policy,
            keys: Vec::new(),
            starts: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Stage one block's keys: a lengths stream plus the packed bytes.
    pub fn add_keys(&mut self, lengths: &[usize], packed: &[u8]) {
        debug_assert_eq!(lengths.iter().sum::<usize>(), packed.len());
        let mut pos = 0usize;
        for &len in lengths {
            self.starts.push(self.keys.len());
            self.keys.extend_from_slice(&packed[pos..pos + len]);
            pos += len;
        }
    }

    /// Close the group covering offsets below `block_offset` and anchor the
    /// next group there.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        debug_assert!(filter_index >= self.filter_offsets.len() as u64);
        while (self.filter_offsets.len() as u64) < filter_index {
            self.generate_filter();
        }
    }

    pub fn finish(&mut self) -> &[u8] {
        if !self.starts.is_empty() {
            self.generate_filter();
        }
        let array_offset = self.result.len() as u32;
        let offsets = std::mem::take(&mut self.filter_offsets);
        for offset in &offsets {
            coding::put_fixed32(&mut self.result, *offset);
        }
        coding::put_fixed32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG);
        &self.result
    }

    fn generate_filter(&mut self) {
        let num_keys = self.starts.len();
        self.filter_offsets.push(self.result.len() as u32);
        if num_keys == 0 {
            return;
        }

        self.starts.push(self.keys.len());
        let key_slices: Vec<&[u8]> = (0..num_keys)
            .map(|i| &self.keys[self.starts[i]..self.starts[i + 1]])
            .collect();
        let filter = self.policy.create_filter(&key_slices);
        self.result.extend_from_slice(&filter);

        self.keys.clear();
        self.starts.clear();
    }
}

/// Probes a finished filter segment by data-block offset.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    array_offset: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    pub fn new(policy: Arc<dyn FilterPolicy>, data: Vec<u8>) -> Result<Self, TableError> {
        if data.len() < 5 {
            return Err(TableError::Corruption("filter block too small"));
        }
        let base_lg = data[data.len() - 1];
        let array_offset = coding::decode_fixed32(&data[data.len() - 5..]) as usize;
        if array_offset > data.len() - 5 {
            return Err(TableError::Corruption("filter offset array out of bounds"));
        }
        let num_filters = (data.len() - 5 - array_offset) / 4;
        Ok(Self {
            policy,
            data,
            array_offset,
            num_filters,
            base_lg,
        })
    }

    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            // Offsets past the last filter have no information.
            return true;
        }
        let entry = self.array_offset + index * 4;
        let start = coding::decode_fixed32(&self.data[entry..]) as usize;
        let end = if index + 1 < self.num_filters {
            coding::decode_fixed32(&self.data[entry + 4..]) as usize
        } else {
            self.array_offset
        };
        if start > end || end > self.array_offset {
            return true;
        }
        if start == end {
            // Empty filter covers no keys.
            return false;
        }
        self.policy.key_may_match(key, &self.data[start..end])
    }
}
